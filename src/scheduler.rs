//! 批调度器 (Batching Scheduler)
//!
//! 每个推理设备一个调度器, 收集绑定到该设备的所有流的就绪帧.
//! 批次在以下任一条件满足时关闭:
//! - 待处理帧数达到 `max_batch`
//! - 最早的待处理帧已等待 `max_wait`
//!
//! 跨流轮询取帧, 同一路流内严格 FIFO.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::types::{Batch, Frame, StreamId};

#[derive(Default)]
struct SchedState {
    queues: BTreeMap<StreamId, VecDeque<Frame>>,
    /// 上一批最后取帧的流
    cursor: Option<StreamId>,
    pending: usize,
    closed: bool,
}

impl SchedState {
    fn oldest_arrival(&self) -> Option<Instant> {
        self.queues
            .values()
            .filter_map(|q| q.front().map(|f| f.arrived))
            .min()
    }

    fn take(&mut self, n: usize) -> Vec<Frame> {
        let mut order: Vec<StreamId> = self
            .queues
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        if let Some(cursor) = &self.cursor {
            let start = order.partition_point(|id| id <= cursor);
            order.rotate_left(start);
        }

        let mut frames = Vec::with_capacity(n);
        'outer: while frames.len() < n {
            let mut progressed = false;
            for id in &order {
                if frames.len() == n {
                    break 'outer;
                }
                if let Some(frame) = self.queues.get_mut(id).and_then(VecDeque::pop_front) {
                    self.cursor = Some(id.clone());
                    frames.push(frame);
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        self.pending -= frames.len();
        self.queues.retain(|_, q| !q.is_empty());
        frames
    }
}

pub struct BatchScheduler {
    device: String,
    max_batch: usize,
    max_wait: Duration,
    state: Mutex<SchedState>,
    ready: Condvar,
}

impl BatchScheduler {
    pub fn new(device: impl Into<String>, max_batch: usize, max_wait: Duration) -> Self {
        Self {
            device: device.into(),
            max_batch: max_batch.max(1),
            max_wait,
            state: Mutex::new(SchedState::default()),
            ready: Condvar::new(),
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn max_batch(&self) -> usize {
        self.max_batch
    }

    fn lock(&self) -> MutexGuard<'_, SchedState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// 提交一帧; 调度器已关闭时原样退回
    pub fn submit(&self, frame: Frame) -> Result<(), Frame> {
        let mut state = self.lock();
        if state.closed {
            return Err(frame);
        }
        state
            .queues
            .entry(frame.stream.clone())
            .or_default()
            .push_back(frame);
        state.pending += 1;
        drop(state);
        self.ready.notify_all();
        Ok(())
    }

    /// 阻塞直到下一批就绪; 关闭且清空后返回 `None`
    pub fn next_batch(&self) -> Option<Batch> {
        let mut state = self.lock();
        loop {
            if state.pending >= self.max_batch {
                return Some(Batch::new(state.take(self.max_batch)));
            }
            if state.pending > 0 {
                let deadline = state
                    .oldest_arrival()
                    .map(|t| t + self.max_wait)
                    .unwrap_or_else(Instant::now);
                let now = Instant::now();
                if state.closed || now >= deadline {
                    let n = state.pending.min(self.max_batch);
                    return Some(Batch::new(state.take(n)));
                }
                state = self
                    .ready
                    .wait_timeout(state, deadline - now)
                    .map(|(guard, _)| guard)
                    .unwrap_or_else(|p| p.into_inner().0);
                continue;
            }
            if state.closed {
                return None;
            }
            state = self.ready.wait(state).unwrap_or_else(|p| p.into_inner());
        }
    }

    /// 移除某路流最早的待处理帧 (drop-oldest 策略)
    pub fn evict_oldest(&self, stream: &StreamId) -> Option<Frame> {
        let mut state = self.lock();
        let frame = state.queues.get_mut(stream)?.pop_front()?;
        state.pending -= 1;
        Some(frame)
    }

    /// 移除某路流的全部待处理帧
    pub fn purge_stream(&self, stream: &StreamId) -> Vec<Frame> {
        let mut state = self.lock();
        let frames: Vec<Frame> = state
            .queues
            .remove(stream)
            .map(Vec::from)
            .unwrap_or_default();
        state.pending -= frames.len();
        frames
    }

    /// 停止接收新帧; 待处理帧仍会以批次形式交付
    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }

    /// 取出所有待处理帧 (强制关闭)
    pub fn drain_all(&self) -> Vec<Frame> {
        let mut state = self.lock();
        state.closed = true;
        state.pending = 0;
        state.cursor = None;
        let frames = std::mem::take(&mut state.queues)
            .into_values()
            .flatten()
            .collect();
        drop(state);
        self.ready.notify_all();
        frames
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn pending(&self) -> usize {
        self.lock().pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Acquire, FramePool};
    use crate::types::Letterbox;
    use std::sync::Arc;

    struct Fixture {
        pool: FramePool,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                pool: FramePool::new(64, 1).unwrap(),
            }
        }

        fn frame(&self, stream: &str, seq: u64) -> Frame {
            let Acquire::Slot(slot) = self.pool.acquire().unwrap() else {
                panic!("pool exhausted");
            };
            Frame::new(
                StreamId::new(stream),
                0,
                seq,
                0,
                slot,
                Letterbox {
                    ratio: 1.0,
                    src_width: 1,
                    src_height: 1,
                },
            )
        }
    }

    fn ids(batch: &Batch) -> Vec<(String, u64)> {
        batch
            .frames()
            .iter()
            .map(|f| (f.stream.to_string(), f.seq))
            .collect()
    }

    #[test]
    fn test_batch_closes_at_max_batch() {
        let fx = Fixture::new();
        let sched = BatchScheduler::new("cpu:0", 2, Duration::from_secs(60));
        for seq in 0..3 {
            sched.submit(fx.frame("a", seq)).unwrap();
        }
        let batch = sched.next_batch().unwrap();
        assert_eq!(ids(&batch), vec![("a".into(), 0), ("a".into(), 1)]);
        assert_eq!(sched.pending(), 1);
    }

    #[test]
    fn test_batch_closes_after_max_wait() {
        let fx = Fixture::new();
        let sched = BatchScheduler::new("cpu:0", 8, Duration::from_millis(30));
        sched.submit(fx.frame("a", 0)).unwrap();
        let started = Instant::now();
        let batch = sched.next_batch().unwrap();
        assert_eq!(batch.len(), 1);
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_round_robin_across_streams() {
        let fx = Fixture::new();
        let sched = BatchScheduler::new("cpu:0", 4, Duration::ZERO);
        for seq in 0..3 {
            sched.submit(fx.frame("a", seq)).unwrap();
        }
        sched.submit(fx.frame("b", 0)).unwrap();
        sched.submit(fx.frame("c", 0)).unwrap();

        let first = sched.next_batch().unwrap();
        assert_eq!(
            ids(&first),
            vec![
                ("a".into(), 0),
                ("b".into(), 0),
                ("c".into(), 0),
                ("a".into(), 1)
            ]
        );
        let second = sched.next_batch().unwrap();
        assert_eq!(ids(&second), vec![("a".into(), 2)]);
    }

    #[test]
    fn test_round_robin_resumes_after_cursor() {
        let fx = Fixture::new();
        let sched = BatchScheduler::new("cpu:0", 1, Duration::ZERO);
        sched.submit(fx.frame("a", 0)).unwrap();
        sched.submit(fx.frame("a", 1)).unwrap();
        sched.submit(fx.frame("b", 0)).unwrap();

        let order: Vec<_> = (0..3)
            .map(|_| ids(&sched.next_batch().unwrap())[0].clone())
            .collect();
        assert_eq!(
            order,
            vec![("a".into(), 0), ("b".into(), 0), ("a".into(), 1)]
        );
    }

    #[test]
    fn test_close_flushes_then_ends() {
        let fx = Fixture::new();
        let sched = BatchScheduler::new("cpu:0", 8, Duration::from_secs(60));
        sched.submit(fx.frame("a", 0)).unwrap();
        sched.close();
        assert!(sched.submit(fx.frame("a", 1)).is_err());
        assert_eq!(sched.next_batch().unwrap().len(), 1);
        assert!(sched.next_batch().is_none());
    }

    #[test]
    fn test_close_wakes_idle_worker() {
        let sched = Arc::new(BatchScheduler::new("cpu:0", 2, Duration::from_millis(5)));
        let s = sched.clone();
        let worker = std::thread::spawn(move || s.next_batch().is_none());
        std::thread::sleep(Duration::from_millis(20));
        sched.close();
        assert!(worker.join().unwrap());
    }

    #[test]
    fn test_evict_and_purge() {
        let fx = Fixture::new();
        let sched = BatchScheduler::new("cpu:0", 8, Duration::from_secs(60));
        sched.submit(fx.frame("a", 0)).unwrap();
        sched.submit(fx.frame("a", 1)).unwrap();
        sched.submit(fx.frame("b", 0)).unwrap();

        assert_eq!(sched.evict_oldest(&StreamId::new("a")).unwrap().seq, 0);
        assert!(sched.evict_oldest(&StreamId::new("z")).is_none());
        assert_eq!(sched.purge_stream(&StreamId::new("b")).len(), 1);
        assert_eq!(sched.pending(), 1);
        assert_eq!(sched.drain_all().len(), 1);
        assert_eq!(sched.pending(), 0);
        assert!(sched.is_closed());
    }
}
