//! 视频源采集线程 (Source adapter)
//!
//! 每路流一个线程: 连接视频源、逐帧做 letterbox 写入缓冲池、提交到所属设备的调度器.
//! 瞬时错误按退避策略重连, 每次重连代数 +1; 连续失败超过上限后流进入 Failed.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::{DropPolicy, RetryPolicy};
use crate::error::{PipelineError, PoolError, SourceError};
use crate::pipeline::events::DropReason;
use crate::pool::{Acquire, FramePool, SlotHandle};
use crate::publisher::Publisher;
use crate::scheduler::BatchScheduler;
use crate::stream::StreamEntry;
use crate::types::{Frame, RawFrame};

use super::letterbox::letterbox_into;
use super::{SourceConnector, VideoSource};

/// Block 策略下每次等待槽位的时长, 期间检查取消标志
const BLOCK_POLL: Duration = Duration::from_millis(100);

/// 读循环的退出方式
enum Exit {
    /// 流结束或被取消, 进入 Draining
    Finished,
    /// 可重连的错误
    Retry(SourceError),
    /// 不可恢复
    Fatal(String),
}

pub struct SourceAdapter {
    entry: Arc<StreamEntry>,
    connector: Arc<dyn SourceConnector>,
    pool: Arc<FramePool>,
    scheduler: Arc<BatchScheduler>,
    publisher: Arc<Publisher>,
    retry: RetryPolicy,
    policy: DropPolicy,
    input_width: u32,
    input_height: u32,
}

impl SourceAdapter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        entry: Arc<StreamEntry>,
        connector: Arc<dyn SourceConnector>,
        pool: Arc<FramePool>,
        scheduler: Arc<BatchScheduler>,
        publisher: Arc<Publisher>,
        retry: RetryPolicy,
        policy: DropPolicy,
        input_size: (u32, u32),
    ) -> Self {
        Self {
            entry,
            connector,
            pool,
            scheduler,
            publisher,
            retry,
            policy,
            input_width: input_size.0,
            input_height: input_size.1,
        }
    }

    /// 启动采集线程
    pub fn spawn(self) -> Result<JoinHandle<()>, PipelineError> {
        std::thread::Builder::new()
            .name(format!("source-{}", self.entry.id()))
            .spawn(move || self.run())
            .map_err(|source| PipelineError::Spawn {
                what: "source",
                source,
            })
    }

    fn run(self) {
        let entry = &self.entry;
        tracing::info!(stream = %entry.id(), uri = entry.uri(), "🎬 source started");

        // 连续失败次数, 成功读到一帧后清零
        let mut failures = 0u32;
        let mut connected_once = false;
        let fatal = loop {
            if entry.is_cancelled() {
                break None;
            }
            let mut source = match self.connector.connect(entry.uri()) {
                Ok(source) => source,
                Err(e) if e.is_transient() => match self.backoff(&mut failures, &e) {
                    Some(reason) => break Some(reason),
                    None => continue,
                },
                Err(e) => break Some(e.to_string()),
            };
            if connected_once {
                let epoch = entry.reconnect();
                tracing::info!(stream = %entry.id(), epoch, "🔄 source reconnected");
            } else {
                tracing::info!(stream = %entry.id(), "✅ source connected");
            }
            connected_once = true;
            entry.activate();

            match self.read_loop(source.as_mut(), &mut failures) {
                Exit::Finished => break None,
                Exit::Retry(e) => {
                    if let Some(reason) = self.backoff(&mut failures, &e) {
                        break Some(reason);
                    }
                }
                Exit::Fatal(reason) => break Some(reason),
            }
        };

        if let Some(reason) = fatal {
            entry.fail(reason);
            self.purge();
        }
        entry.mark_source_done();
        entry.begin_drain();
        entry.try_complete_drain();
        tracing::info!(stream = %entry.id(), state = ?entry.state(), "source stopped");
    }

    /// 流失败后丢弃其尚未进入批次的帧
    fn purge(&self) {
        for frame in self.scheduler.purge_stream(self.entry.id()) {
            if let Err(e) = self.pool.release(frame.slot) {
                tracing::error!(stream = %self.entry.id(), error = %e, "❌ slot release failed");
            }
            self.publisher.discard(
                &self.entry,
                frame.epoch,
                frame.seq,
                frame.timestamp_ms,
                DropReason::Shutdown,
            );
        }
    }

    /// 记录一次失败并等待退避时间; 超过上限返回失败原因
    fn backoff(&self, failures: &mut u32, error: &SourceError) -> Option<String> {
        *failures += 1;
        if *failures > self.retry.max_retries {
            return Some(format!(
                "giving up after {} consecutive failures: {error}",
                *failures
            ));
        }
        let delay = self.retry.delay(*failures);
        tracing::warn!(
            stream = %self.entry.id(),
            attempt = *failures,
            ?delay,
            %error,
            "⚠️ source error, retrying"
        );
        let deadline = Instant::now() + delay;
        while !self.entry.is_cancelled() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep((deadline - now).min(Duration::from_millis(10)));
        }
        None
    }

    fn read_loop(&self, source: &mut dyn VideoSource, failures: &mut u32) -> Exit {
        loop {
            if self.entry.is_cancelled() {
                return Exit::Finished;
            }
            match source.next_frame() {
                Ok(Some(raw)) => {
                    *failures = 0;
                    if let Err(e) = self.admit(raw) {
                        return Exit::Fatal(e.to_string());
                    }
                }
                Ok(None) => {
                    tracing::info!(stream = %self.entry.id(), "source reached end of stream");
                    return Exit::Finished;
                }
                Err(e) if e.is_skippable() => {
                    let (epoch, seq) = self.entry.next_frame_id();
                    tracing::debug!(stream = %self.entry.id(), seq, error = %e, "frame skipped");
                    self.publisher.record_drop(
                        &self.entry,
                        epoch,
                        seq,
                        crate::types::now_millis(),
                        DropReason::DecodeError,
                    );
                }
                Err(e) if e.is_transient() => return Exit::Retry(e),
                Err(e) => return Exit::Fatal(e.to_string()),
            }
        }
    }

    /// 一帧进入流水线: 取槽位 → letterbox → 提交调度器
    fn admit(&self, raw: RawFrame) -> Result<(), PoolError> {
        let entry = &self.entry;
        let (epoch, seq) = entry.next_frame_id();
        let ts = raw.timestamp_ms;

        let Some(slot) = self.acquire_slot(epoch, seq, ts)? else {
            return Ok(());
        };

        let letterbox = match self
            .pool
            .write(slot, |dst| letterbox_into(&raw, dst, self.input_width, self.input_height))
        {
            Ok(Ok(lb)) => lb,
            Ok(Err(e)) => {
                self.pool.release(slot)?;
                tracing::debug!(stream = %entry.id(), seq, error = %e, "frame rejected");
                self.publisher
                    .record_drop(entry, epoch, seq, ts, DropReason::DecodeError);
                return Ok(());
            }
            Err(e) => {
                let _ = self.pool.release(slot);
                return Err(e);
            }
        };

        entry.frame_admitted();
        let frame = Frame::new(entry.id().clone(), epoch, seq, ts, slot, letterbox);
        if let Err(frame) = self.scheduler.submit(frame) {
            self.pool.release(frame.slot)?;
            self.publisher
                .discard(entry, epoch, seq, ts, DropReason::Shutdown);
        }
        Ok(())
    }

    /// 按背压策略取一个槽位; `None` 表示该帧已被丢弃
    fn acquire_slot(&self, epoch: u32, seq: u64, ts: u64) -> Result<Option<SlotHandle>, PoolError> {
        let entry = &self.entry;
        let busy = match self.policy {
            DropPolicy::DropNewest => match self.pool.acquire()? {
                Acquire::Slot(h) => return Ok(Some(h)),
                Acquire::Busy => DropReason::Backpressure,
            },
            DropPolicy::DropOldest => match self.pool.acquire()? {
                Acquire::Slot(h) => return Ok(Some(h)),
                // 复用本流最早的待处理帧的槽位
                Acquire::Busy => match self.scheduler.evict_oldest(entry.id()) {
                    Some(old) => {
                        self.publisher.discard(
                            entry,
                            old.epoch,
                            old.seq,
                            old.timestamp_ms,
                            DropReason::Backpressure,
                        );
                        return Ok(Some(old.slot));
                    }
                    None => DropReason::Backpressure,
                },
            },
            DropPolicy::Block => loop {
                if entry.is_cancelled() {
                    break DropReason::Shutdown;
                }
                if let Acquire::Slot(h) = self.pool.acquire_timeout(BLOCK_POLL)? {
                    return Ok(Some(h));
                }
            },
        };
        self.publisher.record_drop(entry, epoch, seq, ts, busy);
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PublisherConfig;
    use crate::input::synthetic::SyntheticConnector;
    use crate::pipeline::events::{self, PipelineEvent};
    use crate::stream::StreamState;
    use crate::types::StreamId;
    use crate::xbus::InMemoryBus;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Fixture {
        entry: Arc<StreamEntry>,
        pool: Arc<FramePool>,
        scheduler: Arc<BatchScheduler>,
        publisher: Arc<Publisher>,
        events: crossbeam_channel::Receiver<PipelineEvent>,
    }

    fn fixture(uri: &str, capacity: usize, policy: DropPolicy) -> Fixture {
        let (sink, events) = events::channel(256);
        let entry = Arc::new(StreamEntry::new(StreamId::new("cam"), uri, 0, "cpu:0", sink));
        let publisher = Arc::new(Publisher::new(
            InMemoryBus::new(),
            PublisherConfig::default(),
            policy,
        ));
        Fixture {
            entry,
            pool: Arc::new(FramePool::new(capacity, 3 * 4 * 4).unwrap()),
            scheduler: Arc::new(BatchScheduler::new("cpu:0", 64, Duration::from_secs(10))),
            publisher,
            events,
        }
    }

    fn adapter(f: &Fixture, connector: Arc<dyn SourceConnector>, policy: DropPolicy) -> SourceAdapter {
        SourceAdapter::new(
            f.entry.clone(),
            connector,
            f.pool.clone(),
            f.scheduler.clone(),
            f.publisher.clone(),
            RetryPolicy::new(2, 1, 2),
            policy,
            (4, 4),
        )
    }

    fn drop_reasons(f: &Fixture) -> Vec<DropReason> {
        f.events
            .try_iter()
            .filter_map(|e| match e {
                PipelineEvent::FrameDropped { reason, .. } => Some(reason),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_frames_reach_scheduler_then_stream_drains() {
        let f = fixture("synthetic://8x8?frames=3", 8, DropPolicy::DropNewest);
        adapter(&f, Arc::new(SyntheticConnector), DropPolicy::DropNewest)
            .spawn()
            .unwrap()
            .join()
            .unwrap();

        assert_eq!(f.scheduler.pending(), 3);
        assert_eq!(f.entry.in_flight(), 3);
        assert_eq!(f.entry.state(), StreamState::Draining);

        let frames = f.scheduler.drain_all();
        let seqs: Vec<u64> = frames.iter().map(|fr| fr.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert_eq!(frames[0].letterbox.ratio, 0.5);
        for frame in frames {
            f.pool.release(frame.slot).unwrap();
            f.entry.frame_settled();
        }
        assert!(f.entry.try_complete_drain());
    }

    #[test]
    fn test_drop_newest_when_pool_is_full() {
        let f = fixture("synthetic://4x4?frames=4", 2, DropPolicy::DropNewest);
        adapter(&f, Arc::new(SyntheticConnector), DropPolicy::DropNewest)
            .spawn()
            .unwrap()
            .join()
            .unwrap();

        let seqs: Vec<u64> = f.scheduler.drain_all().iter().map(|fr| fr.seq).collect();
        assert_eq!(seqs, vec![0, 1]);
        assert_eq!(drop_reasons(&f), vec![DropReason::Backpressure; 2]);
        assert_eq!(f.entry.snapshot().dropped_backpressure, 2);
    }

    #[test]
    fn test_drop_oldest_reuses_pending_slot() {
        let f = fixture("synthetic://4x4?frames=4", 2, DropPolicy::DropOldest);
        adapter(&f, Arc::new(SyntheticConnector), DropPolicy::DropOldest)
            .spawn()
            .unwrap()
            .join()
            .unwrap();

        let seqs: Vec<u64> = f.scheduler.drain_all().iter().map(|fr| fr.seq).collect();
        assert_eq!(seqs, vec![2, 3]);
        assert_eq!(f.entry.in_flight(), 2);
        assert_eq!(f.pool.stats().acquired_total, 2);
    }

    /// 前 `fail` 次连接失败, 之后 `bursts` 次连接各产出 2 帧后断流, 再之后不可恢复
    struct Flaky {
        fail: AtomicU32,
        bursts: AtomicU32,
        connects: AtomicU32,
    }

    struct Burst(u32);

    impl VideoSource for Burst {
        fn next_frame(&mut self) -> Result<Option<RawFrame>, SourceError> {
            if self.0 == 0 {
                return Err(SourceError::Io("connection reset".into()));
            }
            self.0 -= 1;
            Ok(Some(RawFrame {
                rgba: vec![0; 64],
                width: 4,
                height: 4,
                timestamp_ms: 1,
            }))
        }
    }

    fn take_one(n: &AtomicU32) -> bool {
        n.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    impl SourceConnector for Flaky {
        fn connect(&self, uri: &str) -> Result<Box<dyn VideoSource>, SourceError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if take_one(&self.fail) {
                return Err(SourceError::Connect {
                    uri: uri.into(),
                    reason: "refused".into(),
                });
            }
            if take_one(&self.bursts) {
                return Ok(Box::new(Burst(2)));
            }
            Err(SourceError::Unsupported(uri.into()))
        }
    }

    #[test]
    fn test_reconnect_bumps_epoch_and_resets_seq() {
        let f = fixture("flaky://cam", 16, DropPolicy::DropNewest);
        let connector = Arc::new(Flaky {
            fail: AtomicU32::new(1),
            bursts: AtomicU32::new(2),
            connects: AtomicU32::new(0),
        });
        adapter(&f, connector.clone(), DropPolicy::DropNewest)
            .spawn()
            .unwrap()
            .join()
            .unwrap();

        assert_eq!(connector.connects.load(Ordering::SeqCst), 4);
        assert_eq!(f.entry.state(), StreamState::Failed);

        // 流失败后待处理帧被丢弃, 槽位全部归还
        assert_eq!(f.scheduler.pending(), 0);
        assert_eq!(f.entry.in_flight(), 0);
        let stats = f.pool.stats();
        assert_eq!(stats.acquired_total, stats.released_total);

        let mut reconnects = 0;
        let mut purged = Vec::new();
        for event in f.events.try_iter() {
            match event {
                PipelineEvent::Reconnected { epoch: 1, .. } => reconnects += 1,
                PipelineEvent::FrameDropped {
                    epoch,
                    seq,
                    reason: DropReason::Shutdown,
                    ..
                } => purged.push((epoch, seq)),
                _ => {}
            }
        }
        assert_eq!(reconnects, 1);
        assert_eq!(purged, vec![(0, 0), (0, 1), (1, 0), (1, 1)]);
    }

    #[test]
    fn test_consecutive_failures_exhaust_retries() {
        let f = fixture("flaky://cam", 4, DropPolicy::DropNewest);
        let connector = Arc::new(Flaky {
            fail: AtomicU32::new(10),
            bursts: AtomicU32::new(0),
            connects: AtomicU32::new(0),
        });
        adapter(&f, connector.clone(), DropPolicy::DropNewest)
            .spawn()
            .unwrap()
            .join()
            .unwrap();
        // 首次连接 + 2 次重试
        assert_eq!(connector.connects.load(Ordering::SeqCst), 3);
        assert_eq!(f.entry.state(), StreamState::Failed);
        assert!(f.entry.snapshot().failure.unwrap().contains("3 consecutive"));
    }

    #[test]
    fn test_unrecoverable_error_fails_stream() {
        let f = fixture("ftp://nowhere", 4, DropPolicy::DropNewest);
        struct Unsupported;
        impl SourceConnector for Unsupported {
            fn connect(&self, uri: &str) -> Result<Box<dyn VideoSource>, SourceError> {
                Err(SourceError::Unsupported(uri.into()))
            }
        }
        adapter(&f, Arc::new(Unsupported), DropPolicy::DropNewest)
            .spawn()
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(f.entry.state(), StreamState::Failed);
        assert!(f.entry.is_source_done());
    }

    #[test]
    fn test_malformed_uri_fails_without_retry() {
        let f = fixture("synthetic://abc", 4, DropPolicy::DropNewest);
        struct Counting(AtomicU32);
        impl SourceConnector for Counting {
            fn connect(&self, uri: &str) -> Result<Box<dyn VideoSource>, SourceError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                SyntheticConnector.connect(uri)
            }
        }
        let connector = Arc::new(Counting(AtomicU32::new(0)));
        adapter(&f, connector.clone(), DropPolicy::DropNewest)
            .spawn()
            .unwrap()
            .join()
            .unwrap();

        assert_eq!(connector.0.load(Ordering::SeqCst), 1);
        assert_eq!(f.entry.state(), StreamState::Failed);
        let failure = f.entry.snapshot().failure.unwrap();
        assert!(failure.contains("size must be WxH"), "{failure}");
        assert!(!failure.contains("consecutive"), "{failure}");
    }

    #[test]
    fn test_block_waits_for_released_slot() {
        let f = fixture("synthetic://4x4?frames=3", 1, DropPolicy::Block);
        let handle = adapter(&f, Arc::new(SyntheticConnector), DropPolicy::Block)
            .spawn()
            .unwrap();

        // 单槽位: 每取走并归还一帧, 视频源才能产出下一帧
        let mut seqs = Vec::new();
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while seqs.len() < 3 && std::time::Instant::now() < deadline {
            match f.scheduler.evict_oldest(f.entry.id()) {
                Some(frame) => {
                    assert_eq!(f.pool.stats().free, 0);
                    seqs.push(frame.seq);
                    f.pool.release(frame.slot).unwrap();
                    f.entry.frame_settled();
                }
                None => std::thread::sleep(Duration::from_millis(2)),
            }
        }
        handle.join().unwrap();

        assert_eq!(seqs, vec![0, 1, 2]);
        assert!(drop_reasons(&f).is_empty());
        assert_eq!(f.entry.snapshot().dropped_backpressure, 0);
        let stats = f.pool.stats();
        assert_eq!(stats.acquired_total, 3);
        assert_eq!(stats.acquired_total, stats.released_total);
        assert_eq!(f.entry.in_flight(), 0);
    }
}
