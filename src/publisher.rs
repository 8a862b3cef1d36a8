//! 事件发布器 (Event Publisher)
//!
//! 每路流一条发布通道 (lane): 有界队列 + 独立 I/O 线程, 保证同一路流按序发布.
//! I/O 线程等待 broker 确认, 失败按退避策略重试; 重试耗尽后作为流级告警上报,
//! 流继续运行.
//!
//! 队列满时按背压策略处理:
//! - DropNewest: 丢弃新消息
//! - DropOldest: 丢弃队列中最早的消息
//! - Block:      等待最多 `send_timeout`; 调用方 (设备推理线程) 在此期间阻塞,
//!   同一设备上的其他流随之推迟

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};
use serde::{Deserialize, Serialize};

use crate::config::{DropPolicy, PublisherConfig, RetryPolicy};
use crate::error::{PipelineError, PublishError};
use crate::pipeline::events::DropReason;
use crate::stream::StreamEntry;
use crate::types::{FrameDetections, StreamId};
use crate::xbus::MessageBus;

/// 空闲时检查流是否结束的间隔
const LANE_IDLE: Duration = Duration::from_millis(50);

/// 线上格式中的单个检测框
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireDetection {
    pub class_id: u32,
    pub score: f32,
    /// 归一化 [x_min, y_min, x_max, y_max]
    #[serde(rename = "box")]
    pub bbox: [f32; 4],
}

/// 每帧一条的事件消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    pub stream_id: StreamId,
    pub epoch: u32,
    pub frame_seq: u64,
    pub timestamp: u64,
    pub detections: Vec<WireDetection>,
}

impl From<&FrameDetections> for EventMessage {
    fn from(fd: &FrameDetections) -> Self {
        Self {
            stream_id: fd.stream.clone(),
            epoch: fd.epoch,
            frame_seq: fd.seq,
            timestamp: fd.timestamp_ms,
            detections: fd
                .detections
                .iter()
                .map(|d| WireDetection {
                    class_id: d.class_id,
                    score: d.score,
                    bbox: d.normalized,
                })
                .collect(),
        }
    }
}

/// 丢帧标记 (发布在 `<topic>.drops`)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DropMarker {
    pub stream_id: StreamId,
    pub epoch: u32,
    pub frame_seq: u64,
    pub timestamp: u64,
    pub reason: DropReason,
}

struct Lane {
    serial: u64,
    tx: Sender<FrameDetections>,
    /// 与 I/O 线程共享, 用于 DropOldest 驱逐
    rx: Receiver<FrameDetections>,
    handle: Option<JoinHandle<()>>,
}

struct Shared {
    bus: Arc<dyn MessageBus>,
    config: PublisherConfig,
    lanes: Mutex<HashMap<StreamId, Lane>>,
    abort: AtomicBool,
    discarded: AtomicU64,
}

impl Shared {
    fn lanes(&self) -> MutexGuard<'_, HashMap<StreamId, Lane>> {
        self.lanes.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn record_drop(&self, entry: &StreamEntry, epoch: u32, seq: u64, ts: u64, reason: DropReason) {
        entry.record_drop(epoch, seq, reason);
        if !self.config.drop_markers {
            return;
        }
        let marker = DropMarker {
            stream_id: entry.id().clone(),
            epoch,
            frame_seq: seq,
            timestamp: ts,
            reason,
        };
        match serde_json::to_vec(&marker) {
            // 丢帧标记不等待确认
            Ok(payload) => {
                let _ = self
                    .bus
                    .publish(&self.config.drop_topic(), entry.id().as_str(), payload);
            }
            Err(e) => tracing::warn!(error = %e, "cannot serialize drop marker"),
        }
    }

    fn settle_dropped(&self, entry: &StreamEntry, fd: &FrameDetections, reason: DropReason) {
        self.record_drop(entry, fd.epoch, fd.seq, fd.timestamp_ms, reason);
        entry.frame_settled();
        entry.try_complete_drain();
    }

    /// 发布一帧, 直到确认或重试耗尽
    fn deliver(&self, entry: &StreamEntry, fd: &FrameDetections) -> Result<(), PublishError> {
        let payload = serde_json::to_vec(&EventMessage::from(fd))?;
        let retry: RetryPolicy = self.config.retry_policy();
        let timeout = self.config.send_timeout();

        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self
                .bus
                .publish(&self.config.topic, entry.id().as_str(), payload.clone())
                .wait(timeout);
            let last = match result {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            if attempt > retry.max_retries || self.abort.load(Ordering::Acquire) {
                return Err(PublishError::Undelivered {
                    stream: entry.id().clone(),
                    epoch: fd.epoch,
                    seq: fd.seq,
                    attempts: attempt,
                    last,
                });
            }
            tracing::debug!(stream = %entry.id(), seq = fd.seq, attempt, error = %last, "publish retry");
            self.pause(retry.delay(attempt));
        }
    }

    /// 可被 abort 打断的睡眠
    fn pause(&self, total: Duration) {
        let deadline = Instant::now() + total;
        while !self.abort.load(Ordering::Acquire) {
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            std::thread::sleep((deadline - now).min(Duration::from_millis(10)));
        }
    }

    fn run_lane(&self, entry: Arc<StreamEntry>, serial: u64, rx: Receiver<FrameDetections>) {
        loop {
            if self.abort.load(Ordering::Acquire) {
                for fd in rx.try_iter() {
                    self.discarded.fetch_add(1, Ordering::Relaxed);
                    self.settle_dropped(&entry, &fd, DropReason::Shutdown);
                }
                break;
            }
            match rx.recv_timeout(LANE_IDLE) {
                Ok(fd) => {
                    match self.deliver(&entry, &fd) {
                        Ok(()) => {
                            entry.record_published(fd.epoch, fd.seq);
                        }
                        Err(e) => entry.record_publish_failure(fd.epoch, fd.seq, e.to_string()),
                    }
                    entry.frame_settled();
                    entry.try_complete_drain();
                }
                Err(RecvTimeoutError::Timeout) => {
                    if entry.state().is_terminal() && entry.in_flight() == 0 {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let mut lanes = self.lanes();
        if lanes.get(entry.id()).map(|l| l.serial) == Some(serial) {
            lanes.remove(entry.id());
        }
        tracing::debug!(stream = %entry.id(), "publisher lane closed");
    }
}

pub struct Publisher {
    shared: Arc<Shared>,
    policy: DropPolicy,
    next_serial: AtomicU64,
    /// 已退出通道的线程句柄, 关闭时统一 join
    finished: Mutex<Vec<JoinHandle<()>>>,
}

impl Publisher {
    pub fn new(bus: Arc<dyn MessageBus>, config: PublisherConfig, policy: DropPolicy) -> Self {
        Self {
            shared: Arc::new(Shared {
                bus,
                config,
                lanes: Mutex::new(HashMap::new()),
                abort: AtomicBool::new(false),
                discarded: AtomicU64::new(0),
            }),
            policy,
            next_serial: AtomicU64::new(0),
            finished: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.shared.config
    }

    /// 为一路流创建发布通道与 I/O 线程
    pub fn open_lane(&self, entry: Arc<StreamEntry>) -> Result<(), PipelineError> {
        let (tx, rx) = bounded(self.shared.config.queue_capacity.max(1));
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let id = entry.id().clone();

        // 先登记再启动线程, 线程退出时按 serial 注销
        let mut lanes = self.shared.lanes();
        if let Some(old) = lanes.insert(
            id.clone(),
            Lane {
                serial,
                tx,
                rx: rx.clone(),
                handle: None,
            },
        ) {
            self.retire(old);
        }

        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name(format!("publish-{id}"))
            .spawn(move || shared.run_lane(entry, serial, rx))
            .map_err(|source| {
                lanes.remove(&id);
                PipelineError::Spawn {
                    what: "publisher",
                    source,
                }
            })?;
        if let Some(lane) = lanes.get_mut(&id) {
            lane.handle = Some(handle);
        } else {
            self.finished
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push(handle);
        }
        Ok(())
    }

    fn retire(&self, lane: Lane) {
        if let Some(handle) = lane.handle {
            self.finished
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push(handle);
        }
    }

    /// 关闭某路流的发布通道; 队列中剩余消息仍会发布
    pub fn close_lane(&self, stream: &StreamId) {
        let lane = self.shared.lanes().remove(stream);
        if let Some(lane) = lane {
            self.retire(lane);
        }
    }

    /// 把一帧检测结果放入该流的发布队列
    ///
    /// 调用前该帧已计入流的在途帧数; 无论成功还是丢弃, 在途计数最终都会结算.
    pub fn publish(&self, entry: &StreamEntry, fd: FrameDetections) -> Result<(), PublishError> {
        let lane = self
            .shared
            .lanes()
            .get(entry.id())
            .map(|l| (l.tx.clone(), l.rx.clone()));
        let Some((tx, rx)) = lane else {
            self.shared.settle_dropped(entry, &fd, DropReason::Shutdown);
            return Err(PublishError::NoLane(entry.id().clone()));
        };

        let fd = match self.policy {
            DropPolicy::DropNewest => match tx.try_send(fd) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(fd)) => {
                    self.shared
                        .settle_dropped(entry, &fd, DropReason::PublisherQueueFull);
                    return Ok(());
                }
                Err(TrySendError::Disconnected(fd)) => fd,
            },
            DropPolicy::DropOldest => {
                let mut fd = fd;
                loop {
                    match tx.try_send(fd) {
                        Ok(()) => return Ok(()),
                        Err(TrySendError::Full(back)) => {
                            match rx.try_recv() {
                                Ok(oldest) => self.shared.settle_dropped(
                                    entry,
                                    &oldest,
                                    DropReason::PublisherQueueFull,
                                ),
                                // I/O 线程刚好取走了一条, 重试即可
                                Err(_) => std::thread::yield_now(),
                            }
                            fd = back;
                        }
                        Err(TrySendError::Disconnected(back)) => break back,
                    }
                }
            }
            DropPolicy::Block => match tx.send_timeout(fd, self.shared.config.send_timeout()) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(fd)) => {
                    self.shared
                        .settle_dropped(entry, &fd, DropReason::PublisherQueueFull);
                    return Ok(());
                }
                Err(SendTimeoutError::Disconnected(fd)) => fd,
            },
        };

        self.shared.settle_dropped(entry, &fd, DropReason::Shutdown);
        Err(PublishError::LaneClosed(entry.id().clone()))
    }

    /// 记录一次未进入流水线的丢帧 (不影响在途计数)
    pub fn record_drop(&self, entry: &StreamEntry, epoch: u32, seq: u64, ts: u64, reason: DropReason) {
        self.shared.record_drop(entry, epoch, seq, ts, reason);
    }

    /// 丢弃一帧已计入在途计数的帧
    pub fn discard(&self, entry: &StreamEntry, epoch: u32, seq: u64, ts: u64, reason: DropReason) {
        self.shared.record_drop(entry, epoch, seq, ts, reason);
        entry.frame_settled();
        entry.try_complete_drain();
    }

    /// 关闭所有通道并等待队列发布完毕; 超时返回 false
    pub fn shutdown(&self, deadline: Instant) -> bool {
        let lanes: Vec<Lane> = self.shared.lanes().drain().map(|(_, l)| l).collect();
        for lane in lanes {
            self.retire(lane);
        }

        let handles = std::mem::take(&mut *self.finished.lock().unwrap_or_else(|p| p.into_inner()));
        while Instant::now() < deadline && !handles.iter().all(JoinHandle::is_finished) {
            std::thread::sleep(Duration::from_millis(5));
        }
        let clean = handles.iter().all(JoinHandle::is_finished);
        if !clean {
            tracing::warn!("⚠️ publisher queues not drained before deadline, aborting");
            self.abort();
            let grace = Instant::now() + self.shared.config.send_timeout();
            while Instant::now() < grace && !handles.iter().all(JoinHandle::is_finished) {
                std::thread::sleep(Duration::from_millis(5));
            }
        }
        // 仍在运行的线程被分离
        for handle in handles.into_iter().filter(|h| h.is_finished()) {
            let _ = handle.join();
        }
        clean
    }

    /// 放弃所有排队消息
    pub fn abort(&self) {
        self.shared.abort.store(true, Ordering::Release);
    }

    /// 强制关闭时丢弃的消息数
    pub fn discarded(&self) -> u64 {
        self.shared.discarded.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{Bbox, Detection};
    use crate::pipeline::events::{self, PipelineEvent};
    use crate::xbus::InMemoryBus;

    fn config() -> PublisherConfig {
        PublisherConfig {
            topic: "detections".into(),
            queue_capacity: 8,
            send_timeout_ms: 100,
            max_retries: 2,
            backoff_ms: 1,
            drop_markers: false,
        }
    }

    fn entry(sink: events::EventSink) -> Arc<StreamEntry> {
        let e = Arc::new(StreamEntry::new("cam".into(), "synthetic://4x4", 0, "cpu:0", sink));
        e.activate();
        e
    }

    fn frame(entry: &StreamEntry, seq: u64) -> FrameDetections {
        entry.frame_admitted();
        FrameDetections {
            stream: entry.id().clone(),
            epoch: 0,
            seq,
            timestamp_ms: 1_700_000_000_000 + seq,
            detections: vec![Detection {
                class_id: 2,
                score: 0.5,
                bbox: Bbox::new(10., 10., 20., 20.),
                normalized: [0.1, 0.1, 0.3, 0.3],
                stream: entry.id().clone(),
                frame_seq: seq,
            }],
        }
    }

    fn wait_for(mut f: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !f() {
            assert!(Instant::now() < deadline, "condition not reached");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_wire_format() {
        let (sink, _rx) = events::channel(8);
        let e = entry(sink);
        let msg = EventMessage::from(&frame(&e, 7));
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["stream_id"], "cam");
        assert_eq!(v["epoch"], 0);
        assert_eq!(v["frame_seq"], 7);
        assert_eq!(v["detections"][0]["class_id"], 2);
        assert!(v["detections"][0]["box"].is_array());
    }

    #[test]
    fn test_publishes_in_order() {
        let bus = InMemoryBus::new();
        let (sink, _rx) = events::channel(64);
        let e = entry(sink);
        let publisher = Publisher::new(bus.clone(), config(), DropPolicy::Block);
        publisher.open_lane(e.clone()).unwrap();

        for seq in 0..20 {
            publisher.publish(&e, frame(&e, seq)).unwrap();
        }
        wait_for(|| e.snapshot().published == 20);
        assert_eq!(e.in_flight(), 0);

        let seqs: Vec<u64> = bus
            .messages("detections")
            .iter()
            .map(|m| serde_json::from_slice::<EventMessage>(&m.payload).unwrap().frame_seq)
            .collect();
        assert_eq!(seqs, (0..20).collect::<Vec<_>>());
        assert!(publisher.shutdown(Instant::now() + Duration::from_secs(2)));
    }

    #[test]
    fn test_retry_exhaustion_is_a_warning() {
        let bus = InMemoryBus::new();
        let (sink, rx) = events::channel(64);
        let e = entry(sink);
        let publisher = Publisher::new(bus.clone(), config(), DropPolicy::Block);
        publisher.open_lane(e.clone()).unwrap();

        // 1 次发布 + 2 次重试全部失败
        bus.fail_next(3);
        publisher.publish(&e, frame(&e, 0)).unwrap();
        publisher.publish(&e, frame(&e, 1)).unwrap();
        wait_for(|| e.snapshot().published == 1);

        let snap = e.snapshot();
        assert_eq!(snap.publish_failed, 1);
        assert_eq!(snap.last_published, Some((0, 1)));
        assert!(rx.try_iter().any(|ev| matches!(
            ev,
            PipelineEvent::PublishFailed { seq: 0, .. }
        )));
        assert_eq!(bus.attempts(), 4);
        publisher.shutdown(Instant::now() + Duration::from_secs(2));
    }

    #[test]
    fn test_full_queue_drops_newest() {
        let bus = InMemoryBus::new();
        bus.set_available(false);
        let (sink, _rx) = events::channel(64);
        let e = entry(sink);
        let cfg = PublisherConfig {
            queue_capacity: 1,
            max_retries: 50,
            backoff_ms: 20,
            ..config()
        };
        let publisher = Publisher::new(bus.clone(), cfg, DropPolicy::DropNewest);
        publisher.open_lane(e.clone()).unwrap();

        // 第一帧被 I/O 线程取走并卡在重试中, 第二帧占满队列, 第三帧被丢弃
        publisher.publish(&e, frame(&e, 0)).unwrap();
        wait_for(|| bus.attempts() > 0);
        publisher.publish(&e, frame(&e, 1)).unwrap();
        publisher.publish(&e, frame(&e, 2)).unwrap();
        assert_eq!(e.snapshot().dropped_backpressure, 1);

        bus.set_available(true);
        wait_for(|| e.snapshot().published == 2);
        assert_eq!(e.snapshot().last_published, Some((0, 1)));
        publisher.shutdown(Instant::now() + Duration::from_secs(2));
    }

    #[test]
    fn test_drop_markers_on_separate_topic() {
        let bus = InMemoryBus::new();
        let (sink, _rx) = events::channel(8);
        let e = entry(sink);
        let cfg = PublisherConfig {
            drop_markers: true,
            ..config()
        };
        let publisher = Publisher::new(bus.clone(), cfg, DropPolicy::DropNewest);
        publisher.record_drop(&e, 0, 4, 99, DropReason::Backpressure);

        let markers = bus.messages("detections.drops");
        assert_eq!(markers.len(), 1);
        let v: serde_json::Value = serde_json::from_slice(&markers[0].payload).unwrap();
        assert_eq!(v["frame_seq"], 4);
        assert_eq!(v["reason"], "backpressure");
        assert!(bus.messages("detections").is_empty());
    }

    #[test]
    fn test_publish_without_lane_settles_frame() {
        let bus = InMemoryBus::new();
        let (sink, _rx) = events::channel(8);
        let e = entry(sink);
        let publisher = Publisher::new(bus, config(), DropPolicy::DropNewest);
        let err = publisher.publish(&e, frame(&e, 0)).unwrap_err();
        assert!(matches!(err, PublishError::NoLane(_)));
        assert_eq!(e.in_flight(), 0);
    }

    #[test]
    fn test_block_times_out_then_drops() {
        let bus = InMemoryBus::new();
        bus.set_available(false);
        let (sink, rx) = events::channel(64);
        let e = entry(sink);
        let cfg = PublisherConfig {
            queue_capacity: 1,
            max_retries: 50,
            backoff_ms: 20,
            ..config()
        };
        let publisher = Publisher::new(bus.clone(), cfg, DropPolicy::Block);
        publisher.open_lane(e.clone()).unwrap();

        publisher.publish(&e, frame(&e, 0)).unwrap();
        wait_for(|| bus.attempts() > 0);
        publisher.publish(&e, frame(&e, 1)).unwrap();

        // 队列已满: 等待 send_timeout 后丢弃
        let t = Instant::now();
        publisher.publish(&e, frame(&e, 2)).unwrap();
        assert!(t.elapsed() >= Duration::from_millis(90));
        assert_eq!(e.snapshot().dropped_backpressure, 1);
        assert!(rx.try_iter().any(|ev| matches!(
            ev,
            PipelineEvent::FrameDropped {
                seq: 2,
                reason: DropReason::PublisherQueueFull,
                ..
            }
        )));

        bus.set_available(true);
        wait_for(|| e.snapshot().published == 2);
        assert_eq!(e.snapshot().last_published, Some((0, 1)));
        assert_eq!(e.in_flight(), 0);
        publisher.shutdown(Instant::now() + Duration::from_secs(2));
    }
}
