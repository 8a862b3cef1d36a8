//! 视频流表 (Stream table)
//!
//! 每路流一条 `StreamEntry`, 由编排器持有, 视频源线程、推理线程、
//! 发布线程通过 `Arc` 共享. 状态机:
//!
//! ```text
//! Connecting → Active → Draining → Closed
//!      └─────────┴──→ Failed
//! ```

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_skiplist::SkipMap;
use serde::Serialize;

use crate::pipeline::events::{DropReason, EventSink, PipelineEvent};
use crate::types::StreamId;

/// 视频流连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StreamState {
    Connecting,
    Active,
    Draining,
    Closed,
    Failed,
}

impl StreamState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamState::Closed | StreamState::Failed)
    }

    /// 是否还接收新帧
    pub fn accepts_frames(&self) -> bool {
        matches!(self, StreamState::Connecting | StreamState::Active)
    }

    fn can_transition(&self, to: StreamState) -> bool {
        use StreamState::*;
        matches!(
            (self, to),
            (Connecting, Active)
                | (Connecting, Draining)
                | (Connecting, Failed)
                | (Active, Draining)
                | (Active, Failed)
                | (Draining, Closed)
        )
    }
}

/// 流状态快照
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamSnapshot {
    pub id: StreamId,
    pub uri: String,
    pub device: String,
    pub state: StreamState,
    pub epoch: u32,
    pub next_seq: u64,
    pub in_flight: u64,
    pub captured: u64,
    pub dropped_backpressure: u64,
    pub dropped_decode: u64,
    pub dropped_other: u64,
    pub published: u64,
    pub publish_failed: u64,
    pub last_published: Option<(u32, u64)>,
    pub failure: Option<String>,
}

#[derive(Default)]
struct Counters {
    captured: AtomicU64,
    dropped_backpressure: AtomicU64,
    dropped_decode: AtomicU64,
    dropped_other: AtomicU64,
    published: AtomicU64,
    publish_failed: AtomicU64,
}

pub struct StreamEntry {
    id: StreamId,
    uri: String,
    device: usize,
    device_name: String,
    state: Mutex<StreamState>,
    failure: Mutex<Option<String>>,
    epoch: AtomicU32,
    next_seq: AtomicU64,
    /// 已进入调度器但尚未发布/丢弃的帧数
    in_flight: AtomicU64,
    source_done: AtomicBool,
    cancel: AtomicBool,
    /// 已被 remove_stream 请求移除
    removed: AtomicBool,
    last_published: Mutex<Option<(u32, u64)>>,
    counters: Counters,
    events: EventSink,
}

impl StreamEntry {
    pub fn new(
        id: StreamId,
        uri: impl Into<String>,
        device: usize,
        device_name: impl Into<String>,
        events: EventSink,
    ) -> Self {
        Self {
            id,
            uri: uri.into(),
            device,
            device_name: device_name.into(),
            state: Mutex::new(StreamState::Connecting),
            failure: Mutex::new(None),
            epoch: AtomicU32::new(0),
            next_seq: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            source_done: AtomicBool::new(false),
            cancel: AtomicBool::new(false),
            removed: AtomicBool::new(false),
            last_published: Mutex::new(None),
            counters: Counters::default(),
            events,
        }
    }

    pub fn id(&self) -> &StreamId {
        &self.id
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// 绑定的推理设备序号
    pub fn device(&self) -> usize {
        self.device
    }

    pub fn state(&self) -> StreamState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn transition(&self, to: StreamState, reason: Option<String>) -> bool {
        let from = {
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            let from = *state;
            if !from.can_transition(to) {
                return false;
            }
            *state = to;
            from
        };
        match to {
            StreamState::Failed => tracing::warn!(
                stream = %self.id,
                reason = reason.as_deref().unwrap_or(""),
                "❌ stream failed"
            ),
            _ => tracing::info!(stream = %self.id, ?from, ?to, "stream state changed"),
        }
        self.events.emit(PipelineEvent::StreamStateChanged {
            stream: self.id.clone(),
            from,
            to,
            reason,
        });
        true
    }

    /// Connecting → Active
    pub fn activate(&self) -> bool {
        self.transition(StreamState::Active, None)
    }

    /// 不可恢复故障
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let changed = self.transition(StreamState::Failed, Some(reason.clone()));
        if changed {
            *self.failure.lock().unwrap_or_else(|p| p.into_inner()) = Some(reason);
            self.cancel();
        }
        changed
    }

    /// 停止接收新帧, 在途帧继续处理
    pub fn begin_drain(&self) -> bool {
        self.transition(StreamState::Draining, None)
    }

    /// Draining 且视频源已退出且没有在途帧 → Closed
    pub fn try_complete_drain(&self) -> bool {
        if self.state() != StreamState::Draining
            || !self.source_done.load(Ordering::Acquire)
            || self.in_flight.load(Ordering::Acquire) > 0
        {
            return false;
        }
        self.transition(StreamState::Closed, None)
    }

    /// 强制关闭 (关闭超时)
    pub fn force_close(&self) {
        let from = {
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            let from = *state;
            if from.is_terminal() {
                return;
            }
            *state = StreamState::Closed;
            from
        };
        self.cancel();
        tracing::warn!(stream = %self.id, ?from, "⚠️ stream force-closed");
        self.events.emit(PipelineEvent::StreamStateChanged {
            stream: self.id.clone(),
            from,
            to: StreamState::Closed,
            reason: Some("shutdown timeout".to_string()),
        });
    }

    pub fn epoch(&self) -> u32 {
        self.epoch.load(Ordering::Acquire)
    }

    /// 为新帧分配 (epoch, seq); 被丢弃的帧也占用序号, 表现为序号空洞
    pub fn next_frame_id(&self) -> (u32, u64) {
        let epoch = self.epoch.load(Ordering::Acquire);
        let seq = self.next_seq.fetch_add(1, Ordering::AcqRel);
        self.counters.captured.fetch_add(1, Ordering::Relaxed);
        (epoch, seq)
    }

    /// 重连: 代数 +1, 序号归零
    pub fn reconnect(&self) -> u32 {
        self.next_seq.store(0, Ordering::Release);
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        self.events.emit(PipelineEvent::Reconnected {
            stream: self.id.clone(),
            epoch,
        });
        epoch
    }

    pub fn frame_admitted(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    pub fn frame_settled(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn mark_source_done(&self) {
        self.source_done.store(true, Ordering::Release);
    }

    pub fn is_source_done(&self) -> bool {
        self.source_done.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    pub fn mark_removed(&self) {
        self.removed.store(true, Ordering::Release);
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    /// 已移除的流可在进入终止状态且没有在途帧后从流表清理
    pub fn is_reapable(&self) -> bool {
        self.is_removed() && self.state().is_terminal() && self.in_flight() == 0
    }

    /// 记录一次成功发布; 序号回退时返回 false
    pub fn record_published(&self, epoch: u32, seq: u64) -> bool {
        let mut last = self.last_published.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(prev) = *last {
            if prev >= (epoch, seq) {
                tracing::error!(
                    stream = %self.id,
                    ?prev,
                    epoch,
                    seq,
                    "❌ published sequence went backwards"
                );
                return false;
            }
        }
        *last = Some((epoch, seq));
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn record_publish_failure(&self, epoch: u32, seq: u64, error: String) {
        self.counters.publish_failed.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(stream = %self.id, epoch, seq, %error, "⚠️ publish failed");
        self.events.emit(PipelineEvent::PublishFailed {
            stream: self.id.clone(),
            epoch,
            seq,
            error,
        });
    }

    pub fn record_drop(&self, epoch: u32, seq: u64, reason: DropReason) {
        let counter = match reason {
            DropReason::Backpressure | DropReason::PublisherQueueFull => {
                &self.counters.dropped_backpressure
            }
            DropReason::DecodeError => &self.counters.dropped_decode,
            DropReason::DeviceFailure | DropReason::Shutdown => &self.counters.dropped_other,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(stream = %self.id, epoch, seq, ?reason, "frame dropped");
        self.events.emit(PipelineEvent::FrameDropped {
            stream: self.id.clone(),
            epoch,
            seq,
            reason,
        });
    }

    pub fn snapshot(&self) -> StreamSnapshot {
        let c = &self.counters;
        StreamSnapshot {
            id: self.id.clone(),
            uri: self.uri.clone(),
            device: self.device_name.clone(),
            state: self.state(),
            epoch: self.epoch(),
            next_seq: self.next_seq.load(Ordering::Acquire),
            in_flight: self.in_flight(),
            captured: c.captured.load(Ordering::Relaxed),
            dropped_backpressure: c.dropped_backpressure.load(Ordering::Relaxed),
            dropped_decode: c.dropped_decode.load(Ordering::Relaxed),
            dropped_other: c.dropped_other.load(Ordering::Relaxed),
            published: c.published.load(Ordering::Relaxed),
            publish_failed: c.publish_failed.load(Ordering::Relaxed),
            last_published: *self.last_published.lock().unwrap_or_else(|p| p.into_inner()),
            failure: self.failure.lock().unwrap_or_else(|p| p.into_inner()).clone(),
        }
    }
}

/// 流表; 终止状态的流保留在表中供查询, 直到显式移除
#[derive(Default)]
pub struct StreamTable {
    entries: SkipMap<StreamId, Arc<StreamEntry>>,
}

impl StreamTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记一路新流; 标识已被占用时返回已登记的流, 表不变
    pub fn try_insert(&self, entry: Arc<StreamEntry>) -> Result<(), Arc<StreamEntry>> {
        let slot = self
            .entries
            .get_or_insert_with(entry.id().clone(), || entry.clone());
        if Arc::ptr_eq(slot.value(), &entry) {
            Ok(())
        } else {
            Err(slot.value().clone())
        }
    }

    pub fn get(&self, id: &StreamId) -> Option<Arc<StreamEntry>> {
        self.entries.get(id).map(|e| e.value().clone())
    }

    pub fn contains(&self, id: &StreamId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn remove(&self, id: &StreamId) -> Option<Arc<StreamEntry>> {
        self.entries.remove(id).map(|e| e.value().clone())
    }

    pub fn all(&self) -> Vec<Arc<StreamEntry>> {
        self.entries.iter().map(|e| e.value().clone()).collect()
    }

    /// 绑定到 `device` 的非终止流
    pub fn live_on(&self, device: usize) -> Vec<Arc<StreamEntry>> {
        self.entries
            .iter()
            .map(|e| e.value().clone())
            .filter(|s| s.device() == device && !s.state().is_terminal())
            .collect()
    }

    /// 清理已移除且已结束的流, 返回被清理的流
    pub fn reap(&self) -> Vec<StreamId> {
        let done: Vec<StreamId> = self
            .entries
            .iter()
            .filter(|e| e.value().is_reapable())
            .map(|e| e.key().clone())
            .collect();
        for id in &done {
            self.entries.remove(id);
        }
        done
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
