//! 流水线事件 (Pipeline events)
//!
//! 状态变化、丢帧、发布告警、设备故障都通过有界通道上报给调用方.
//! 通道满时丢弃事件, 不阻塞任何工作线程.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::Serialize;

use crate::stream::StreamState;
use crate::types::StreamId;

/// 丢帧原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DropReason {
    /// 缓冲池满
    Backpressure,
    /// 发布队列满
    PublisherQueueFull,
    /// 模型输出无法解码
    DecodeError,
    /// 推理设备故障
    DeviceFailure,
    /// 强制关闭时丢弃
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    StreamStateChanged {
        stream: StreamId,
        from: StreamState,
        to: StreamState,
        reason: Option<String>,
    },
    Reconnected {
        stream: StreamId,
        epoch: u32,
    },
    FrameDropped {
        stream: StreamId,
        epoch: u32,
        seq: u64,
        reason: DropReason,
    },
    /// 发布失败告警, 流继续运行
    PublishFailed {
        stream: StreamId,
        epoch: u32,
        seq: u64,
        error: String,
    },
    DeviceFailed {
        device: String,
        error: String,
    },
}

/// 事件发送端
#[derive(Clone)]
pub struct EventSink {
    tx: Sender<PipelineEvent>,
}

impl EventSink {
    pub fn emit(&self, event: PipelineEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                tracing::trace!(?event, "event channel full, event discarded");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

/// 创建事件通道
pub fn channel(capacity: usize) -> (EventSink, Receiver<PipelineEvent>) {
    let (tx, rx) = bounded(capacity.max(1));
    (EventSink { tx }, rx)
}
