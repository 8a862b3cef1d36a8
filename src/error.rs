//! 错误类型 (Error taxonomy)
//!
//! 每个组件一个 `thiserror` 枚举, 失败范围各不相同:
//! - `SourceError`:      单路流 (可重试 / 不可恢复)
//! - `PoolError`:        帧缓冲池内部一致性错误 (对池致命)
//! - `EngineError`:      单个推理设备
//! - `DecodeLogicError`: 单个批次
//! - `PublishError`:     单路流告警, 流继续运行
//!
//! 缓冲池耗尽不是错误, 见 [`crate::pool::Acquire::Busy`].
//! 二进制程序在调用处用 `anyhow::Result` 包装这些错误.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::pipeline::PipelineState;
use crate::types::StreamId;

/// 视频源错误
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to connect to {uri:?}: {reason}")]
    Connect { uri: String, reason: String },

    #[error("source i/o error: {0}")]
    Io(String),

    #[error("source decode error: {0}")]
    Decode(String),

    #[error("unsupported source uri {0:?}")]
    Unsupported(String),

    #[error("invalid source uri {uri:?}: {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}

impl SourceError {
    /// 网络抖动类错误, 重连后可能恢复
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connect { .. } | Self::Io(_))
    }

    /// 单帧损坏, 丢弃该帧后继续读取
    pub fn is_skippable(&self) -> bool {
        matches!(self, Self::InvalidFrame(_))
    }
}

/// 帧缓冲池错误
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("cannot allocate frame pool: {capacity} slots x {slot_len} floats")]
    Allocation { capacity: usize, slot_len: usize },

    #[error("slot {index} released twice (generation {generation})")]
    DoubleRelease { index: u32, generation: u32 },

    #[error("slot {index} is {actual}, expected {expected}")]
    InvalidState {
        index: u32,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("stale handle for slot {index} (generation {generation})")]
    StaleHandle { index: u32, generation: u32 },

    #[error("slot buffer length mismatch: slot holds {slot_len}, got {len}")]
    LengthMismatch { slot_len: usize, len: usize },

    #[error("frame pool is poisoned by an earlier consistency error")]
    Poisoned,
}

/// 推理引擎错误 (对所属设备通道致命)
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to load model on device {device}: {reason}")]
    Load { device: String, reason: String },

    #[error("inference failed on device {device}: {reason}")]
    Inference { device: String, reason: String },

    #[error("cannot assemble input tensor: {0}")]
    Input(String),

    #[error("engine backend {0:?} is not compiled into this build")]
    Unavailable(String),
}

/// 模型输出格式错误 (仅影响当前批次)
#[derive(Debug, Error, PartialEq)]
pub enum DecodeLogicError {
    #[error("engine returned no output tensor")]
    MissingOutput,

    #[error("expected a rank-{expected} output tensor, got rank {actual}")]
    Rank { expected: usize, actual: usize },

    #[error("output batch dimension is {actual}, batch holds {expected} frames")]
    BatchMismatch { expected: usize, actual: usize },

    #[error("output has {channels} channels, layout {layout} needs at least {min}")]
    Channels {
        layout: &'static str,
        channels: usize,
        min: usize,
    },

    #[error("non-finite value in frame {frame} candidate {candidate}")]
    NonFinite { frame: usize, candidate: usize },
}

/// 消息总线错误
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BusError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("broker rejected message: {0}")]
    Rejected(String),

    #[error("no acknowledgement within {0:?}")]
    Timeout(Duration),

    #[error("delivery handle dropped before acknowledgement")]
    Dropped,

    #[error("bus client is closed")]
    Closed,

    #[error("bus i/o error: {0}")]
    Io(String),
}

/// 事件发布错误 (非致命, 作为流级告警上报)
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("cannot serialize event: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("{stream} frame {epoch}:{seq} unacknowledged after {attempts} attempts: {last}")]
    Undelivered {
        stream: StreamId,
        epoch: u32,
        seq: u64,
        attempts: u32,
        last: BusError,
    },

    #[error("no publisher lane for stream {0}")]
    NoLane(StreamId),

    #[error("publisher lane for stream {0} is closed")]
    LaneClosed(StreamId),
}

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// 流水线级错误
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("no inference device could be loaded")]
    NoDevice,

    #[error("pipeline is {0:?}, expected Running")]
    NotRunning(PipelineState),

    #[error("unknown stream {0}")]
    UnknownStream(StreamId),

    #[error("stream {0} already exists")]
    DuplicateStream(StreamId),

    #[error("cannot spawn {what} thread: {source}")]
    Spawn {
        what: &'static str,
        #[source]
        source: std::io::Error,
    },
}
