//! 流水线数据结构 (Pipeline data types)
//!
//! 帧在各阶段之间流转: 视频源 → 缓冲池 → 批调度 → 推理 → 解码 → 发布

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::detection::Detection;
use crate::pool::SlotHandle;

/// 视频流标识
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StreamId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// 视频源输出的原始帧 (RGBA, 源分辨率)
#[derive(Clone)]
pub struct RawFrame {
    pub rgba: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// 采集时间 (毫秒, Unix epoch)
    pub timestamp_ms: u64,
}

impl fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.rgba.len())
            .field("timestamp_ms", &self.timestamp_ms)
            .finish()
    }
}

/// Letterbox 变换参数, 用于把检测框还原到源分辨率
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    /// 缩放比例 = min(模型宽/源宽, 模型高/源高)
    pub ratio: f32,
    pub src_width: u32,
    pub src_height: u32,
}

/// 已写入缓冲池的帧
///
/// 不持有像素数据, 只持有缓冲槽句柄; 推理+解码完成后由流水线归还槽位.
#[derive(Debug)]
pub struct Frame {
    pub stream: StreamId,
    /// 重连代数, 每次重连 +1 且帧序号归零
    pub epoch: u32,
    pub seq: u64,
    pub timestamp_ms: u64,
    pub slot: SlotHandle,
    pub letterbox: Letterbox,
    pub(crate) arrived: Instant,
}

impl Frame {
    pub fn new(
        stream: StreamId,
        epoch: u32,
        seq: u64,
        timestamp_ms: u64,
        slot: SlotHandle,
        letterbox: Letterbox,
    ) -> Self {
        Self {
            stream,
            epoch,
            seq,
            timestamp_ms,
            slot,
            letterbox,
            arrived: Instant::now(),
        }
    }
}

/// 一次推理调用的帧集合 (可混合多路流)
#[derive(Debug, Default)]
pub struct Batch {
    frames: Vec<Frame>,
}

impl Batch {
    pub fn new(frames: Vec<Frame>) -> Self {
        Self { frames }
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn into_frames(self) -> Vec<Frame> {
        self.frames
    }
}

/// 单帧解码结果; 没有检测框时 `detections` 为空而不是缺失
#[derive(Debug, Clone, PartialEq)]
pub struct FrameDetections {
    pub stream: StreamId,
    pub epoch: u32,
    pub seq: u64,
    pub timestamp_ms: u64,
    pub detections: Vec<Detection>,
}

/// 当前时间 (毫秒, Unix epoch)
pub fn now_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}
