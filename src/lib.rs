// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 多路视频流实时目标检测流水线
//!
//! 视频源 → 帧缓冲池 → 批调度 → 推理 → 解码 → 事件发布
pub mod config; // 配置与命令行参数
pub mod detection; // 检测框与输出解码
pub mod engine; // 推理引擎 (ONNX Runtime / dry-run)
pub mod error; // 错误类型
pub mod input; // 视频输入系统
pub mod logging; // 日志初始化
pub mod pipeline; // 流水线编排
pub mod pool; // 帧缓冲池
pub mod publisher; // 检测事件发布
pub mod scheduler; // 批调度器
pub mod stream; // 流表与流状态机
pub mod types; // 流水线数据结构
pub mod xbus; // 消息总线

pub use crate::config::{Args, DropPolicy, PipelineConfig};
pub use crate::detection::{Bbox, Detection, DetectionDecoder};
pub use crate::error::{PipelineError, PublishError, SourceError};
pub use crate::pipeline::{Pipeline, PipelineEvent, PipelineState, ShutdownReport};
pub use crate::pool::{Acquire, FramePool};
pub use crate::stream::{StreamSnapshot, StreamState};
pub use crate::types::{FrameDetections, StreamId};
