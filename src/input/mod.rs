/// 视频输入系统 (Video Input System)
///
/// 每路流一个独立的采集线程, 负责拉流、解码与预处理
/// - VideoSource:      逐帧产出 RGBA 原始帧
/// - SourceConnector:  按 URI 打开视频源 (synthetic:// 或 FFmpeg)
/// - letterbox:        缩放填充到模型输入尺寸, 写入缓冲池槽位
/// - SourceAdapter:    采集线程: 重连、背压、入队调度器
pub mod adapter;
#[cfg(feature = "ffmpeg")]
pub mod decode_filter;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
pub mod letterbox;
pub mod synthetic;

use crate::error::SourceError;
use crate::types::RawFrame;

pub use adapter::SourceAdapter;
#[cfg(feature = "ffmpeg")]
pub use ffmpeg::FfmpegConnector;
pub use letterbox::letterbox_into;
pub use synthetic::SyntheticConnector;

/// 已连接的视频源
pub trait VideoSource: Send {
    /// 下一帧; `Ok(None)` 表示流结束 (EOS)
    fn next_frame(&mut self) -> Result<Option<RawFrame>, SourceError>;
}

/// 按 URI 打开视频源
pub trait SourceConnector: Send + Sync {
    fn connect(&self, uri: &str) -> Result<Box<dyn VideoSource>, SourceError>;
}

/// 按 URI scheme 分发: `synthetic://` 走内置测试图案, 其余交给 FFmpeg
#[derive(Default)]
pub struct DefaultConnector {
    synthetic: SyntheticConnector,
    #[cfg(feature = "ffmpeg")]
    ffmpeg: FfmpegConnector,
}

impl DefaultConnector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SourceConnector for DefaultConnector {
    fn connect(&self, uri: &str) -> Result<Box<dyn VideoSource>, SourceError> {
        if uri.starts_with(synthetic::SCHEME) {
            return self.synthetic.connect(uri);
        }
        #[cfg(feature = "ffmpeg")]
        {
            self.ffmpeg.connect(uri)
        }
        #[cfg(not(feature = "ffmpeg"))]
        {
            Err(SourceError::Unsupported(uri.to_string()))
        }
    }
}
