/// FFmpeg 视频源: RTSP / 文件 / 本地设备
///
/// 每个连接一个后台线程运行 FFmpeg 管线, 解码帧经有界通道交给采集线程.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use ez_ffmpeg::core::context::null_output::create_null_output;
use ez_ffmpeg::filter::frame_pipeline_builder::FramePipelineBuilder;
use ez_ffmpeg::{AVMediaType, FfmpegContext, Input};

use super::decode_filter::{DecodeFilter, Decoded};
use super::{SourceConnector, VideoSource};
use crate::error::SourceError;
use crate::types::RawFrame;

/// 解码帧缓冲 (帧)
const FRAME_QUEUE: usize = 4;

/// 超过该时长没有新帧视为断流
const STALL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Default, Clone, Copy)]
pub struct FfmpegConnector;

impl SourceConnector for FfmpegConnector {
    fn connect(&self, uri: &str) -> Result<Box<dyn VideoSource>, SourceError> {
        let (tx, rx) = bounded(FRAME_QUEUE);
        let stop = Arc::new(AtomicBool::new(false));
        let filter = DecodeFilter::new(uri, tx.clone(), stop.clone());
        let owned = uri.to_string();
        std::thread::Builder::new()
            .name("ffmpeg-decode".into())
            .spawn(move || run_decode(&owned, filter, tx))
            .map_err(|e| SourceError::Connect {
                uri: uri.to_string(),
                reason: e.to_string(),
            })?;

        tracing::info!(uri, "🎬 FFmpeg 解码器启动");
        Ok(Box::new(FfmpegSource {
            uri: uri.to_string(),
            rx,
            stop,
            received: 0,
        }))
    }
}

fn run_decode(uri: &str, filter: DecodeFilter, done: Sender<Decoded>) {
    let result = decode(uri, filter);
    if let Err(e) = &result {
        tracing::warn!(uri, error = %e, "❌ FFmpeg 解码失败");
    }
    let _ = done.send(Decoded::Ended(result.err()));
}

fn decode(uri: &str, filter: DecodeFilter) -> Result<(), String> {
    let pipe: FramePipelineBuilder = AVMediaType::AVMEDIA_TYPE_VIDEO.into();
    let pipe = pipe.filter("decode", Box::new(filter));
    let out = create_null_output().add_frame_pipeline(pipe);

    let mut input = Input::new(uri);
    if uri.starts_with("rtsp://") {
        input = input.set_input_opts(
            [
                ("rtsp_transport", "tcp"),
                ("buffer_size", "67108864"),
                ("rtsp_flags", "prefer_tcp"),
            ]
            .into(),
        );
    }

    // 统一转为 YUV420P, 由过滤器转换为 RGBA
    let ctx = FfmpegContext::builder()
        .input(input)
        .filter_descs(["format=yuv420p"].into())
        .output(out)
        .build()
        .map_err(|e| format!("build failed: {e}"))?;
    let sch = ctx.start().map_err(|e| format!("start failed: {e}"))?;
    sch.wait().map_err(|e| e.to_string())
}

pub struct FfmpegSource {
    uri: String,
    rx: Receiver<Decoded>,
    stop: Arc<AtomicBool>,
    received: u64,
}

impl VideoSource for FfmpegSource {
    fn next_frame(&mut self) -> Result<Option<RawFrame>, SourceError> {
        match self.rx.recv_timeout(STALL_TIMEOUT) {
            Ok(Decoded::Frame(frame)) => {
                self.received += 1;
                Ok(Some(frame))
            }
            Ok(Decoded::Ended(None)) => Ok(None),
            Ok(Decoded::Ended(Some(reason))) if self.received == 0 => Err(SourceError::Connect {
                uri: self.uri.clone(),
                reason,
            }),
            Ok(Decoded::Ended(Some(reason))) => Err(SourceError::Io(reason)),
            Err(RecvTimeoutError::Timeout) => Err(SourceError::Io(format!(
                "no frame within {STALL_TIMEOUT:?}"
            ))),
            Err(RecvTimeoutError::Disconnected) => Err(SourceError::Io("decoder exited".into())),
        }
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        // 过滤器在下一帧时退出管线
        self.stop.store(true, Ordering::Release);
    }
}
