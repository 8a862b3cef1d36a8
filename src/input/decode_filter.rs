/// FFmpeg解码过滤器模块
/// FFmpeg decode filter module
///
/// 挂在 FFmpeg 帧管线上, 把 YUV420P 帧转换为 RGBA 后送入采集通道.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{Sender, TrySendError};
use ez_ffmpeg::filter::frame_filter::FrameFilter;
use ez_ffmpeg::filter::frame_filter_context::FrameFilterContext;
use ez_ffmpeg::{AVMediaType, Frame};

use crate::types::{now_millis, RawFrame};

/// 采集通道消息
pub enum Decoded {
    Frame(RawFrame),
    /// 解码结束; `Some` 为错误原因
    Ended(Option<String>),
}

/// FFmpeg解码过滤器: 视频流 → RGBA帧
#[derive(Clone)]
pub struct DecodeFilter {
    uri: String,
    tx: Sender<Decoded>,
    stop: Arc<AtomicBool>,
    count: usize,
    last: Instant,
    dropped_frames: usize,
    total_frames: usize,
}

impl DecodeFilter {
    pub fn new(uri: impl Into<String>, tx: Sender<Decoded>, stop: Arc<AtomicBool>) -> Self {
        Self {
            uri: uri.into(),
            tx,
            stop,
            count: 0,
            last: Instant::now(),
            dropped_frames: 0,
            total_frames: 0,
        }
    }

    fn skip(&mut self, why: &str) -> Result<Option<Frame>, String> {
        self.dropped_frames += 1;
        if self.total_frames <= 10 {
            tracing::warn!(uri = %self.uri, frame = self.total_frames, why, "⚠️ 丢弃帧");
        }
        Ok(None)
    }
}

impl FrameFilter for DecodeFilter {
    fn media_type(&self) -> AVMediaType {
        AVMediaType::AVMEDIA_TYPE_VIDEO
    }

    fn init(&mut self, _ctx: &FrameFilterContext) -> Result<(), String> {
        tracing::info!(uri = %self.uri, "✅ 解码线程启动");
        Ok(())
    }

    fn filter_frame(
        &mut self,
        frame: Frame,
        _ctx: &FrameFilterContext,
    ) -> Result<Option<Frame>, String> {
        if self.stop.load(Ordering::Acquire) {
            return Err("source closed".to_string());
        }
        self.total_frames += 1;

        if frame.as_ptr().is_null() || frame.is_empty() || frame.is_corrupt() {
            return self.skip("empty or corrupt frame");
        }

        // SAFETY: 指针非空, 由 FFmpeg 在本次回调期间保证有效
        let (w, h, planes, y_stride, uv_stride, error_flags) = unsafe {
            let raw = &*frame.as_ptr();
            (
                raw.width as u32,
                raw.height as u32,
                [raw.data[0], raw.data[1], raw.data[2]],
                raw.linesize[0] as usize,
                raw.linesize[1] as usize,
                raw.decode_error_flags,
            )
        };

        if w == 0 || h == 0 || w > 8192 || h > 8192 {
            return self.skip("invalid resolution");
        }
        // 缺少参考帧、无效比特流
        if error_flags & 0x03 != 0 {
            return self.skip("decode error flags");
        }
        if planes.iter().any(|p| p.is_null()) {
            return self.skip("null yuv plane");
        }
        if y_stride < w as usize || uv_stride < (w as usize).div_ceil(2) {
            return self.skip("bad stride");
        }

        let mut rgba = vec![255u8; w as usize * h as usize * 4];
        // SAFETY: 平面指针与步长已校验, 覆盖 h 行
        unsafe {
            yuv420p_to_rgba(
                planes[0],
                planes[1],
                planes[2],
                y_stride,
                uv_stride,
                &mut rgba,
                w as usize,
                h as usize,
            );
        }
        self.count += 1;

        if self.last.elapsed().as_secs_f64() >= 1.0 {
            let fps = self.count as f64 / self.last.elapsed().as_secs_f64();
            tracing::debug!(
                uri = %self.uri,
                fps = format!("{fps:.1}"),
                total = self.total_frames,
                dropped = self.dropped_frames,
                "📺 解码统计"
            );
            self.last = Instant::now();
            self.count = 0;
        }

        let raw = RawFrame {
            rgba,
            width: w,
            height: h,
            timestamp_ms: now_millis(),
        };
        match self.tx.try_send(Decoded::Frame(raw)) {
            Ok(()) => {}
            // 采集线程跟不上时丢弃最新帧
            Err(TrySendError::Full(_)) => self.dropped_frames += 1,
            Err(TrySendError::Disconnected(_)) => return Err("source closed".to_string()),
        }
        Ok(Some(frame))
    }

    fn uninit(&mut self, _ctx: &FrameFilterContext) {
        tracing::info!(uri = %self.uri, "解码线程退出");
    }
}

/// BT.601 YUV420P → RGBA (定点运算, 系数 ×128)
///
/// # Safety
/// 三个平面指针须覆盖 `height` 行, 步长分别为 `y_stride` / `uv_stride`.
#[allow(clippy::too_many_arguments)]
pub unsafe fn yuv420p_to_rgba(
    y_plane: *const u8,
    u_plane: *const u8,
    v_plane: *const u8,
    y_stride: usize,
    uv_stride: usize,
    buffer: &mut [u8],
    width: usize,
    height: usize,
) {
    let mut out_idx = 0;
    for y in 0..height {
        let y_row = y * y_stride;
        let uv_row = (y >> 1) * uv_stride;

        for x in 0..width {
            let y_val = *y_plane.add(y_row + x) as i32;
            let u_val = *u_plane.add(uv_row + (x >> 1)) as i32 - 128;
            let v_val = *v_plane.add(uv_row + (x >> 1)) as i32 - 128;

            buffer[out_idx] = (y_val + ((v_val * 179) >> 7)).clamp(0, 255) as u8;
            buffer[out_idx + 1] =
                (y_val - ((u_val * 44) >> 7) - ((v_val * 91) >> 7)).clamp(0, 255) as u8;
            buffer[out_idx + 2] = (y_val + ((u_val * 227) >> 7)).clamp(0, 255) as u8;
            out_idx += 4;
        }
    }
}
