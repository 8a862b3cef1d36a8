// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! Letterbox 预处理: 保持宽高比缩放到模型输入尺寸, 图像放在左上角,
//! 其余部分填充 144/255, 输出 CHW 平面 f32 (0~1).

use image::{imageops, ImageBuffer, Rgba};

use crate::error::SourceError;
use crate::types::{Letterbox, RawFrame};

/// 填充值
pub const PAD_VALUE: f32 = 144.0 / 255.0;

/// 缩放比例与缩放后尺寸
pub fn scale_wh(w0: f32, h0: f32, w1: f32, h1: f32) -> (f32, f32, f32) {
    let r = (w1 / w0).min(h1 / h0);
    (r, (w0 * r).round(), (h0 * r).round())
}

/// 把一帧 RGBA 写入 `dst` (长度 3 * width * height)
pub fn letterbox_into(
    raw: &RawFrame,
    dst: &mut [f32],
    width: u32,
    height: u32,
) -> Result<Letterbox, SourceError> {
    let (w0, h0) = (raw.width, raw.height);
    if w0 == 0 || h0 == 0 {
        return Err(SourceError::InvalidFrame(format!("empty frame {w0}x{h0}")));
    }
    let expected = w0 as usize * h0 as usize * 4;
    if raw.rgba.len() != expected {
        return Err(SourceError::InvalidFrame(format!(
            "{w0}x{h0} frame carries {} bytes, expected {expected}",
            raw.rgba.len()
        )));
    }
    let plane = width as usize * height as usize;
    if dst.len() != plane * 3 {
        return Err(SourceError::InvalidFrame(format!(
            "slot holds {} floats, model input {width}x{height} needs {}",
            dst.len(),
            plane * 3
        )));
    }

    let img = ImageBuffer::<Rgba<u8>, &[u8]>::from_raw(w0, h0, raw.rgba.as_slice())
        .ok_or_else(|| SourceError::InvalidFrame("rgba buffer does not match size".into()))?;
    let (ratio, w_new, h_new) = scale_wh(w0 as f32, h0 as f32, width as f32, height as f32);
    let w_new = (w_new as u32).clamp(1, width);
    let h_new = (h_new as u32).clamp(1, height);

    let resized;
    let pixels = if (w_new, h_new) == (w0, h0) {
        img.as_raw().to_vec()
    } else {
        resized = imageops::resize(&img, w_new, h_new, imageops::FilterType::Triangle);
        resized.into_raw()
    };

    dst.fill(PAD_VALUE);
    let (r_plane, rest) = dst.split_at_mut(plane);
    let (g_plane, b_plane) = rest.split_at_mut(plane);
    let row = w_new as usize;
    for (i, px) in pixels.chunks_exact(4).enumerate() {
        let (x, y) = (i % row, i / row);
        let idx = y * width as usize + x;
        r_plane[idx] = px[0] as f32 / 255.0;
        g_plane[idx] = px[1] as f32 / 255.0;
        b_plane[idx] = px[2] as f32 / 255.0;
    }

    Ok(Letterbox {
        ratio,
        src_width: w0,
        src_height: h0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(w: u32, h: u32, rgba: [u8; 4]) -> RawFrame {
        RawFrame {
            rgba: rgba.repeat((w * h) as usize),
            width: w,
            height: h,
            timestamp_ms: 0,
        }
    }

    #[test]
    fn test_wide_frame_is_padded_at_bottom() {
        let raw = solid(8, 4, [255, 0, 51, 255]);
        let mut dst = vec![0.0; 3 * 4 * 4];
        let lb = letterbox_into(&raw, &mut dst, 4, 4).unwrap();
        assert_eq!(lb.ratio, 0.5);
        assert_eq!((lb.src_width, lb.src_height), (8, 4));

        // 上两行为图像, 下两行为填充
        let r = &dst[..16];
        assert!(r[..8].iter().all(|v| (*v - 1.0).abs() < 1e-6));
        assert!(r[8..].iter().all(|v| (*v - PAD_VALUE).abs() < 1e-6));
        let b = &dst[32..];
        assert!((b[0] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_same_size_copies_pixels() {
        let mut raw = solid(2, 2, [0, 0, 0, 255]);
        raw.rgba[4] = 255; // (1, 0) 红色
        let mut dst = vec![0.0; 12];
        let lb = letterbox_into(&raw, &mut dst, 2, 2).unwrap();
        assert_eq!(lb.ratio, 1.0);
        assert_eq!(&dst[..4], &[0.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_rejects_bad_frames() {
        let mut dst = vec![0.0; 12];
        let empty = solid(0, 0, [0; 4]);
        assert!(letterbox_into(&empty, &mut dst, 2, 2).unwrap_err().is_skippable());

        let mut short = solid(2, 2, [0; 4]);
        short.rgba.truncate(5);
        assert!(letterbox_into(&short, &mut dst, 2, 2).is_err());

        let ok = solid(2, 2, [0; 4]);
        assert!(letterbox_into(&ok, &mut dst, 4, 4).is_err());
    }
}
