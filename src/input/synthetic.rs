//! 内置测试图案视频源
//!
//! `synthetic://WxH?frames=N&fps=F`
//! - `frames` 省略时无限产出
//! - `fps` 为 0 时不限速

use std::time::{Duration, Instant};

use crate::error::SourceError;
use crate::types::{now_millis, RawFrame};

use super::{SourceConnector, VideoSource};

pub const SCHEME: &str = "synthetic://";

/// 测试图案参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyntheticSpec {
    pub width: u32,
    pub height: u32,
    pub frames: Option<u64>,
    pub fps: f64,
}

impl SyntheticSpec {
    pub fn parse(uri: &str) -> Result<Self, SourceError> {
        let bad = |why: &str| SourceError::InvalidUri {
            uri: uri.to_string(),
            reason: why.to_string(),
        };
        let rest = uri
            .strip_prefix(SCHEME)
            .ok_or_else(|| SourceError::Unsupported(uri.to_string()))?;
        let (size, query) = rest.split_once('?').unwrap_or((rest, ""));
        let (w, h) = size.split_once('x').ok_or_else(|| bad("size must be WxH"))?;
        let width: u32 = w.parse().map_err(|_| bad("bad width"))?;
        let height: u32 = h.parse().map_err(|_| bad("bad height"))?;
        if width == 0 || height == 0 {
            return Err(bad("size must be non-zero"));
        }

        let mut spec = Self {
            width,
            height,
            frames: None,
            fps: 0.0,
        };
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            match k {
                "frames" => spec.frames = Some(v.parse().map_err(|_| bad("bad frames"))?),
                "fps" => {
                    spec.fps = v.parse().map_err(|_| bad("bad fps"))?;
                    if !spec.fps.is_finite() || spec.fps < 0.0 {
                        return Err(bad("fps must be >= 0"));
                    }
                }
                other => tracing::warn!(uri, key = other, "unknown synthetic option ignored"),
            }
        }
        Ok(spec)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SyntheticConnector;

impl SourceConnector for SyntheticConnector {
    fn connect(&self, uri: &str) -> Result<Box<dyn VideoSource>, SourceError> {
        Ok(Box::new(SyntheticSource::new(SyntheticSpec::parse(uri)?)))
    }
}

/// 灰色背景上水平移动的白色方块
pub struct SyntheticSource {
    spec: SyntheticSpec,
    produced: u64,
    started: Instant,
}

impl SyntheticSource {
    pub fn new(spec: SyntheticSpec) -> Self {
        Self {
            spec,
            produced: 0,
            started: Instant::now(),
        }
    }

    fn render(&self) -> Vec<u8> {
        let (w, h) = (self.spec.width as usize, self.spec.height as usize);
        let mut rgba = [96u8, 96, 96, 255].repeat(w * h);
        let side = (w.min(h) / 4).max(1);
        let x0 = (self.produced as usize * 4) % w;
        let y0 = (h - side.min(h)) / 2;
        for y in y0..(y0 + side).min(h) {
            for x in x0..(x0 + side).min(w) {
                let i = (y * w + x) * 4;
                rgba[i..i + 3].copy_from_slice(&[255, 255, 255]);
            }
        }
        rgba
    }
}

impl VideoSource for SyntheticSource {
    fn next_frame(&mut self) -> Result<Option<RawFrame>, SourceError> {
        if self.spec.frames.is_some_and(|n| self.produced >= n) {
            return Ok(None);
        }
        if self.spec.fps > 0.0 {
            let due = self.started + Duration::from_secs_f64(self.produced as f64 / self.spec.fps);
            let now = Instant::now();
            if due > now {
                std::thread::sleep(due - now);
            }
        }
        let frame = RawFrame {
            rgba: self.render(),
            width: self.spec.width,
            height: self.spec.height,
            timestamp_ms: now_millis(),
        };
        self.produced += 1;
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_uri() {
        let spec = SyntheticSpec::parse("synthetic://1280x720?frames=10&fps=25").unwrap();
        assert_eq!(
            spec,
            SyntheticSpec {
                width: 1280,
                height: 720,
                frames: Some(10),
                fps: 25.0
            }
        );
        let spec = SyntheticSpec::parse("synthetic://4x4").unwrap();
        assert_eq!(spec.frames, None);
        assert_eq!(spec.fps, 0.0);

        for uri in [
            "synthetic://0x4",
            "synthetic://abc",
            "synthetic://4x4?fps=-1",
            "synthetic://4x4?frames=x",
        ] {
            let err = SyntheticSpec::parse(uri).unwrap_err();
            assert!(matches!(err, SourceError::InvalidUri { .. }), "{uri}: {err}");
            assert!(!err.is_transient());
        }
        assert!(matches!(
            SyntheticSpec::parse("file:///tmp/a.mp4"),
            Err(SourceError::Unsupported(_))
        ));
    }

    #[test]
    fn test_produces_frames_then_eos() {
        let mut source = SyntheticConnector.connect("synthetic://16x8?frames=3").unwrap();
        let mut first = None;
        for _ in 0..3 {
            let frame = source.next_frame().unwrap().unwrap();
            assert_eq!(frame.rgba.len(), 16 * 8 * 4);
            first.get_or_insert(frame.rgba);
        }
        assert!(source.next_frame().unwrap().is_none());
        assert!(source.next_frame().unwrap().is_none());
        assert!(first.unwrap().contains(&255));
    }

    #[test]
    fn test_fps_paces_output() {
        let mut source = SyntheticConnector.connect("synthetic://4x4?frames=3&fps=50").unwrap();
        let t = Instant::now();
        while source.next_frame().unwrap().is_some() {}
        // 第 3 帧在 40ms 时刻产出
        assert!(t.elapsed() >= Duration::from_millis(35));
    }
}
