//! 检测解码器 (Detection Decoder)
//!
//! 模型原始输出 → 每帧检测结果. 纯函数, 相同输入得到相同输出.
//!
//! 每帧处理流程:
//! 1. 每个 anchor 取最大类别分数 (并列时取类别号最小者)
//! 2. 过滤低于 `conf_threshold` 的候选框
//! 3. 按类别做 NMS: 与已保留的同类框 IoU 严格大于阈值即丢弃
//! 4. 撤销 letterbox 缩放, 裁剪到源分辨率, 输出像素坐标与归一化坐标

use std::cmp::Ordering;

use ndarray::{ArrayView2, Axis, Ix3};

use super::types::{Bbox, Detection};
use crate::config::{DecoderConfig, OutputLayout};
use crate::engine::RawOutput;
use crate::error::DecodeLogicError;
use crate::types::{Batch, Frame, FrameDetections};

/// 候选框 (模型输入坐标系)
#[derive(Debug, Clone, Copy)]
struct Candidate {
    index: usize,
    class_id: u32,
    score: f32,
    bbox: Bbox,
}

/// 排序: 分数降序, 类别升序, anchor 位置升序
fn rank(a: &Candidate, b: &Candidate) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then(a.class_id.cmp(&b.class_id))
        .then(a.index.cmp(&b.index))
}

/// 按类别的贪心 NMS; 输入任意顺序, 输出按 `rank` 排序
fn non_max_suppression(mut xs: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    xs.sort_by(rank);
    let mut kept: Vec<Candidate> = Vec::with_capacity(xs.len());
    for x in xs {
        let suppressed = kept
            .iter()
            .any(|k| k.class_id == x.class_id && k.bbox.iou(&x.bbox) > iou_threshold);
        if !suppressed {
            kept.push(x);
        }
    }
    kept
}

#[derive(Debug, Clone)]
pub struct DetectionDecoder {
    config: DecoderConfig,
}

impl DetectionDecoder {
    pub fn new(config: DecoderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    /// 解码一个批次; 结果顺序与批次中的帧顺序一致
    pub fn decode(
        &self,
        batch: &Batch,
        raw: &RawOutput,
    ) -> Result<Vec<FrameDetections>, DecodeLogicError> {
        let preds = raw.tensors.first().ok_or(DecodeLogicError::MissingOutput)?;
        let preds = preds
            .view()
            .into_dimensionality::<Ix3>()
            .map_err(|_| DecodeLogicError::Rank {
                expected: 3,
                actual: preds.ndim(),
            })?;
        if preds.len_of(Axis(0)) != batch.len() {
            return Err(DecodeLogicError::BatchMismatch {
                expected: batch.len(),
                actual: preds.len_of(Axis(0)),
            });
        }

        let layout = self.config.layout;
        let (channels, min) = match layout {
            OutputLayout::Yolov8 => (preds.len_of(Axis(1)), 5),
            OutputLayout::Yolov5 => (preds.len_of(Axis(2)), 6),
        };
        if channels < min {
            return Err(DecodeLogicError::Channels {
                layout: layout.name(),
                channels,
                min,
            });
        }

        batch
            .frames()
            .iter()
            .enumerate()
            .map(|(idx, frame)| {
                let candidates = self.candidates(idx, preds.index_axis(Axis(0), idx))?;
                let kept = non_max_suppression(candidates, self.config.iou_threshold);
                Ok(self.finish(frame, kept))
            })
            .collect()
    }

    /// 一帧的所有候选框; `preds` 形状为 [channels, anchors] 或 [anchors, channels]
    fn candidates(
        &self,
        frame: usize,
        preds: ArrayView2<'_, f32>,
    ) -> Result<Vec<Candidate>, DecodeLogicError> {
        // 统一为 [anchors, channels]
        let (rows, offset) = match self.config.layout {
            OutputLayout::Yolov8 => (preds.reversed_axes(), 4),
            OutputLayout::Yolov5 => (preds, 5),
        };

        let mut xs = Vec::new();
        for (index, pred) in rows.axis_iter(Axis(0)).enumerate() {
            if pred.iter().any(|v| !v.is_finite()) {
                return Err(DecodeLogicError::NonFinite {
                    frame,
                    candidate: index,
                });
            }

            let (class_id, class_score) = pred
                .iter()
                .skip(offset)
                .enumerate()
                .fold((0usize, f32::NEG_INFINITY), |best, (id, &s)| {
                    if s > best.1 {
                        (id, s)
                    } else {
                        best
                    }
                });
            let score = match self.config.layout {
                OutputLayout::Yolov8 => class_score,
                OutputLayout::Yolov5 => pred[4] * class_score,
            };
            if score < self.config.conf_threshold {
                continue;
            }
            let class_id = class_id as u32;
            if let Some(classes) = &self.config.classes {
                if !classes.contains(&class_id) {
                    continue;
                }
            }

            xs.push(Candidate {
                index,
                class_id,
                score: score.clamp(0., 1.),
                bbox: Bbox::from_cxcywh(pred[0], pred[1], pred[2], pred[3]),
            });
        }
        Ok(xs)
    }

    fn finish(&self, frame: &Frame, kept: Vec<Candidate>) -> FrameDetections {
        let lb = frame.letterbox;
        let (w, h) = (lb.src_width as f32, lb.src_height as f32);
        let ratio = if lb.ratio > 0. { lb.ratio } else { 1. };

        let detections = kept
            .into_iter()
            .take(self.config.max_detections)
            .map(|c| {
                let bbox = c.bbox.unscale(ratio).clamp(w, h);
                let [x1, y1, x2, y2] = bbox.xyxy();
                Detection {
                    class_id: c.class_id,
                    score: c.score,
                    bbox,
                    normalized: [
                        (x1 / w).clamp(0., 1.),
                        (y1 / h).clamp(0., 1.),
                        (x2 / w).clamp(0., 1.),
                        (y2 / h).clamp(0., 1.),
                    ],
                    stream: frame.stream.clone(),
                    frame_seq: frame.seq,
                }
            })
            .collect();

        FrameDetections {
            stream: frame.stream.clone(),
            epoch: frame.epoch,
            seq: frame.seq,
            timestamp_ms: frame.timestamp_ms,
            detections,
        }
    }
}

// 解码器测试用的批次只需要元数据, 槽位句柄来自一个很小的缓冲池
#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Acquire, FramePool};
    use crate::types::{Letterbox, StreamId};
    use ndarray::{Array3, ArrayD};

    fn batch(n: usize, letterbox: Letterbox) -> Batch {
        let pool = FramePool::new(n, 1).unwrap();
        let frames = (0..n)
            .map(|seq| {
                let Acquire::Slot(slot) = pool.acquire().unwrap() else {
                    panic!("busy");
                };
                Frame::new(StreamId::new("cam"), 0, seq as u64, 1_000, slot, letterbox)
            })
            .collect();
        Batch::new(frames)
    }

    fn identity() -> Letterbox {
        Letterbox {
            ratio: 1.0,
            src_width: 100,
            src_height: 100,
        }
    }

    /// YOLOv8 布局: rows = [cx, cy, w, h, cls0, cls1, ...]
    fn v8_output(frames: &[Vec<[f32; 6]>]) -> RawOutput {
        let anchors = frames.iter().map(Vec::len).max().unwrap_or(0);
        let mut out = Array3::<f32>::zeros((frames.len(), 6, anchors));
        for (b, rows) in frames.iter().enumerate() {
            for (i, row) in rows.iter().enumerate() {
                for (c, v) in row.iter().enumerate() {
                    out[[b, c, i]] = *v;
                }
            }
        }
        RawOutput {
            tensors: vec![out.into_dyn()],
        }
    }

    fn decoder() -> DetectionDecoder {
        DetectionDecoder::new(DecoderConfig {
            conf_threshold: 0.25,
            iou_threshold: 0.5,
            ..Default::default()
        })
    }

    #[test]
    fn test_below_threshold_yields_empty_entry() {
        let raw = v8_output(&[vec![[50., 50., 10., 10., 0.1, 0.2]], vec![]]);
        let out = decoder().decode(&batch(2, identity()), &raw).unwrap();
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|f| f.detections.is_empty()));
        assert_eq!(out[1].seq, 1);
    }

    #[test]
    fn test_nms_above_and_below_threshold() {
        // a/b 重叠 IoU = 80/120 ≈ 0.667 > 0.5 → b 被抑制
        // a/c 重叠 IoU = 40/160 = 0.25 → c 保留
        let raw = v8_output(&[vec![
            [45., 50., 10., 10., 0.9, 0.0],
            [47., 50., 10., 10., 0.8, 0.0],
            [51., 50., 10., 10., 0.7, 0.0],
        ]]);
        let out = decoder().decode(&batch(1, identity()), &raw).unwrap();
        let scores: Vec<f32> = out[0].detections.iter().map(|d| d.score).collect();
        assert_eq!(scores, vec![0.9, 0.7]);
    }

    #[test]
    fn test_iou_equal_to_threshold_is_kept() {
        // IoU = 50/150 = 1/3
        let decoder = DetectionDecoder::new(DecoderConfig {
            iou_threshold: 50. / 150.,
            ..Default::default()
        });
        let raw = v8_output(&[vec![
            [5., 5., 10., 10., 0.9, 0.0],
            [10., 5., 10., 10., 0.8, 0.0],
        ]]);
        let out = decoder.decode(&batch(1, identity()), &raw).unwrap();
        assert_eq!(out[0].detections.len(), 2);
    }

    #[test]
    fn test_nms_is_per_class_and_ties_pick_lowest_class() {
        let raw = v8_output(&[vec![
            [50., 50., 10., 10., 0.6, 0.6],
            [50., 50., 10., 10., 0.0, 0.9],
        ]]);
        let out = decoder().decode(&batch(1, identity()), &raw).unwrap();
        let got: Vec<(u32, f32)> = out[0]
            .detections
            .iter()
            .map(|d| (d.class_id, d.score))
            .collect();
        assert_eq!(got, vec![(1, 0.9), (0, 0.6)]);
    }

    #[test]
    fn test_rescale_and_normalize() {
        let lb = Letterbox {
            ratio: 0.5,
            src_width: 200,
            src_height: 100,
        };
        let raw = v8_output(&[vec![[50., 25., 20., 10., 0.9, 0.0]]]);
        let out = decoder().decode(&batch(1, lb), &raw).unwrap();
        let d = &out[0].detections[0];
        assert_eq!(d.bbox.xyxy(), [80., 40., 120., 60.]);
        assert_eq!(d.normalized, [0.4, 0.4, 0.6, 0.6]);
        assert_eq!(d.frame_seq, 0);
        assert_eq!(d.stream.as_str(), "cam");
    }

    #[test]
    fn test_boxes_clamped_to_source() {
        let raw = v8_output(&[vec![[95., 2., 20., 10., 0.9, 0.0]]]);
        let out = decoder().decode(&batch(1, identity()), &raw).unwrap();
        let d = &out[0].detections[0];
        assert_eq!(d.bbox.xyxy(), [85., 0., 100., 7.]);
        assert!(d.normalized.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_yolov5_layout_uses_objectness() {
        let decoder = DetectionDecoder::new(DecoderConfig {
            layout: OutputLayout::Yolov5,
            ..Default::default()
        });
        // [cx, cy, w, h, obj, cls0, cls1]
        let mut out = Array3::<f32>::zeros((1, 2, 7));
        for (c, v) in [50., 50., 10., 10., 0.5, 0.2, 0.8].iter().enumerate() {
            out[[0, 0, c]] = *v;
        }
        for (c, v) in [20., 20., 10., 10., 0.2, 0.9, 0.0].iter().enumerate() {
            out[[0, 1, c]] = *v;
        }
        let raw = RawOutput {
            tensors: vec![out.into_dyn()],
        };
        let got = decoder.decode(&batch(1, identity()), &raw).unwrap();
        assert_eq!(got[0].detections.len(), 1);
        assert_eq!(got[0].detections[0].class_id, 1);
        assert!((got[0].detections[0].score - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_class_filter_and_max_detections() {
        let rows = vec![
            [10., 10., 4., 4., 0.9, 0.0],
            [30., 30., 4., 4., 0.8, 0.0],
            [50., 50., 4., 4., 0.0, 0.95],
            [70., 70., 4., 4., 0.7, 0.0],
        ];
        let decoder = DetectionDecoder::new(DecoderConfig {
            classes: Some(vec![0]),
            max_detections: 2,
            ..Default::default()
        });
        let out = decoder
            .decode(&batch(1, identity()), &v8_output(&[rows]))
            .unwrap();
        let scores: Vec<f32> = out[0].detections.iter().map(|d| d.score).collect();
        assert_eq!(scores, vec![0.9, 0.8]);
    }

    #[test]
    fn test_malformed_outputs() {
        let d = decoder();
        let b = batch(2, identity());

        let empty = RawOutput { tensors: vec![] };
        assert_eq!(d.decode(&b, &empty), Err(DecodeLogicError::MissingOutput));

        let rank2 = RawOutput {
            tensors: vec![ArrayD::zeros(vec![2, 6])],
        };
        assert_eq!(
            d.decode(&b, &rank2),
            Err(DecodeLogicError::Rank {
                expected: 3,
                actual: 2
            })
        );

        let wrong_batch = v8_output(&[vec![[0.; 6]]]);
        assert_eq!(
            d.decode(&b, &wrong_batch),
            Err(DecodeLogicError::BatchMismatch {
                expected: 2,
                actual: 1
            })
        );

        let narrow = RawOutput {
            tensors: vec![ArrayD::zeros(vec![2, 4, 3])],
        };
        assert!(matches!(
            d.decode(&b, &narrow),
            Err(DecodeLogicError::Channels { .. })
        ));

        let nan = v8_output(&[vec![[f32::NAN, 0., 1., 1., 0.9, 0.]], vec![]]);
        assert_eq!(
            d.decode(&b, &nan),
            Err(DecodeLogicError::NonFinite {
                frame: 0,
                candidate: 0
            })
        );
    }

    #[test]
    fn test_decode_is_deterministic() {
        let rows: Vec<[f32; 6]> = (0..50)
            .map(|i| {
                let f = i as f32;
                [f * 1.7 % 90., f * 3.1 % 90., 12., 9., (f * 0.37) % 1., (f * 0.53) % 1.]
            })
            .collect();
        let raw = v8_output(&[rows]);
        let b = batch(1, identity());
        let first = decoder().decode(&b, &raw).unwrap();
        for _ in 0..5 {
            assert_eq!(decoder().decode(&b, &raw).unwrap(), first);
        }
    }
}
