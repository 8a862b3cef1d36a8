//! 空跑后端: 不加载模型, 返回形状正确的全零输出
//!
//! 用于在没有 GPU / 模型文件时压测采集、调度与发布链路.

use ndarray::ArrayD;

use super::{EngineBackend, EngineLoader};
use crate::config::{DeviceConfig, OutputLayout};
use crate::error::EngineError;

/// YOLO 三个检测头的下采样倍数
const STRIDES: [u32; 3] = [8, 16, 32];

/// 输入尺寸对应的 anchor 数量 (640x640 → 8400)
pub fn anchor_count(width: u32, height: u32) -> usize {
    STRIDES
        .iter()
        .map(|s| (width / s) as usize * (height / s) as usize)
        .sum()
}

#[derive(Debug, Clone, Copy)]
pub struct DryRunLoader {
    layout: OutputLayout,
}

impl DryRunLoader {
    pub fn new(layout: OutputLayout) -> Self {
        Self { layout }
    }
}

impl EngineLoader for DryRunLoader {
    fn load(
        &self,
        device: &DeviceConfig,
        (width, height): (u32, u32),
    ) -> Result<Box<dyn EngineBackend>, EngineError> {
        tracing::info!(device = %device.id, "🎬 dry-run engine, no model is loaded");
        Ok(Box::new(DryRunBackend {
            layout: self.layout,
            num_classes: device.num_classes.max(1),
            anchors: anchor_count(width, height).max(1),
        }))
    }
}

pub struct DryRunBackend {
    layout: OutputLayout,
    num_classes: usize,
    anchors: usize,
}

impl EngineBackend for DryRunBackend {
    fn name(&self) -> &str {
        "dry-run"
    }

    fn infer(&mut self, input: ArrayD<f32>) -> Result<Vec<ArrayD<f32>>, EngineError> {
        let batch = input
            .shape()
            .first()
            .copied()
            .ok_or_else(|| EngineError::Input("input tensor has no batch axis".into()))?;
        let shape = match self.layout {
            OutputLayout::Yolov8 => vec![batch, 4 + self.num_classes, self.anchors],
            OutputLayout::Yolov5 => vec![batch, self.anchors, 5 + self.num_classes],
        };
        Ok(vec![ArrayD::zeros(shape)])
    }
}
