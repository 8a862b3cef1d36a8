//! 推理引擎封装 (Inference Engine Wrapper)
//!
//! 每个设备持有一个已加载的模型上下文. `infer` 需要 `&mut self`,
//! 同一设备上同一时刻最多只有一个批次在推理.
//! 模型在启动时加载并预热一次, `Drop` 时保证卸载.

pub mod dry_run;
#[cfg(feature = "onnx")]
pub mod onnx;

use std::time::Instant;

use ndarray::{Array4, ArrayD, Axis};

use crate::config::DeviceConfig;
use crate::error::EngineError;
use crate::pool::FramePool;
use crate::types::Batch;

pub use dry_run::DryRunLoader;
#[cfg(feature = "onnx")]
pub use onnx::OrtLoader;

/// 一个批次的模型原始输出, 解码器只消费一次
#[derive(Debug, Clone)]
pub struct RawOutput {
    pub tensors: Vec<ArrayD<f32>>,
}

/// 推理后端 (ONNX Runtime / 测试桩)
pub trait EngineBackend: Send {
    fn name(&self) -> &str;

    /// 输入 NCHW f32, 返回模型全部输出张量
    fn infer(&mut self, input: ArrayD<f32>) -> Result<Vec<ArrayD<f32>>, EngineError>;

    fn unload(&mut self) {}
}

/// 按设备配置加载后端
pub trait EngineLoader: Send + Sync {
    fn load(
        &self,
        device: &DeviceConfig,
        input_size: (u32, u32),
    ) -> Result<Box<dyn EngineBackend>, EngineError>;
}

pub struct InferenceEngine {
    device: String,
    backend: Option<Box<dyn EngineBackend>>,
    width: u32,
    height: u32,
}

impl InferenceEngine {
    /// 加载模型并用全零输入预热一次
    pub fn load(
        loader: &dyn EngineLoader,
        device: &DeviceConfig,
        width: u32,
        height: u32,
    ) -> Result<Self, EngineError> {
        let t = Instant::now();
        let mut backend = loader.load(device, (width, height))?;

        let warmup = Array4::<f32>::zeros((1, 3, height as usize, width as usize)).into_dyn();
        backend.infer(warmup).map_err(|e| EngineError::Load {
            device: device.id.clone(),
            reason: format!("warmup failed: {e}"),
        })?;

        tracing::info!(
            device = %device.id,
            backend = backend.name(),
            elapsed = ?t.elapsed(),
            "✅ model loaded"
        );
        Ok(Self {
            device: device.id.clone(),
            backend: Some(backend),
            width,
            height,
        })
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    /// 从缓冲池组装 NCHW 输入并执行推理
    pub fn infer(&mut self, batch: &Batch, pool: &FramePool) -> Result<RawOutput, EngineError> {
        let backend = self
            .backend
            .as_mut()
            .ok_or_else(|| EngineError::Unavailable(self.device.clone()))?;

        let t = Instant::now();
        let mut input =
            Array4::<f32>::zeros((batch.len(), 3, self.height as usize, self.width as usize));
        for (i, frame) in batch.frames().iter().enumerate() {
            let mut dst = input.index_axis_mut(Axis(0), i);
            let dst = dst
                .as_slice_mut()
                .ok_or_else(|| EngineError::Input("input tensor is not contiguous".into()))?;
            pool.read(frame.slot, |src| {
                if src.len() == dst.len() {
                    dst.copy_from_slice(src);
                    Ok(())
                } else {
                    Err(EngineError::Input(format!(
                        "slot holds {} floats, model input needs {}",
                        src.len(),
                        dst.len()
                    )))
                }
            })
            .map_err(|e| EngineError::Input(e.to_string()))??;
        }

        let tensors = backend.infer(input.into_dyn())?;
        tracing::debug!(
            device = %self.device,
            batch = batch.len(),
            elapsed = ?t.elapsed(),
            "batch inferred"
        );
        Ok(RawOutput { tensors })
    }
}

impl Drop for InferenceEngine {
    fn drop(&mut self) {
        if let Some(mut backend) = self.backend.take() {
            backend.unload();
            tracing::info!(device = %self.device, "engine unloaded");
        }
    }
}
