// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! ONNX Runtime 后端 (CPU / CUDA / TensorRT)

use ndarray::ArrayD;
use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, ExecutionProviderDispatch,
    TensorRTExecutionProvider,
};
use ort::session::Session;
use ort::value::Tensor;

use super::{EngineBackend, EngineLoader};
use crate::config::{DeviceConfig, ExecutionProvider};
use crate::error::EngineError;

#[derive(Debug, Default, Clone, Copy)]
pub struct OrtLoader;

impl OrtLoader {
    fn providers(device: &DeviceConfig) -> Vec<ExecutionProviderDispatch> {
        let cpu = CPUExecutionProvider::default().build();
        let cuda = || {
            CUDAExecutionProvider::default()
                .with_device_id(device.device_index)
                .build()
        };
        match device.provider {
            ExecutionProvider::Cpu => vec![cpu],
            ExecutionProvider::Cuda => vec![cuda(), cpu],
            ExecutionProvider::Trt => vec![
                TensorRTExecutionProvider::default()
                    .with_device_id(device.device_index)
                    .with_fp16(device.fp16)
                    .build(),
                cuda(),
                cpu,
            ],
        }
    }
}

impl EngineLoader for OrtLoader {
    fn load(
        &self,
        device: &DeviceConfig,
        _input_size: (u32, u32),
    ) -> Result<Box<dyn EngineBackend>, EngineError> {
        if !device.model.exists() {
            return Err(EngineError::Load {
                device: device.id.clone(),
                reason: format!("model file {} not found", device.model.display()),
            });
        }

        let session = Session::builder()
            .map_err(|e| load_error(device, e))?
            .with_execution_providers(Self::providers(device))
            .map_err(|e| load_error(device, e))?
            .commit_from_file(&device.model)
            .map_err(|e| load_error(device, e))?;

        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .unwrap_or_else(|| "images".to_string());
        let output_names = session.outputs.iter().map(|o| o.name.clone()).collect();

        tracing::info!(
            device = %device.id,
            model = %device.model.display(),
            provider = ?device.provider,
            "🔍 onnx session created"
        );
        Ok(Box::new(OrtBackend {
            device: device.id.clone(),
            session,
            input_name,
            output_names,
        }))
    }
}

fn load_error(device: &DeviceConfig, e: impl std::fmt::Display) -> EngineError {
    EngineError::Load {
        device: device.id.clone(),
        reason: e.to_string(),
    }
}

pub struct OrtBackend {
    device: String,
    session: Session,
    input_name: String,
    output_names: Vec<String>,
}

impl EngineBackend for OrtBackend {
    fn name(&self) -> &str {
        "onnxruntime"
    }

    fn infer(&mut self, input: ArrayD<f32>) -> Result<Vec<ArrayD<f32>>, EngineError> {
        let tensor = Tensor::from_array(input).map_err(|e| EngineError::Input(e.to_string()))?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => tensor])
            .map_err(|e| EngineError::Inference {
                device: self.device.clone(),
                reason: e.to_string(),
            })?;

        let mut ys = Vec::with_capacity(self.output_names.len());
        for name in &self.output_names {
            let value = outputs
                .get(name.as_str())
                .ok_or_else(|| EngineError::Inference {
                    device: self.device.clone(),
                    reason: format!("output {name:?} missing"),
                })?;
            let array = value
                .try_extract_array::<f32>()
                .map_err(|e| EngineError::Inference {
                    device: self.device.clone(),
                    reason: e.to_string(),
                })?;
            ys.push(array.into_owned());
        }
        Ok(ys)
    }

    fn unload(&mut self) {
        tracing::debug!(device = %self.device, "releasing onnx session");
    }
}

impl std::fmt::Debug for OrtBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrtBackend")
            .field("device", &self.device)
            .field("input", &self.input_name)
            .field("outputs", &self.output_names)
            .finish()
    }
}
