#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ndarray::ArrayD;
use sentinel_rs::config::{DeviceConfig, OutputLayout, PipelineConfig};
use sentinel_rs::engine::{DryRunLoader, EngineBackend, EngineLoader};
use sentinel_rs::error::EngineError;
use sentinel_rs::publisher::EventMessage;
use sentinel_rs::xbus::InMemoryBus;

/// 小尺寸输入, 让测试跑得快
pub fn config(devices: &[&str]) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.pool.capacity = 16;
    config.pool.input_width = 32;
    config.pool.input_height = 32;
    config.scheduler.max_batch = 4;
    config.scheduler.max_wait_ms = 5;
    config.source.max_retries = 2;
    config.source.backoff_ms = 5;
    config.publisher.send_timeout_ms = 200;
    config.publisher.backoff_ms = 5;
    config.shutdown_timeout_ms = 5_000;
    config.devices = devices
        .iter()
        .map(|id| DeviceConfig {
            id: id.to_string(),
            num_classes: 3,
            ..DeviceConfig::default()
        })
        .collect();
    config
}

/// 包装 dry-run 后端: 可注入推理失败与推理延迟
pub struct ScriptedLoader {
    /// 这些设备在预热成功后, 第一次真实推理即失败
    pub failing: Vec<String>,
    pub delay: Duration,
    pub batches: Arc<AtomicUsize>,
}

impl ScriptedLoader {
    pub fn healthy() -> Self {
        Self {
            failing: Vec::new(),
            delay: Duration::ZERO,
            batches: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing(device: &str) -> Self {
        Self {
            failing: vec![device.to_string()],
            ..Self::healthy()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::healthy()
        }
    }
}

struct ScriptedBackend {
    device: String,
    inner: Box<dyn EngineBackend>,
    fail: bool,
    delay: Duration,
    calls: usize,
    batches: Arc<AtomicUsize>,
}

impl EngineBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn infer(&mut self, input: ArrayD<f32>) -> Result<Vec<ArrayD<f32>>, EngineError> {
        self.calls += 1;
        // 第一次调用是加载时的预热
        if self.calls > 1 {
            if self.fail {
                return Err(EngineError::Inference {
                    device: self.device.clone(),
                    reason: "CUDA error: device lost".into(),
                });
            }
            self.batches.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
        }
        self.inner.infer(input)
    }
}

impl EngineLoader for ScriptedLoader {
    fn load(
        &self,
        device: &DeviceConfig,
        input_size: (u32, u32),
    ) -> Result<Box<dyn EngineBackend>, EngineError> {
        let inner = DryRunLoader::new(OutputLayout::Yolov8).load(device, input_size)?;
        Ok(Box::new(ScriptedBackend {
            device: device.id.clone(),
            inner,
            fail: self.failing.contains(&device.id),
            delay: self.delay,
            calls: 0,
            batches: self.batches.clone(),
        }))
    }
}

/// 加载即失败
pub struct BrokenLoader;

impl EngineLoader for BrokenLoader {
    fn load(
        &self,
        device: &DeviceConfig,
        _input_size: (u32, u32),
    ) -> Result<Box<dyn EngineBackend>, EngineError> {
        Err(EngineError::Load {
            device: device.id.clone(),
            reason: "model file is corrupt".into(),
        })
    }
}

pub fn wait_until(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    f()
}

/// 某个 topic 上某路流已发布的事件
pub fn published(bus: &InMemoryBus, topic: &str, stream: &str) -> Vec<EventMessage> {
    bus.messages(topic)
        .iter()
        .filter(|m| m.key == stream)
        .map(|m| serde_json::from_slice(&m.payload).expect("event message is valid json"))
        .collect()
}

pub fn assert_strictly_increasing(events: &[EventMessage]) {
    for pair in events.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        assert!(
            (a.epoch, a.frame_seq) < (b.epoch, b.frame_seq),
            "{}: {}:{} published before {}:{}",
            a.stream_id,
            a.epoch,
            a.frame_seq,
            b.epoch,
            b.frame_seq
        );
    }
}
