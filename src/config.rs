//! 配置参数 (Configuration)
//!
//! `PipelineConfig` 可从 JSON 文件加载, 所有字段都有默认值;
//! 命令行参数 `Args` 覆盖文件中的对应字段.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// 背压策略: 缓冲池或发布队列满时如何处理新帧
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum DropPolicy {
    /// 丢弃最新帧
    #[default]
    DropNewest,
    /// 丢弃同一路流中最早的待处理帧
    DropOldest,
    /// 阻塞视频源, 直到有空闲槽位
    ///
    /// 发布队列满时, 推理线程在该流的队列上最多等待 `send_timeout_ms` 后丢弃该帧.
    /// 等待期间同一设备上其他流的结果也会被推迟 (队头阻塞), 慢 broker 会拖慢整台设备.
    Block,
}

/// 模型输出张量布局
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputLayout {
    /// [batch, 4 + nc, anchors], 无 objectness
    #[default]
    Yolov8,
    /// [batch, anchors, 5 + nc], score = objectness * class
    Yolov5,
}

impl OutputLayout {
    pub fn name(&self) -> &'static str {
        match self {
            OutputLayout::Yolov8 => "yolov8",
            OutputLayout::Yolov5 => "yolov5",
        }
    }
}

/// 推理执行后端 (Execution Provider)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionProvider {
    #[default]
    Cpu,
    Cuda,
    Trt,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// 槽位数量 C (所有流共享)
    pub capacity: usize,
    /// 模型输入宽度
    pub input_width: u32,
    /// 模型输入高度
    pub input_height: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 16,
            input_width: 640,
            input_height: 640,
        }
    }
}

impl PoolConfig {
    /// 每个槽位的 f32 数量 (CHW)
    pub fn slot_len(&self) -> usize {
        3 * self.input_width as usize * self.input_height as usize
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_batch: usize,
    /// 从批次第一帧到达起的最长等待时间
    pub max_wait_ms: u64,
    pub drop_policy: DropPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_batch: 4,
            max_wait_ms: 20,
            drop_policy: DropPolicy::DropNewest,
        }
    }
}

impl SchedulerConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// 连续重连次数上限, 超过后流进入 Failed
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_ms: 200,
            backoff_max_ms: 5_000,
        }
    }
}

impl SourceConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.backoff_ms, self.backoff_max_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    pub conf_threshold: f32,
    pub iou_threshold: f32,
    pub layout: OutputLayout,
    /// 每帧最多保留的检测框数量
    pub max_detections: usize,
    /// 只输出这些类别 (None = 全部)
    pub classes: Option<Vec<u32>>,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            conf_threshold: 0.25,
            iou_threshold: 0.45,
            layout: OutputLayout::Yolov8,
            max_detections: 300,
            classes: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    pub topic: String,
    /// 每路流的发送队列长度
    pub queue_capacity: usize,
    /// 等待 broker 确认的超时
    pub send_timeout_ms: u64,
    pub max_retries: u32,
    pub backoff_ms: u64,
    /// 在 `<topic>.drops` 上发布丢帧标记
    pub drop_markers: bool,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            topic: "detections".to_string(),
            queue_capacity: 64,
            send_timeout_ms: 2_000,
            max_retries: 3,
            backoff_ms: 100,
            drop_markers: false,
        }
    }
}

impl PublisherConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.backoff_ms, self.backoff_ms.saturating_mul(16))
    }

    pub fn drop_topic(&self) -> String {
        format!("{}.drops", self.topic)
    }
}

/// 推理设备配置 (每个设备一个引擎 + 一个批调度器)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// 设备名称, 用于日志与流绑定
    pub id: String,
    pub model: PathBuf,
    pub provider: ExecutionProvider,
    pub device_index: i32,
    pub fp16: bool,
    /// dry-run 后端的类别数
    pub num_classes: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            id: "cpu:0".to_string(),
            model: PathBuf::from("models/yolov8n.onnx"),
            provider: ExecutionProvider::Cpu,
            device_index: 0,
            fp16: false,
            num_classes: 80,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub pool: PoolConfig,
    pub scheduler: SchedulerConfig,
    pub source: SourceConfig,
    pub decoder: DecoderConfig,
    pub publisher: PublisherConfig,
    pub devices: Vec<DeviceConfig>,
    pub shutdown_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            scheduler: SchedulerConfig::default(),
            source: SourceConfig::default(),
            decoder: DecoderConfig::default(),
            publisher: PublisherConfig::default(),
            devices: vec![DeviceConfig::default()],
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl PipelineConfig {
    /// 从 JSON 文件加载配置
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.capacity == 0 {
            return Err(ConfigError::invalid("pool.capacity", "must be at least 1"));
        }
        if self.pool.input_width == 0 || self.pool.input_height == 0 {
            return Err(ConfigError::invalid(
                "pool.input_width",
                "model input size must be non-zero",
            ));
        }
        if self.scheduler.max_batch == 0 {
            return Err(ConfigError::invalid("scheduler.max_batch", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.decoder.conf_threshold) {
            return Err(ConfigError::invalid(
                "decoder.conf_threshold",
                format!("{} is outside [0, 1]", self.decoder.conf_threshold),
            ));
        }
        if !(0.0..=1.0).contains(&self.decoder.iou_threshold) {
            return Err(ConfigError::invalid(
                "decoder.iou_threshold",
                format!("{} is outside [0, 1]", self.decoder.iou_threshold),
            ));
        }
        if self.decoder.max_detections == 0 {
            return Err(ConfigError::invalid("decoder.max_detections", "must be at least 1"));
        }
        if self.publisher.queue_capacity == 0 {
            return Err(ConfigError::invalid("publisher.queue_capacity", "must be at least 1"));
        }
        if self.publisher.topic.is_empty() {
            return Err(ConfigError::invalid("publisher.topic", "must not be empty"));
        }
        if self.devices.is_empty() {
            return Err(ConfigError::invalid("devices", "at least one device is required"));
        }
        let mut ids: Vec<&str> = self.devices.iter().map(|d| d.id.as_str()).collect();
        ids.sort_unstable();
        if let Some(dup) = ids.windows(2).find(|w| w[0] == w[1]) {
            return Err(ConfigError::invalid(
                "devices",
                format!("device id {:?} appears twice", dup[0]),
            ));
        }
        Ok(())
    }
}

/// 有界指数退避重试策略
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff_ms: u64, max_backoff_ms: u64) -> Self {
        Self {
            max_retries,
            backoff: Duration::from_millis(backoff_ms),
            max_backoff: Duration::from_millis(max_backoff_ms.max(backoff_ms)),
        }
    }

    /// 第 `attempt` 次重试前的等待时间 (从 1 开始), 带 10% 抖动
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self
            .backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff);
        let jitter_ms = (base.as_millis() as u64) / 10;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

/// 推理后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EngineKind {
    /// ONNX Runtime (需要 `onnx` 功能)
    Onnx,
    /// 返回全零输出, 用于压测流水线本身
    DryRun,
}

/// 多路视频流检测服务
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Multi-stream YOLO detection pipeline", long_about = None)]
pub struct Args {
    /// JSON 配置文件
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// 视频源地址, 可重复 (rtsp://..., 文件路径, synthetic://WxH?fps=N&frames=M)
    #[arg(short, long = "source", required = true)]
    pub sources: Vec<String>,

    /// ONNX 模型路径 (覆盖所有设备)
    #[arg(short, long)]
    pub model: Option<PathBuf>,

    /// 推理设备编号, 可重复; 每个编号一条独立推理通道
    #[arg(short, long = "device")]
    pub devices: Vec<i32>,

    /// 执行后端
    #[arg(long, value_enum)]
    pub ep: Option<ExecutionProvider>,

    /// TensorRT FP16
    #[arg(long)]
    pub fp16: bool,

    /// 推理后端
    #[arg(long, value_enum, default_value = "onnx")]
    pub engine: EngineKind,

    /// 事件输出: `-` 为标准输出, 否则为 JSON Lines 文件
    #[arg(short, long, default_value = "-")]
    pub output: String,

    /// 最大批大小
    #[arg(long)]
    pub batch: Option<usize>,

    /// 缓冲池槽位数
    #[arg(long)]
    pub pool: Option<usize>,

    /// 背压策略
    #[arg(long, value_enum)]
    pub drop_policy: Option<DropPolicy>,

    /// 置信度阈值
    #[arg(long)]
    pub conf: Option<f32>,

    /// NMS IoU 阈值
    #[arg(long)]
    pub iou: Option<f32>,

    /// 运行时长 (秒), 不指定则运行到 Ctrl-C 或所有流结束
    #[arg(long)]
    pub duration: Option<u64>,

    /// 输出调试日志
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    /// 加载配置文件 (若有) 并叠加命令行参数
    pub fn to_config(&self) -> Result<PipelineConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::load(path)?,
            None => PipelineConfig::default(),
        };

        if !self.devices.is_empty() {
            let template = config.devices.first().cloned().unwrap_or_default();
            config.devices = self
                .devices
                .iter()
                .map(|&index| DeviceConfig {
                    id: format!("{}:{}", provider_prefix(self.ep.unwrap_or(template.provider)), index),
                    device_index: index,
                    ..template.clone()
                })
                .collect();
        }
        for device in &mut config.devices {
            if let Some(model) = &self.model {
                device.model = model.clone();
            }
            if let Some(ep) = self.ep {
                device.provider = ep;
            }
            device.fp16 |= self.fp16;
        }
        if let Some(batch) = self.batch {
            config.scheduler.max_batch = batch;
        }
        if let Some(pool) = self.pool {
            config.pool.capacity = pool;
        }
        if let Some(policy) = self.drop_policy {
            config.scheduler.drop_policy = policy;
        }
        if let Some(conf) = self.conf {
            config.decoder.conf_threshold = conf;
        }
        if let Some(iou) = self.iou {
            config.decoder.iou_threshold = iou;
        }

        config.validate()?;
        Ok(config)
    }
}

fn provider_prefix(ep: ExecutionProvider) -> &'static str {
    match ep {
        ExecutionProvider::Cpu => "cpu",
        ExecutionProvider::Cuda => "cuda",
        ExecutionProvider::Trt => "trt",
    }
}
