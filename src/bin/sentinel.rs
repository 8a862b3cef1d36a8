/// 数字卫兵 (Digital Sentinel)
///
/// 多路视频流实时目标检测服务
///
/// 系统架构:
/// 1. 采集线程: 每路流一个, 解码与 letterbox 预处理
/// 2. 推理线程: 每个设备一个, 批量推理与解码
/// 3. 发布线程: 每路流一个, 检测事件按序发布
/// 4. 主线程:   接收流水线事件, 处理 Ctrl-C
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::RecvTimeoutError;
use sentinel_rs::config::{EngineKind, OutputLayout};
use sentinel_rs::engine::{DryRunLoader, EngineLoader};
use sentinel_rs::input::DefaultConnector;
use sentinel_rs::xbus::{JsonLinesBus, MessageBus};
use sentinel_rs::{logging, Args, Pipeline, PipelineEvent};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn engine_loader(kind: EngineKind, layout: OutputLayout) -> Result<Box<dyn EngineLoader>> {
    match kind {
        EngineKind::DryRun => Ok(Box::new(DryRunLoader::new(layout))),
        #[cfg(feature = "onnx")]
        EngineKind::Onnx => Ok(Box::new(sentinel_rs::engine::OrtLoader)),
        #[cfg(not(feature = "onnx"))]
        EngineKind::Onnx => Err(sentinel_rs::error::EngineError::Unavailable("onnx".into()))
            .context("rebuild with `--features onnx` or pass `--engine dry-run`"),
    }
}

fn log_event(event: &PipelineEvent) {
    match event {
        PipelineEvent::StreamStateChanged {
            stream, to, reason, ..
        } => tracing::info!(%stream, state = ?to, reason = reason.as_deref().unwrap_or(""), "📹 stream"),
        PipelineEvent::Reconnected { stream, epoch } => {
            tracing::info!(%stream, epoch, "🔄 reconnected")
        }
        PipelineEvent::FrameDropped {
            stream, seq, reason, ..
        } => tracing::debug!(%stream, seq, ?reason, "frame dropped"),
        PipelineEvent::PublishFailed {
            stream, seq, error, ..
        } => tracing::warn!(%stream, seq, %error, "⚠️ publish failed"),
        PipelineEvent::DeviceFailed { device, error } => {
            tracing::error!(%device, %error, "❌ device failed")
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.verbose);

    let config = args.to_config().context("invalid configuration")?;
    tracing::info!(
        devices = config.devices.len(),
        sources = args.sources.len(),
        engine = ?args.engine,
        "🚀 数字卫兵系统启动"
    );

    let loader = engine_loader(args.engine, config.decoder.layout)?;
    let bus: Arc<dyn MessageBus> = if args.output == "-" {
        Arc::new(JsonLinesBus::stdout())
    } else {
        Arc::new(
            JsonLinesBus::create(Path::new(&args.output))
                .with_context(|| format!("cannot create {}", args.output))?,
        )
    };

    let pipeline = Pipeline::start(
        config,
        Arc::new(DefaultConnector::new()),
        loader.as_ref(),
        bus,
    )
    .context("pipeline failed to start")?;

    for uri in &args.sources {
        match pipeline.add_stream(uri) {
            Ok(id) => tracing::info!(stream = %id, uri, "✅ stream registered"),
            Err(e) => tracing::error!(uri, error = %e, "❌ cannot add stream"),
        }
    }

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst))
            .context("cannot install Ctrl-C handler")?;
    }

    let started = Instant::now();
    let limit = args.duration.map(Duration::from_secs);
    let events = pipeline.events();
    loop {
        match events.recv_timeout(Duration::from_millis(200)) {
            Ok(event) => log_event(&event),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if stop.load(Ordering::SeqCst) {
            tracing::info!("🛑 收到 Ctrl-C, 正在退出");
            break;
        }
        if limit.is_some_and(|limit| started.elapsed() >= limit) {
            tracing::info!("⏱️ 运行时长已到");
            break;
        }
        if pipeline.is_idle() {
            tracing::info!("所有视频流已结束");
            break;
        }
    }

    let report = pipeline.shutdown();
    for s in pipeline.streams() {
        tracing::info!(
            stream = %s.id,
            state = ?s.state,
            captured = s.captured,
            published = s.published,
            dropped = s.dropped_backpressure + s.dropped_decode + s.dropped_other,
            publish_failed = s.publish_failed,
            "📊 stream summary"
        );
    }
    if !report.clean {
        tracing::warn!(discarded = report.discarded, "⚠️ forced shutdown");
    }
    Ok(())
}
