/// 视频处理流水线 (Video Processing Pipeline)
///
/// 编排器持有所有组件与流表:
/// - Source:    每路流一个采集线程 (input::SourceAdapter)
/// - Scheduler: 每个设备一个批调度器
/// - Worker:    每个设备一个推理线程 (推理 + 解码)
/// - Publisher: 每路流一个发布线程
///
/// 全局状态: Starting → Running → ShuttingDown → Stopped
pub mod events;
mod worker;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use serde::Serialize;

use crate::config::PipelineConfig;
use crate::detection::DetectionDecoder;
use crate::engine::{EngineLoader, InferenceEngine};
use crate::error::PipelineError;
use crate::input::{SourceAdapter, SourceConnector};
use crate::pool::{FramePool, PoolStats};
use crate::publisher::Publisher;
use crate::scheduler::BatchScheduler;
use crate::stream::{StreamEntry, StreamSnapshot, StreamTable};
use crate::types::StreamId;
use crate::xbus::MessageBus;

pub use events::{DropReason, EventSink, PipelineEvent};
pub use worker::Device;

use worker::DeviceWorker;

/// 事件通道容量
const EVENT_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PipelineState {
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

/// 关闭结果
#[derive(Debug, Clone, PartialEq)]
pub struct ShutdownReport {
    /// 所有工作在超时前完成
    pub clean: bool,
    /// 强制关闭时丢弃的帧/消息数
    pub discarded: u64,
    pub elapsed: Duration,
}

/// 设备状态
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceStatus {
    pub id: String,
    pub healthy: bool,
    pub streams: usize,
    pub pending: usize,
}

pub struct Pipeline {
    config: PipelineConfig,
    state: Mutex<PipelineState>,
    pool: Arc<FramePool>,
    streams: Arc<StreamTable>,
    devices: Vec<Arc<Device>>,
    publisher: Arc<Publisher>,
    connector: Arc<dyn SourceConnector>,
    bus: Arc<dyn MessageBus>,
    events: EventSink,
    events_rx: Receiver<PipelineEvent>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    sources: Mutex<Vec<JoinHandle<()>>>,
    abort: Arc<AtomicBool>,
    discarded: Arc<AtomicU64>,
    next_stream: AtomicU64,
    report: Mutex<Option<ShutdownReport>>,
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// 轮询等待所有线程结束, 超过 deadline 返回 false
fn wait_finished(handles: &[JoinHandle<()>], deadline: Instant) -> bool {
    loop {
        if handles.iter().all(JoinHandle::is_finished) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// join 已结束的线程, 返回仍在运行的
fn reap_handles(handles: Vec<JoinHandle<()>>) -> Vec<JoinHandle<()>> {
    let (done, running): (Vec<_>, Vec<_>) = handles.into_iter().partition(|h| h.is_finished());
    for handle in done {
        if handle.join().is_err() {
            tracing::error!("❌ pipeline thread panicked");
        }
    }
    running
}

impl Pipeline {
    /// 分配缓冲池、加载所有设备并启动推理线程
    ///
    /// 缓冲池分配失败或没有任何设备加载成功时返回错误; 单个设备加载失败只停用该设备.
    pub fn start(
        config: PipelineConfig,
        connector: Arc<dyn SourceConnector>,
        loader: &dyn EngineLoader,
        bus: Arc<dyn MessageBus>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let t = Instant::now();
        let (events, events_rx) = events::channel(EVENT_CAPACITY);
        let pool = Arc::new(FramePool::new(config.pool.capacity, config.pool.slot_len())?);
        tracing::info!(
            slots = config.pool.capacity,
            input = format!("{}x{}", config.pool.input_width, config.pool.input_height),
            "✅ frame pool allocated"
        );

        let pipeline = Self {
            publisher: Arc::new(Publisher::new(
                bus.clone(),
                config.publisher.clone(),
                config.scheduler.drop_policy,
            )),
            state: Mutex::new(PipelineState::Starting),
            pool,
            streams: Arc::new(StreamTable::new()),
            devices: config
                .devices
                .iter()
                .enumerate()
                .map(|(index, dc)| {
                    let scheduler = BatchScheduler::new(
                        dc.id.clone(),
                        config.scheduler.max_batch,
                        config.scheduler.max_wait(),
                    );
                    Arc::new(Device::new(index, dc.id.clone(), Arc::new(scheduler)))
                })
                .collect(),
            connector,
            bus,
            events,
            events_rx,
            workers: Mutex::new(Vec::new()),
            sources: Mutex::new(Vec::new()),
            abort: Arc::new(AtomicBool::new(false)),
            discarded: Arc::new(AtomicU64::new(0)),
            next_stream: AtomicU64::new(0),
            report: Mutex::new(None),
            config,
        };

        let (w, h) = (pipeline.config.pool.input_width, pipeline.config.pool.input_height);
        for (device, dc) in pipeline.devices.iter().zip(&pipeline.config.devices) {
            let engine = match InferenceEngine::load(loader, dc, w, h) {
                Ok(engine) => engine,
                Err(e) => {
                    tracing::error!(device = %dc.id, error = %e, "❌ device unavailable");
                    device.mark_unhealthy();
                    device.scheduler.close();
                    pipeline.events.emit(PipelineEvent::DeviceFailed {
                        device: dc.id.clone(),
                        error: e.to_string(),
                    });
                    continue;
                }
            };
            let worker = DeviceWorker {
                device: device.clone(),
                engine,
                decoder: DetectionDecoder::new(pipeline.config.decoder.clone()),
                pool: pipeline.pool.clone(),
                streams: pipeline.streams.clone(),
                publisher: pipeline.publisher.clone(),
                events: pipeline.events.clone(),
                abort: pipeline.abort.clone(),
                discarded: pipeline.discarded.clone(),
            };
            let handle = std::thread::Builder::new()
                .name(format!("infer-{}", dc.id))
                .spawn(move || worker.run())
                .map_err(|source| {
                    pipeline.close_schedulers();
                    PipelineError::Spawn {
                        what: "inference",
                        source,
                    }
                })?;
            locked(&pipeline.workers).push(handle);
        }

        if !pipeline.devices.iter().any(|d| d.is_healthy()) {
            // 没有推理线程在运行, 直接结束
            *locked(&pipeline.state) = PipelineState::Stopped;
            return Err(PipelineError::NoDevice);
        }

        *locked(&pipeline.state) = PipelineState::Running;
        tracing::info!(
            devices = pipeline.devices.iter().filter(|d| d.is_healthy()).count(),
            elapsed = ?t.elapsed(),
            "✅ pipeline running"
        );
        Ok(pipeline)
    }

    pub fn state(&self) -> PipelineState {
        *locked(&self.state)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn ensure_running(&self) -> Result<(), PipelineError> {
        match self.state() {
            PipelineState::Running => Ok(()),
            other => Err(PipelineError::NotRunning(other)),
        }
    }

    /// 接入一路流, 自动分配 `stream-N` 标识
    pub fn add_stream(&self, uri: &str) -> Result<StreamId, PipelineError> {
        let id = loop {
            let n = self.next_stream.fetch_add(1, Ordering::Relaxed);
            let id = StreamId::new(format!("stream-{n}"));
            if !self.streams.contains(&id) {
                break id;
            }
        };
        self.add_stream_with_id(id.clone(), uri)?;
        Ok(id)
    }

    /// 以指定标识接入一路流, 绑定到负载最低的健康设备
    pub fn add_stream_with_id(&self, id: StreamId, uri: &str) -> Result<(), PipelineError> {
        self.ensure_running()?;
        self.streams.reap();
        let device = self
            .devices
            .iter()
            .filter(|d| d.is_healthy())
            .min_by_key(|d| (self.streams.live_on(d.index).len(), d.index))
            .ok_or(PipelineError::NoDevice)?;

        let entry = Arc::new(StreamEntry::new(
            id.clone(),
            uri,
            device.index,
            device.name.clone(),
            self.events.clone(),
        ));
        if self.streams.try_insert(entry.clone()).is_err() {
            return Err(PipelineError::DuplicateStream(id));
        }
        if let Err(e) = self.publisher.open_lane(entry.clone()) {
            self.streams.remove(&id);
            return Err(e);
        }

        let adapter = SourceAdapter::new(
            entry.clone(),
            self.connector.clone(),
            self.pool.clone(),
            device.scheduler.clone(),
            self.publisher.clone(),
            self.config.source.retry_policy(),
            self.config.scheduler.drop_policy,
            (self.config.pool.input_width, self.config.pool.input_height),
        );
        let handle = match adapter.spawn() {
            Ok(handle) => handle,
            Err(e) => {
                self.publisher.close_lane(&id);
                self.streams.remove(&id);
                return Err(e);
            }
        };
        let mut sources = locked(&self.sources);
        let running = reap_handles(std::mem::take(&mut *sources));
        *sources = running;
        sources.push(handle);
        drop(sources);

        // 设备可能在分配之后失效
        if !device.is_healthy() {
            entry.fail(format!("device {} failed", device.name));
        }
        tracing::info!(stream = %id, uri, device = %device.name, "📹 stream added");
        Ok(())
    }

    /// 移除一路流: 立即停止采集, 在途帧继续处理并发布, 完成后从流表清理
    pub fn remove_stream(&self, id: &StreamId) -> Result<(), PipelineError> {
        let entry = self
            .streams
            .get(id)
            .ok_or_else(|| PipelineError::UnknownStream(id.clone()))?;
        if entry.is_removed() {
            return Ok(());
        }
        entry.mark_removed();
        entry.cancel();
        entry.begin_drain();
        entry.try_complete_drain();
        self.streams.reap();
        tracing::info!(stream = %id, state = ?entry.state(), "stream removal requested");
        Ok(())
    }

    /// 流水线事件接收端 (可多次获取, 共享同一队列)
    pub fn events(&self) -> Receiver<PipelineEvent> {
        self.events_rx.clone()
    }

    pub fn stream_snapshot(&self, id: &StreamId) -> Option<StreamSnapshot> {
        self.streams.reap();
        self.streams.get(id).map(|e| e.snapshot())
    }

    pub fn streams(&self) -> Vec<StreamSnapshot> {
        self.streams.reap();
        self.streams.all().iter().map(|e| e.snapshot()).collect()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn devices(&self) -> Vec<DeviceStatus> {
        self.devices
            .iter()
            .map(|d| DeviceStatus {
                id: d.name.clone(),
                healthy: d.is_healthy(),
                streams: self.streams.live_on(d.index).len(),
                pending: d.scheduler.pending(),
            })
            .collect()
    }

    /// 所有流都已结束 (Closed / Failed)
    pub fn is_idle(&self) -> bool {
        self.streams.all().iter().all(|s| s.state().is_terminal())
    }

    fn close_schedulers(&self) {
        for device in &self.devices {
            device.scheduler.close();
        }
    }

    /// 有序关闭: 停止所有流 → 等待在途批次与发布队列 → 卸载模型 → 关闭总线
    ///
    /// 超过 `shutdown_timeout` 后强制关闭并丢弃剩余工作. 重复调用返回同一结果.
    pub fn shutdown(&self) -> ShutdownReport {
        {
            let mut state = locked(&self.state);
            match *state {
                PipelineState::ShuttingDown | PipelineState::Stopped => {
                    drop(state);
                    return self.wait_report();
                }
                _ => *state = PipelineState::ShuttingDown,
            }
        }
        let t = Instant::now();
        let deadline = t + self.config.shutdown_timeout();
        tracing::info!(streams = self.streams.len(), "🛑 pipeline shutting down");

        for entry in self.streams.all() {
            entry.cancel();
            entry.begin_drain();
            entry.try_complete_drain();
        }
        let sources = std::mem::take(&mut *locked(&self.sources));
        let mut clean = wait_finished(&sources, deadline);

        // 采集线程退出后不会再有新帧, 调度器交付剩余批次后工作线程退出
        self.close_schedulers();
        let workers = std::mem::take(&mut *locked(&self.workers));
        clean &= wait_finished(&workers, deadline);
        clean &= self.publisher.shutdown(deadline);

        if !clean {
            tracing::warn!("⚠️ shutdown timed out, discarding remaining work");
            self.abort.store(true, Ordering::Release);
            self.publisher.abort();
            for device in &self.devices {
                let frames = device.scheduler.drain_all();
                self.discarded
                    .fetch_add(frames.len() as u64, Ordering::Relaxed);
                for frame in frames {
                    if let Err(e) = self.pool.release(frame.slot) {
                        tracing::error!(error = %e, "❌ slot release failed");
                    }
                    if let Some(entry) = self.streams.get(&frame.stream) {
                        self.publisher.discard(
                            &entry,
                            frame.epoch,
                            frame.seq,
                            frame.timestamp_ms,
                            DropReason::Shutdown,
                        );
                    }
                }
            }
            for entry in self.streams.all() {
                entry.force_close();
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if let Err(e) = self.bus.flush(remaining.max(Duration::from_millis(100))) {
            tracing::warn!(error = %e, "⚠️ bus flush failed");
        }
        self.bus.close();

        // 仍在运行的线程 (卡在推理或视频源中) 被分离
        let detached = reap_handles(sources).len() + reap_handles(workers).len();
        if detached > 0 {
            tracing::warn!(threads = detached, "⚠️ threads still running after shutdown");
        }

        let report = ShutdownReport {
            clean,
            discarded: self.discarded.load(Ordering::Relaxed) + self.publisher.discarded(),
            elapsed: t.elapsed(),
        };
        *locked(&self.report) = Some(report.clone());
        *locked(&self.state) = PipelineState::Stopped;
        tracing::info!(
            clean = report.clean,
            discarded = report.discarded,
            elapsed = ?report.elapsed,
            "✅ pipeline stopped"
        );
        report
    }

    /// 另一个线程正在关闭时等待其结果
    fn wait_report(&self) -> ShutdownReport {
        loop {
            if let Some(report) = locked(&self.report).clone() {
                return report;
            }
            if self.state() == PipelineState::Stopped {
                // 启动失败, 没有关闭过程
                return ShutdownReport {
                    clean: true,
                    discarded: 0,
                    elapsed: Duration::ZERO,
                };
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.state() != PipelineState::Stopped {
            self.shutdown();
        }
    }
}
