/// 推理工作线程 (Device worker)
///
/// 每个推理设备一个线程: 取批 → 推理 → 解码 → 归还槽位 → 发布.
/// 推理失败使该设备停用, 绑定在该设备上的流进入 Failed, 其他设备不受影响.
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::detection::DetectionDecoder;
use crate::engine::InferenceEngine;
use crate::error::EngineError;
use crate::pool::FramePool;
use crate::publisher::Publisher;
use crate::scheduler::BatchScheduler;
use crate::stream::StreamTable;
use crate::types::{Batch, Frame};

use super::events::{DropReason, EventSink, PipelineEvent};

/// 一个推理设备的共享状态
pub struct Device {
    pub index: usize,
    pub name: String,
    pub scheduler: Arc<BatchScheduler>,
    healthy: AtomicBool,
}

impl Device {
    pub fn new(index: usize, name: impl Into<String>, scheduler: Arc<BatchScheduler>) -> Self {
        Self {
            index,
            name: name.into(),
            scheduler,
            healthy: AtomicBool::new(true),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::Release);
    }
}

pub(crate) struct DeviceWorker {
    pub device: Arc<Device>,
    pub engine: InferenceEngine,
    pub decoder: DetectionDecoder,
    pub pool: Arc<FramePool>,
    pub streams: Arc<StreamTable>,
    pub publisher: Arc<Publisher>,
    pub events: EventSink,
    /// 强制关闭: 剩余批次直接丢弃
    pub abort: Arc<AtomicBool>,
    /// 强制关闭时丢弃的帧数
    pub discarded: Arc<AtomicU64>,
}

impl DeviceWorker {
    pub fn run(mut self) {
        tracing::info!(device = %self.device.name, "🔍 inference worker started");
        let mut batches = 0u64;
        let mut frames = 0u64;
        let mut last = Instant::now();

        while let Some(batch) = self.device.scheduler.next_batch() {
            if self.abort.load(Ordering::Acquire) {
                self.discarded
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                self.settle(batch.into_frames(), DropReason::Shutdown);
                continue;
            }
            batches += 1;
            frames += batch.len() as u64;
            if let Err(e) = self.process(batch) {
                self.fail_device(e);
                break;
            }

            if last.elapsed().as_secs_f64() >= 1.0 {
                let fps = frames as f64 / last.elapsed().as_secs_f64();
                tracing::debug!(
                    device = %self.device.name,
                    batches,
                    fps = format!("{fps:.1}"),
                    "📊 inference throughput"
                );
                batches = 0;
                frames = 0;
                last = Instant::now();
            }
        }
        tracing::info!(device = %self.device.name, "inference worker stopped");
    }

    fn process(&mut self, batch: Batch) -> Result<(), EngineError> {
        for frame in batch.frames() {
            if let Err(e) = self.pool.mark_in_flight(frame.slot) {
                tracing::error!(device = %self.device.name, error = %e, "❌ slot state error");
            }
        }

        let t = Instant::now();
        let raw = match self.engine.infer(&batch, &self.pool) {
            Ok(raw) => raw,
            Err(e) => {
                self.settle(batch.into_frames(), DropReason::DeviceFailure);
                return Err(e);
            }
        };
        let decoded = self.decoder.decode(&batch, &raw);
        drop(raw);

        // 解码完成即归还槽位, 每帧恰好一次
        let frames = batch.into_frames();
        for frame in &frames {
            if let Err(e) = self.pool.release(frame.slot) {
                tracing::error!(device = %self.device.name, error = %e, "❌ slot release failed");
            }
        }

        match decoded {
            Ok(results) => {
                tracing::trace!(
                    device = %self.device.name,
                    frames = results.len(),
                    elapsed = ?t.elapsed(),
                    "batch decoded"
                );
                for fd in results {
                    let Some(entry) = self.streams.get(&fd.stream) else {
                        tracing::warn!(stream = %fd.stream, "result for unknown stream dropped");
                        continue;
                    };
                    if let Err(e) = self.publisher.publish(&entry, fd) {
                        tracing::debug!(stream = %entry.id(), error = %e, "result not queued");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(
                    device = %self.device.name,
                    frames = frames.len(),
                    error = %e,
                    "⚠️ batch output could not be decoded"
                );
                for frame in &frames {
                    self.discard(frame, DropReason::DecodeError);
                }
            }
        }
        Ok(())
    }

    /// 归还槽位并丢弃
    fn settle(&self, frames: Vec<Frame>, reason: DropReason) {
        for frame in &frames {
            if let Err(e) = self.pool.release(frame.slot) {
                tracing::error!(device = %self.device.name, error = %e, "❌ slot release failed");
            }
            self.discard(frame, reason);
        }
    }

    fn discard(&self, frame: &Frame, reason: DropReason) {
        if let Some(entry) = self.streams.get(&frame.stream) {
            self.publisher
                .discard(&entry, frame.epoch, frame.seq, frame.timestamp_ms, reason);
        }
    }

    /// 停用设备: 关闭调度器, 绑定的流进入 Failed, 丢弃待处理帧
    fn fail_device(&self, error: EngineError) {
        let device = &self.device;
        device.mark_unhealthy();
        tracing::error!(device = %device.name, %error, "❌ inference device failed");
        self.events.emit(PipelineEvent::DeviceFailed {
            device: device.name.clone(),
            error: error.to_string(),
        });

        device.scheduler.close();
        for entry in self.streams.live_on(device.index) {
            entry.fail(format!("device {} failed: {error}", device.name));
        }
        self.settle(device.scheduler.drain_all(), DropReason::DeviceFailure);
    }
}
