//! JSON Lines 总线: 每条消息一行 `{"topic", "key", "payload"}`

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{Delivery, MessageBus};
use crate::error::BusError;

pub struct JsonLinesBus {
    writer: Mutex<Box<dyn Write + Send>>,
    closed: AtomicBool,
}

impl JsonLinesBus {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            writer: Mutex::new(Box::new(writer)),
            closed: AtomicBool::new(false),
        }
    }

    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    pub fn create(path: &Path) -> io::Result<Self> {
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }

    fn write_line(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        let payload: serde_json::Value =
            serde_json::from_slice(payload).map_err(|e| BusError::Rejected(e.to_string()))?;
        let line = serde_json::json!({
            "topic": topic,
            "key": key,
            "payload": payload,
        });
        let mut writer = self.writer.lock().unwrap_or_else(|p| p.into_inner());
        serde_json::to_writer(&mut *writer, &line).map_err(|e| BusError::Io(e.to_string()))?;
        writer
            .write_all(b"\n")
            .map_err(|e| BusError::Io(e.to_string()))
    }
}

impl MessageBus for JsonLinesBus {
    fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> Delivery {
        Delivery::ready(self.write_line(topic, key, &payload))
    }

    fn flush(&self, _timeout: Duration) -> Result<(), BusError> {
        self.writer
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .flush()
            .map_err(|e| BusError::Io(e.to_string()))
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            if let Err(e) = self.flush(Duration::ZERO) {
                tracing::warn!(error = %e, "⚠️ failed to flush event output");
            }
        }
    }
}
