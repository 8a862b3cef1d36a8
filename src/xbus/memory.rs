//! 进程内消息总线
//!
//! 消息按发布顺序保存, 同时回调给订阅者. 可注入故障:
//! - `set_available(false)`: broker 不可达, 所有发布失败
//! - `fail_next(n)`:          接下来 n 次发布失败
//! - `set_ack_delay(d)`:      延迟确认

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crossbeam_skiplist::SkipMap;

use super::{Delivery, MessageBus};
use crate::error::BusError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
}

type Callback = Arc<dyn Fn(&BusMessage) + Send + Sync>;

struct Subscriber {
    topic: String,
    callback: Callback,
}

#[derive(Default)]
pub struct InMemoryBus {
    messages: Mutex<Vec<BusMessage>>,
    subscribers: SkipMap<u64, Subscriber>,
    next_id: AtomicU64,
    unavailable: AtomicBool,
    fail_remaining: AtomicU32,
    ack_delay_ms: AtomicU64,
    attempts: AtomicU64,
    closed: AtomicBool,
}

impl InMemoryBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// 接下来 `n` 次发布返回 `Unavailable`
    pub fn fail_next(&self, n: u32) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    pub fn set_ack_delay(&self, delay: Duration) {
        self.ack_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// 发布调用次数 (含失败)
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// 订阅某个 topic; 返回的句柄被 drop 时自动退订
    pub fn subscribe<F>(self: &Arc<Self>, topic: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(&BusMessage) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.insert(
            id,
            Subscriber {
                topic: topic.into(),
                callback: Arc::new(callback),
            },
        );
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    /// 某个 topic 上已确认的消息
    pub fn messages(&self, topic: &str) -> Vec<BusMessage> {
        self.messages
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    fn try_deliver(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BusError::Unavailable("broker is down".into()));
        }
        let injected = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(BusError::Unavailable("injected outage".into()));
        }

        let message = BusMessage {
            topic: topic.to_string(),
            key: key.to_string(),
            payload,
        };
        let callbacks: Vec<Callback> = self
            .subscribers
            .iter()
            .filter(|e| e.value().topic == topic)
            .map(|e| e.value().callback.clone())
            .collect();
        for callback in callbacks {
            callback(&message);
        }
        self.messages
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(message);
        Ok(())
    }
}

impl MessageBus for InMemoryBus {
    fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> Delivery {
        let result = self.try_deliver(topic, key, payload);
        let delay = self.ack_delay_ms.load(Ordering::SeqCst);
        if delay == 0 {
            return Delivery::ready(result);
        }
        let (tx, delivery) = Delivery::channel();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(delay));
            let _ = tx.send(result);
        });
        delivery
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// 订阅句柄
pub struct Subscription {
    bus: Weak<InMemoryBus>,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.subscribers.remove(&self.id);
        }
    }
}
