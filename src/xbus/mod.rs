/// 消息总线 (Message Bus)
///
/// 发布端只依赖 `MessageBus` 能力接口: publish(topic, key, payload) → Delivery,
/// Delivery 在 broker 确认 (ack) 或失败时完成.
/// - memory: 进程内总线, 支持订阅与故障注入
/// - jsonl:  每条消息一行 JSON, 写到标准输出或文件
pub mod jsonl;
pub mod memory;

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::error::BusError;

pub use jsonl::JsonLinesBus;
pub use memory::{BusMessage, InMemoryBus, Subscription};

/// broker 客户端能力接口
pub trait MessageBus: Send + Sync {
    /// 发布一条消息, key 为流标识 (同 key 消息保序)
    fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> Delivery;

    /// 等待已发布消息落地
    fn flush(&self, _timeout: Duration) -> Result<(), BusError> {
        Ok(())
    }

    fn close(&self) {}
}

/// 一次发布的确认句柄
#[derive(Debug)]
pub struct Delivery {
    rx: Receiver<Result<(), BusError>>,
}

impl Delivery {
    /// 由 bus 实现持有发送端, 在收到 ack 时回填结果
    pub fn channel() -> (Sender<Result<(), BusError>>, Delivery) {
        let (tx, rx) = bounded(1);
        (tx, Delivery { rx })
    }

    /// 已完成的确认
    pub fn ready(result: Result<(), BusError>) -> Delivery {
        let (tx, delivery) = Self::channel();
        let _ = tx.send(result);
        delivery
    }

    /// 等待确认, 超时返回 `BusError::Timeout`
    pub fn wait(self, timeout: Duration) -> Result<(), BusError> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(BusError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(BusError::Dropped),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_outcomes() {
        assert_eq!(Delivery::ready(Ok(())).wait(Duration::ZERO), Ok(()));

        let (tx, pending) = Delivery::channel();
        assert_eq!(
            pending.wait(Duration::from_millis(10)),
            Err(BusError::Timeout(Duration::from_millis(10)))
        );
        drop(tx);

        let (tx, dropped) = Delivery::channel();
        drop(tx);
        assert_eq!(dropped.wait(Duration::from_secs(1)), Err(BusError::Dropped));

        let (tx, late) = Delivery::channel();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            let _ = tx.send(Err(BusError::Rejected("too large".into())));
        });
        assert_eq!(
            late.wait(Duration::from_secs(5)),
            Err(BusError::Rejected("too large".into()))
        );
    }
}
