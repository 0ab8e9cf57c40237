//! 消费者注册表
//!
//! 分发线程每个周期按注册顺序调用全部消费者。注册表以 `ArcSwap` 保存不可变的
//! `HookManager` 快照：控制面增删消费者时整体替换快照，分发线程读取时不加锁。
//!
//! # 使用示例
//!
//! ```rust
//! use imu_driver::hooks::{ConsumerRegistry, FnConsumer};
//! use std::sync::Arc;
//!
//! let registry = ConsumerRegistry::new();
//! let id = registry.add(Arc::new(FnConsumer::new(|device, batch| {
//!     println!("{device}: {} records", batch.len());
//!     Ok(())
//! })));
//! assert_eq!(registry.len(), 1);
//! assert!(registry.remove(id));
//! ```

use crate::error::ConsumerError;
use arc_swap::ArcSwap;
use imu_protocol::{DeviceId, SampleRecord};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// 记录批次消费者
///
/// 回调运行在分发线程上，应当尽快返回；耗时工作请转交给自己的线程
/// （参见 [`ChannelConsumer`](crate::recording::ChannelConsumer)）。
/// 返回 `Err` 或 panic 都只会被记录和计数，不会中断分发。
pub trait SampleConsumer: Send + Sync {
    /// 同一设备的一批记录，按时间戳有序
    fn on_batch(&self, device_id: &DeviceId, batch: &[SampleRecord]) -> Result<(), ConsumerError>;

    /// 用于日志的名称
    fn name(&self) -> &str {
        "consumer"
    }
}

/// 闭包适配器
pub struct FnConsumer<F> {
    f: F,
    name: String,
}

impl<F> FnConsumer<F>
where
    F: Fn(&DeviceId, &[SampleRecord]) -> Result<(), ConsumerError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            name: "fn".to_string(),
        }
    }

    pub fn named(name: impl Into<String>, f: F) -> Self {
        Self {
            f,
            name: name.into(),
        }
    }
}

impl<F> SampleConsumer for FnConsumer<F>
where
    F: Fn(&DeviceId, &[SampleRecord]) -> Result<(), ConsumerError> + Send + Sync,
{
    fn on_batch(&self, device_id: &DeviceId, batch: &[SampleRecord]) -> Result<(), ConsumerError> {
        (self.f)(device_id, batch)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// 消费者句柄（用于移除）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerId(u64);

impl std::fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "consumer#{}", self.0)
    }
}

/// 不可变的消费者列表快照
#[derive(Clone, Default)]
pub struct HookManager {
    consumers: Vec<(ConsumerId, Arc<dyn SampleConsumer>)>,
}

impl HookManager {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            consumers: Vec::new(),
        }
    }

    pub fn add(&mut self, id: ConsumerId, consumer: Arc<dyn SampleConsumer>) {
        self.consumers.push((id, consumer));
    }

    /// 移除消费者，返回是否存在
    pub fn remove(&mut self, id: ConsumerId) -> bool {
        let before = self.consumers.len();
        self.consumers.retain(|(cid, _)| *cid != id);
        self.consumers.len() != before
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }

    /// 按注册顺序遍历
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn SampleConsumer>> {
        self.consumers.iter().map(|(_, c)| c)
    }
}

/// 线程安全的消费者注册表
pub struct ConsumerRegistry {
    hooks: ArcSwap<HookManager>,
    next_id: AtomicU64,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self {
            hooks: ArcSwap::from_pointee(HookManager::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn add(&self, consumer: Arc<dyn SampleConsumer>) -> ConsumerId {
        let id = ConsumerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.hooks.rcu(|current| {
            let mut next = HookManager::clone(current);
            next.add(id, consumer.clone());
            next
        });
        id
    }

    pub fn remove(&self, id: ConsumerId) -> bool {
        let previous = self.hooks.rcu(|current| {
            let mut next = HookManager::clone(current);
            next.remove(id);
            next
        });
        previous.consumers.iter().any(|(cid, _)| *cid == id)
    }

    pub fn len(&self) -> usize {
        self.hooks.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.load().is_empty()
    }

    /// 当前快照（分发线程每批读取一次）
    pub fn snapshot(&self) -> Arc<HookManager> {
        self.hooks.load_full()
    }
}

impl Default for ConsumerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn recording(log: Arc<Mutex<Vec<&'static str>>>, tag: &'static str) -> Arc<dyn SampleConsumer> {
        Arc::new(FnConsumer::named(tag, move |_, _| {
            log.lock().push(tag);
            Ok(())
        }))
    }

    #[test]
    fn test_registration_order_preserved() {
        let registry = ConsumerRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.add(recording(log.clone(), "a"));
        registry.add(recording(log.clone(), "b"));
        registry.add(recording(log.clone(), "c"));

        let device = DeviceId::new("left").unwrap();
        for consumer in registry.snapshot().iter() {
            consumer.on_batch(&device, &[]).unwrap();
        }
        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_remove_consumer() {
        let registry = ConsumerRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = registry.add(recording(log.clone(), "a"));
        let b = registry.add(recording(log, "b"));
        assert_ne!(a, b);

        assert!(registry.remove(a));
        assert!(!registry.remove(a));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.snapshot().iter().next().unwrap().name(), "b");
    }

    #[test]
    fn test_snapshot_unaffected_by_later_changes() {
        let registry = ConsumerRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.add(recording(log.clone(), "a"));

        let snapshot = registry.snapshot();
        registry.add(recording(log, "b"));
        assert_eq!(snapshot.len(), 1);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_fn_consumer_error() {
        let consumer = FnConsumer::new(|_, batch: &[SampleRecord]| {
            if batch.is_empty() {
                Err(ConsumerError::other("empty batch"))
            } else {
                Ok(())
            }
        });
        let device = DeviceId::new("left").unwrap();
        assert!(consumer.on_batch(&device, &[]).is_err());
        assert_eq!(consumer.name(), "fn");
    }
}
