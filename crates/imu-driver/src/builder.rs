//! Builder 模式实现
//!
//! 提供链式构造 `StreamManager` 实例的便捷方式。

use crate::config::{ManagerConfig, TimestampMode};
use crate::error::DriverError;
use crate::hooks::SampleConsumer;
use crate::manager::{ImuManager, StreamManager};
use imu_transport::{Connector, NetConnector};
use std::sync::Arc;
use std::time::Duration;

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

/// StreamManager Builder（链式构造）
///
/// # Example
///
/// ```no_run
/// use imu_driver::{ImuManager, ManagerBuilder};
/// use imu_transport::DeviceEndpoint;
/// use std::time::Duration;
///
/// let manager = ManagerBuilder::new()
///     .ring_capacity(512)
///     .fusion_window(Duration::from_millis(8))
///     .build()
///     .unwrap();
///
/// let endpoint: DeviceEndpoint = "left=192.168.1.20:8765".parse().unwrap();
/// manager.start(vec![endpoint]).unwrap();
/// ```
pub struct ManagerBuilder<C = NetConnector> {
    config: ManagerConfig,
    connector: C,
    consumers: Vec<Arc<dyn SampleConsumer>>,
}

impl ManagerBuilder<NetConnector> {
    pub fn new() -> Self {
        Self {
            config: ManagerConfig::default(),
            connector: NetConnector,
            consumers: Vec::new(),
        }
    }
}

impl Default for ManagerBuilder<NetConnector> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Connector> ManagerBuilder<C> {
    /// 替换连接器（例如 mock 或模拟器）
    pub fn connector<C2: Connector>(self, connector: C2) -> ManagerBuilder<C2> {
        ManagerBuilder {
            config: self.config,
            connector,
            consumers: self.consumers,
        }
    }

    /// 整体替换配置
    pub fn config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn ring_capacity(mut self, capacity: usize) -> Self {
        self.config.ring_capacity = capacity;
        self
    }

    pub fn pool_multiplier(mut self, multiplier: usize) -> Self {
        self.config.pool_multiplier = multiplier;
        self
    }

    pub fn fusion_window(mut self, window: Duration) -> Self {
        self.config.fusion_window_ms = millis(window);
        self
    }

    pub fn fusion_timeout(mut self, timeout: Duration) -> Self {
        self.config.fusion_timeout_ms = millis(timeout);
        self
    }

    pub fn drain_interval(mut self, interval: Duration) -> Self {
        self.config.drain_interval_ms = millis(interval);
        self
    }

    pub fn max_batch(mut self, max_batch: usize) -> Self {
        self.config.max_batch = max_batch;
        self
    }

    /// 重连退避（首次等待，上限）
    pub fn backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.config.backoff_initial_ms = millis(initial);
        self.config.backoff_max_ms = millis(max);
        self
    }

    pub fn receive_timeout(mut self, timeout: Duration) -> Self {
        self.config.receive_timeout_ms = millis(timeout);
        self
    }

    pub fn callback_grace(mut self, grace: Duration) -> Self {
        self.config.callback_grace_ms = millis(grace);
        self
    }

    pub fn history_capacity(mut self, capacity: usize) -> Self {
        self.config.history_capacity = capacity;
        self
    }

    pub fn timestamp_mode(mut self, mode: TimestampMode) -> Self {
        self.config.timestamp_mode = mode;
        self
    }

    /// 预先注册消费者
    pub fn consumer(mut self, consumer: Arc<dyn SampleConsumer>) -> Self {
        self.consumers.push(consumer);
        self
    }

    /// 校验配置并构建
    pub fn build(self) -> Result<StreamManager<C>, DriverError> {
        let manager = StreamManager::with_connector(self.config, self.connector)?;
        for consumer in self.consumers {
            manager.add_consumer(consumer);
        }
        Ok(manager)
    }
}
