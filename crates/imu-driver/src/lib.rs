//! 驱动层模块
//!
//! 多设备 IMU 数据流的运行时，包括：
//! - 每设备一个接收线程（连接状态机、指数退避重连）
//! - 加速度计/陀螺仪按时间戳融合（`sync`）
//! - 固定容量内存池 + 每设备 SPSC 环形缓冲区
//! - 单个分发线程：批量排空并调用消费者
//! - 原子性能计数与快照
//!
//! # 数据流
//!
//! ```text
//! network → DeviceReceiver → StreamSynchronizer → MemoryPool slot → RingBuffer
//!         → Dispatcher → SampleConsumer / latest / history
//! ```
//!
//! 大多数用户应通过 [`ManagerBuilder`] 构造 [`StreamManager`]，并使用
//! [`ImuManager`] trait 控制。

mod builder;
pub mod clock;
pub mod config;
mod dispatcher;
mod error;
pub mod history;
pub mod hooks;
mod manager;
pub mod metrics;
pub mod mode;
pub mod pool;
mod receiver;
pub mod recording;
pub mod ring;
pub mod sync;

pub use builder::ManagerBuilder;
pub use clock::{HostClock, TimestampNormalizer};
pub use config::{ManagerConfig, TimestampMode};
pub use error::{ConfigError, ConsumerError, DriverError, PoolError};
pub use history::HistoryWindow;
pub use hooks::{ConsumerId, ConsumerRegistry, FnConsumer, HookManager, SampleConsumer};
pub use manager::{ImuManager, StreamManager};
pub use metrics::{
    DeviceMetrics, DeviceStats, DispatchMetrics, ManagerStats, PerformanceMonitor, TotalStats,
};
pub use mode::{AtomicConnectionState, ConnectionState, ConnectionTracker, StateTransition};
pub use pool::{MemoryPool, PoolStats, SlotId};
pub use receiver::Backoff;
pub use recording::{ChannelConsumer, RecordBatch};
pub use ring::{RingBuffer, RingConsumer, RingProducer};
pub use sync::{StreamSynchronizer, SyncStats};
