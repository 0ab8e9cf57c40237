//! Prelude - 常用类型的便捷导入
//!
//! ```rust
//! use imu_sdk::prelude::*;
//! ```

// 管理器
pub use imu_driver::{ImuManager, ManagerBuilder, ManagerConfig, StreamManager, TimestampMode};

// 消费者
pub use imu_driver::{ChannelConsumer, ConsumerError, ConsumerId, FnConsumer, RecordBatch, SampleConsumer};

// 统计
pub use imu_driver::{ConnectionState, DeviceStats, ManagerStats};

// 数据类型
pub use imu_protocol::{DeviceId, ExportRow, SampleRecord, Vec3};
pub use imu_transport::DeviceEndpoint;

// 错误类型
pub use imu_driver::{ConfigError, DriverError};
pub use imu_protocol::ProtocolError;
pub use imu_transport::TransportError;
