//! IMU SDK - 腕戴设备多路 IMU 实时采集
//!
//! # 架构设计
//!
//! 分层结构，从底层到高层：
//!
//! - **协议层** (`protocol`): 线协议解码、`SampleRecord`、导出行
//! - **传输层** (`transport`): TCP/UDP 连接、仿真设备、mock
//! - **驱动层** (`driver`): 接收线程、融合、内存池、环形缓冲区、分发
//!
//! # 快速开始
//!
//! ```no_run
//! use imu_sdk::prelude::*;
//! use std::sync::Arc;
//!
//! imu_sdk::init_logging("imu=info").ok();
//!
//! let manager = ManagerBuilder::new().build().unwrap();
//! manager.add_consumer(Arc::new(FnConsumer::new(|device: &DeviceId, batch: &[SampleRecord]| {
//!     println!("{}: {} records", device, batch.len());
//!     Ok(())
//! })));
//!
//! let endpoint: DeviceEndpoint = "left=192.168.1.20:8765".parse().unwrap();
//! manager.start(vec![endpoint]).unwrap();
//! ```

pub mod prelude;

pub use imu_driver as driver;
pub use imu_protocol as protocol;
pub use imu_transport as transport;

// --- 用户以此为界 ---

pub use imu_protocol::{DeviceId, ExportRow, ProtocolError, SampleRecord, Vec3};
pub use imu_transport::{DeviceEndpoint, TransportError, TransportKind};

pub use imu_driver::{
    ChannelConsumer, ConnectionState, ConsumerError, DriverError, FnConsumer, ImuManager,
    ManagerBuilder, ManagerConfig, ManagerStats, SampleConsumer, StreamManager,
};

use tracing_subscriber::EnvFilter;

/// 初始化日志
///
/// `RUST_LOG` 优先；未设置时使用 `default_directive`（例如 `"imu_driver=info"`）。
/// 同时把 `log` crate 的记录桥接到 tracing。重复调用返回错误。
pub fn init_logging(default_directive: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_directive))?;

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    tracing_log::LogTracer::init()?;
    Ok(())
}
