//! # IMU Tools - 导出格式与统计算法
//!
//! **依赖原则**: 只依赖 `imu-protocol`，不依赖 `imu-driver`
//!
//! ## 包含模块
//!
//! - `export` - 每设备 CSV 导出（带 `#` 元数据前导行）
//! - `statistics` - 速率、丢失率、延迟统计（纯函数，可选）
//!
//! ## Feature Flags
//!
//! - `default` - 无默认 features
//! - `full` - 启用所有功能（包含 statistics）
//! - `statistics` - 启用统计模块

pub mod export;

#[cfg(feature = "statistics")]
pub mod statistics;

pub use export::{ExportFile, SessionMetadata, load_csv, save_csv, unix_time_ms, write_csv};
#[cfg(feature = "statistics")]
pub use statistics::{LatencyStatistics, StreamStatistics, percentile};
