//! 驱动层错误类型定义

use imu_protocol::{DeviceId, ProtocolError};
use imu_transport::TransportError;
use thiserror::Error;

/// 内存池错误
///
/// `PoolExhausted` 是正常的背压信号（计为丢弃）；其余变体表示内部不变量被破坏。
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    #[error("Memory pool exhausted")]
    PoolExhausted,

    #[error("Slot {index} released while not checked out")]
    DoubleRelease { index: u32 },

    #[error("Stale reference to slot {index}")]
    UseAfterRelease { index: u32 },

    #[error("Slot {index} holds no record")]
    EmptySlot { index: u32 },
}

/// 配置错误（`start()` 同步返回）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("No device endpoints configured")]
    NoEndpoints,

    #[error("Duplicate device id: {0}")]
    DuplicateDevice(DeviceId),

    #[error("Invalid value for `{field}`: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Failed to read config file {path}: {reason}")]
    Io { path: String, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

/// 驱动层错误类型
#[derive(Error, Debug)]
pub enum DriverError {
    /// 配置校验失败
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Manager already running")]
    AlreadyRunning,

    #[error("Manager not running")]
    NotRunning,

    /// 传输层错误
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// 协议解析错误
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Unknown device: {0}")]
    UnknownDevice(DeviceId),

    /// 工作线程创建失败
    #[error("Failed to spawn {name} thread: {source}")]
    ThreadSpawn {
        name: String,
        source: std::io::Error,
    },

    /// 操作超时
    #[error("Operation timeout")]
    Timeout,
}

/// 消费者回调返回的错误（记录并计数，不会中断分发）
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Consumer disconnected")]
    Disconnected,

    #[error("{0}")]
    Other(String),
}

impl ConsumerError {
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }
}
