//! # IMU Transport Layer
//!
//! 设备连接抽象层，提供统一的"按消息接收"接口。
//!
//! - `ws`: WebSocket 文本帧（手表端 `ws://{ip}:8081/imu`）
//! - `tcp`: 按行分隔的 JSON 流
//! - `udp`: 每个数据报一条 JSON 消息
//! - `mock`: 无网络的内存通道（feature `mock`）
//! - `sim`: 稳定速率的采样生成器与 TCP / WebSocket 仿真服务

use imu_protocol::DeviceId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub mod sim;
pub mod tcp;
pub mod udp;
pub mod ws;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use tcp::TcpLineSource;
pub use udp::UdpSource;
pub use ws::WsSource;

#[cfg(any(test, feature = "mock"))]
pub use mock::{MockConnector, MockDevice};

/// 传输层统一错误类型
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Read timeout")]
    Timeout,
    #[error("Connection closed by peer")]
    Closed,
    #[error("Failed to connect to {address}: {reason}")]
    Connect { address: String, reason: String },
    #[error("Message exceeds {limit} bytes")]
    Oversized { limit: usize },
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

impl TransportError {
    /// 连接级错误：当前连接已不可用，需要重连
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            TransportError::Io(_) | TransportError::Closed | TransportError::Connect { .. }
        )
    }
}

/// 传输类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// 主机主动连接设备，按行接收
    #[default]
    Tcp,
    /// 主机绑定本地地址，设备推送数据报
    Udp,
    /// 主机主动连接设备的 WebSocket 服务，每帧一条消息
    Ws,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Tcp => f.write_str("tcp"),
            TransportKind::Udp => f.write_str("udp"),
            TransportKind::Ws => f.write_str("ws"),
        }
    }
}

/// 设备端点
///
/// 对 TCP / WebSocket，`address` 是设备地址；对 UDP，`address` 是主机本地绑定地址。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEndpoint {
    pub device_id: DeviceId,
    pub address: String,
    #[serde(default)]
    pub transport: TransportKind,
}

impl DeviceEndpoint {
    pub fn tcp(device_id: DeviceId, address: impl Into<String>) -> Self {
        Self {
            device_id,
            address: address.into(),
            transport: TransportKind::Tcp,
        }
    }

    pub fn ws(device_id: DeviceId, address: impl Into<String>) -> Self {
        Self {
            device_id,
            address: address.into(),
            transport: TransportKind::Ws,
        }
    }

    pub fn udp(device_id: DeviceId, bind_address: impl Into<String>) -> Self {
        Self {
            device_id,
            address: bind_address.into(),
            transport: TransportKind::Udp,
        }
    }
}

impl fmt::Display for DeviceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}/{}", self.device_id, self.address, self.transport)
    }
}

impl FromStr for DeviceEndpoint {
    type Err = TransportError;

    /// 解析 `id=host:port[/tcp|/udp|/ws]`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TransportError::InvalidEndpoint(s.to_string());

        let (id, rest) = s.split_once('=').ok_or_else(invalid)?;
        let device_id = DeviceId::new(id).map_err(|_| invalid())?;

        let (address, transport) = match rest.rsplit_once('/') {
            Some((addr, "tcp")) => (addr, TransportKind::Tcp),
            Some((addr, "udp")) => (addr, TransportKind::Udp),
            Some((addr, "ws")) => (addr, TransportKind::Ws),
            Some(_) => return Err(invalid()),
            None => (rest, TransportKind::Tcp),
        };

        let address = address.trim();
        // host:port，端口必须是数字
        let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
        if host.is_empty() || port.parse::<u16>().is_err() {
            return Err(invalid());
        }

        Ok(Self {
            device_id,
            address: address.to_string(),
            transport,
        })
    }
}

/// 连接参数
#[derive(Debug, Clone, Copy)]
pub struct ConnectOptions {
    /// 建立连接的超时
    pub connect_timeout: Duration,
    /// 单次接收的超时（空闲时接收方借此推进融合超时）
    pub receive_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            receive_timeout: Duration::from_millis(20),
        }
    }
}

/// 关闭句柄
///
/// 由连接创建方提供，可以从任意线程调用以中断阻塞中的读取。
#[derive(Clone, Default)]
pub struct ConnectionCloser {
    close_fn: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl ConnectionCloser {
    pub fn new(close_fn: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            close_fn: Some(Arc::new(close_fn)),
        }
    }

    /// 无需主动关闭的连接（依赖读超时退出）
    pub fn noop() -> Self {
        Self::default()
    }

    pub fn close(&self) {
        if let Some(close_fn) = &self.close_fn {
            close_fn();
        }
    }
}

impl fmt::Debug for ConnectionCloser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionCloser")
            .field("active", &self.close_fn.is_some())
            .finish()
    }
}

/// 消息源：一条已建立的设备连接
pub trait SampleSource: Send {
    /// 接收下一条完整消息，覆盖写入 `buf`
    ///
    /// # 错误
    /// - `Timeout`: 在接收超时内没有完整消息（连接仍然有效）
    /// - `Closed` / `Io`: 连接已断开
    fn receive(&mut self, buf: &mut Vec<u8>) -> Result<(), TransportError>;

    /// 获取可跨线程使用的关闭句柄
    fn closer(&self) -> ConnectionCloser;

    /// 对端描述（用于日志）
    fn peer(&self) -> &str;
}

/// 连接工厂
///
/// 接收线程在每次（重）连接时调用。
pub trait Connector: Send + Sync + 'static {
    fn connect(
        &self,
        endpoint: &DeviceEndpoint,
        options: &ConnectOptions,
    ) -> Result<Box<dyn SampleSource>, TransportError>;
}

/// 默认网络连接器（TCP / UDP / WebSocket）
#[derive(Debug, Clone, Copy, Default)]
pub struct NetConnector;

impl Connector for NetConnector {
    fn connect(
        &self,
        endpoint: &DeviceEndpoint,
        options: &ConnectOptions,
    ) -> Result<Box<dyn SampleSource>, TransportError> {
        match endpoint.transport {
            TransportKind::Tcp => Ok(Box::new(TcpLineSource::connect(
                &endpoint.address,
                options.connect_timeout,
                options.receive_timeout,
            )?)),
            TransportKind::Udp => Ok(Box::new(UdpSource::bind(
                &endpoint.address,
                options.receive_timeout,
            )?)),
            TransportKind::Ws => Ok(Box::new(WsSource::connect(
                &endpoint.address,
                options.connect_timeout,
                options.receive_timeout,
            )?)),
        }
    }
}
