//! UDP 数据报传输：每个数据报一条 JSON 消息

use crate::{ConnectionCloser, SampleSource, TransportError};
use std::io::ErrorKind;
use std::net::UdpSocket;
use std::time::Duration;
use tracing::debug;

/// 最大数据报长度
const MAX_DATAGRAM: usize = 65_507;

pub struct UdpSource {
    socket: UdpSocket,
    datagram: Box<[u8]>,
    local: String,
}

impl UdpSource {
    /// 绑定本地地址，等待设备推送
    pub fn bind(bind_address: &str, receive_timeout: Duration) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(bind_address).map_err(|e| TransportError::Connect {
            address: bind_address.to_string(),
            reason: e.to_string(),
        })?;
        socket.set_read_timeout(Some(receive_timeout.max(Duration::from_millis(1))))?;

        let local = socket
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| bind_address.to_string());
        debug!("UDP source bound to {}", local);

        Ok(Self {
            socket,
            datagram: vec![0u8; MAX_DATAGRAM].into_boxed_slice(),
            local,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.socket.local_addr()
    }
}

impl SampleSource for UdpSource {
    fn receive(&mut self, buf: &mut Vec<u8>) -> Result<(), TransportError> {
        loop {
            match self.socket.recv_from(&mut self.datagram) {
                Ok((0, _)) => continue,
                Ok((len, _from)) => {
                    buf.clear();
                    buf.extend_from_slice(&self.datagram[..len]);
                    return Ok(());
                },
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Err(TransportError::Timeout);
                },
                Err(e) => return Err(TransportError::Io(e)),
            }
        }
    }

    /// 无连接套接字，依赖读超时让接收线程退出
    fn closer(&self) -> ConnectionCloser {
        ConnectionCloser::noop()
    }

    fn peer(&self) -> &str {
        &self.local
    }
}
