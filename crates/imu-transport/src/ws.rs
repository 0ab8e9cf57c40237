//! WebSocket 文本帧流
//!
//! 手表端在 `ws://{ip}:8081/imu` 提供服务，每个文本帧是一条 JSON 消息。
//! 底层仍是阻塞 `TcpStream` + 读超时，`tungstenite` 在 `WouldBlock` 后可以继续读取半帧。

use crate::tcp::{MIN_READ_TIMEOUT, connect_stream};
use crate::{ConnectionCloser, SampleSource, TransportError};
use std::io::{self, ErrorKind};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;
use tracing::{debug, warn};
use tungstenite::{Message, WebSocket};

/// 手表端 WebSocket 服务路径
pub const WS_PATH: &str = "/imu";

/// 单帧消息上限，超过视为协议错误
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// WebSocket 连接
pub struct WsSource {
    socket: WebSocket<TcpStream>,
    peer: String,
}

impl WsSource {
    /// 连接 `ws://{address}/imu` 并完成握手
    ///
    /// 握手期间使用 `connect_timeout` 作为读写超时，之后切换为 `receive_timeout`。
    pub fn connect(
        address: &str,
        connect_timeout: Duration,
        receive_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let stream = connect_stream(address, connect_timeout)?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }
        let handshake_timeout = Some(connect_timeout.max(MIN_READ_TIMEOUT));
        stream.set_read_timeout(handshake_timeout)?;
        stream.set_write_timeout(handshake_timeout)?;

        let url = format!("ws://{address}{WS_PATH}");
        let (socket, response) =
            tungstenite::client(url.as_str(), stream).map_err(|e| TransportError::Connect {
                address: address.to_string(),
                reason: format!("WebSocket handshake failed: {e}"),
            })?;
        debug!("WebSocket connected to {} ({})", url, response.status());

        socket
            .get_ref()
            .set_read_timeout(Some(receive_timeout.max(MIN_READ_TIMEOUT)))?;

        Ok(Self { socket, peer: url })
    }

    fn deliver(payload: &[u8], buf: &mut Vec<u8>) -> Result<(), TransportError> {
        if payload.len() > MAX_FRAME_BYTES {
            return Err(TransportError::Oversized {
                limit: MAX_FRAME_BYTES,
            });
        }
        buf.clear();
        buf.extend_from_slice(payload);
        Ok(())
    }
}

impl SampleSource for WsSource {
    fn receive(&mut self, buf: &mut Vec<u8>) -> Result<(), TransportError> {
        loop {
            match self.socket.read() {
                Ok(Message::Text(text)) => return Self::deliver(text.as_str().as_bytes(), buf),
                Ok(Message::Binary(data)) => return Self::deliver(&data, buf),
                Ok(Message::Close(frame)) => {
                    debug!("WebSocket {} closed by peer: {:?}", self.peer, frame);
                    return Err(TransportError::Closed);
                },
                // Ping 的回复由 tungstenite 在下一次读写时发出
                Ok(_) => continue,
                Err(tungstenite::Error::Io(e)) => {
                    return match e.kind() {
                        ErrorKind::Interrupted => continue,
                        ErrorKind::WouldBlock | ErrorKind::TimedOut => Err(TransportError::Timeout),
                        _ => Err(TransportError::Io(e)),
                    };
                },
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                    return Err(TransportError::Closed);
                },
                Err(e) => return Err(TransportError::Io(io::Error::other(e.to_string()))),
            }
        }
    }

    fn closer(&self) -> ConnectionCloser {
        match self.socket.get_ref().try_clone() {
            Ok(stream) => ConnectionCloser::new(move || {
                let _ = stream.shutdown(Shutdown::Both);
            }),
            Err(e) => {
                warn!("Failed to clone WebSocket stream for closer: {}", e);
                ConnectionCloser::noop()
            },
        }
    }

    fn peer(&self) -> &str {
        &self.peer
    }
}
