//! TCP 行分隔 JSON 流

use crate::{ConnectionCloser, SampleSource, TransportError};
use std::io::{BufRead, BufReader, ErrorKind, Read};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// 单行消息上限，超过视为协议错误
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// 最短读超时（`set_read_timeout` 不接受零）
pub(crate) const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);

/// 建立 TCP 连接
///
/// 依次尝试地址解析出的每个 socket 地址，全部失败时返回 `Connect`。
pub(crate) fn connect_stream(
    address: &str,
    connect_timeout: Duration,
) -> Result<TcpStream, TransportError> {
    let connect_err = |reason: String| TransportError::Connect {
        address: address.to_string(),
        reason,
    };

    let addrs = address
        .to_socket_addrs()
        .map_err(|e| connect_err(format!("address resolution failed: {e}")))?;

    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, connect_timeout) {
            Ok(stream) => {
                debug!("TCP connected to {} ({})", address, addr);
                return Ok(stream);
            },
            Err(e) => {
                trace!("TCP connect to {} failed: {}", addr, e);
                last_error = Some(e);
            },
        }
    }

    Err(connect_err(match last_error {
        Some(e) => e.to_string(),
        None => "address resolved to nothing".to_string(),
    }))
}

/// 按行接收的 TCP 连接
pub struct TcpLineSource {
    reader: BufReader<TcpStream>,
    /// 跨超时保留的半行数据
    pending: Vec<u8>,
    /// 正在丢弃超长行的剩余部分（直到下一个换行）
    discarding: bool,
    peer: String,
}

impl TcpLineSource {
    /// 连接到设备
    pub fn connect(
        address: &str,
        connect_timeout: Duration,
        receive_timeout: Duration,
    ) -> Result<Self, TransportError> {
        Self::from_stream(connect_stream(address, connect_timeout)?, receive_timeout)
    }

    /// 包装已建立的连接
    pub fn from_stream(stream: TcpStream, receive_timeout: Duration) -> Result<Self, TransportError> {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }
        stream.set_read_timeout(Some(receive_timeout.max(MIN_READ_TIMEOUT)))?;

        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        Ok(Self {
            reader: BufReader::new(stream),
            pending: Vec::with_capacity(256),
            discarding: false,
            peer,
        })
    }
}

impl SampleSource for TcpLineSource {
    fn receive(&mut self, buf: &mut Vec<u8>) -> Result<(), TransportError> {
        loop {
            // 每次读取最多补足到 MAX_LINE_BYTES + 1，pending 不会无限增长
            let limit = (MAX_LINE_BYTES + 1).saturating_sub(self.pending.len()) as u64;
            // read_until 在出错时保留已读取的字节，半行数据留在 pending 中
            match (&mut self.reader).take(limit).read_until(b'\n', &mut self.pending) {
                Ok(0) => {
                    if !self.pending.is_empty() {
                        debug!(
                            "Discarding {} bytes of partial line from {}",
                            self.pending.len(),
                            self.peer
                        );
                        self.pending.clear();
                    }
                    return Err(TransportError::Closed);
                },
                Ok(_) => {
                    if self.pending.last() != Some(&b'\n') {
                        if self.pending.len() > MAX_LINE_BYTES {
                            self.pending.clear();
                            if !self.discarding {
                                self.discarding = true;
                                return Err(TransportError::Oversized {
                                    limit: MAX_LINE_BYTES,
                                });
                            }
                        }
                        // 否则是 EOF 前的残行，下一次读取返回 0
                        continue;
                    }
                    if self.discarding {
                        self.discarding = false;
                        self.pending.clear();
                        continue;
                    }
                    if self.pending.iter().all(|b| b.is_ascii_whitespace()) {
                        self.pending.clear();
                        continue;
                    }
                    buf.clear();
                    buf.extend_from_slice(&self.pending);
                    self.pending.clear();
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

    fn closer(&self) -> ConnectionCloser {
        match self.reader.get_ref().try_clone() {
            Ok(stream) => ConnectionCloser::new(move || {
                // 对端可能已关闭，忽略错误
                let _ = stream.shutdown(Shutdown::Both);
            }),
            Err(e) => {
                warn!("Failed to clone TCP stream for closer: {}", e);
                ConnectionCloser::noop()
            },
        }
    }

    fn peer(&self) -> &str {
        &self.peer
    }
}
