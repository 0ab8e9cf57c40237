//! Mock 传输（无网络）
//!
//! 每个设备对应一条持久的内存通道，测试代码通过 `MockDevice` 注入消息、
//! 模拟断线或拒绝连接；接收线程通过 `MockConnector` 建立"连接"。

use crate::{
    ConnectOptions, ConnectionCloser, Connector, DeviceEndpoint, SampleSource, TransportError,
};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use imu_protocol::{DeviceId, WireMessage};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

enum MockEvent {
    Line(Vec<u8>),
    Disconnect,
}

struct MockLink {
    tx: Sender<MockEvent>,
    rx: Receiver<MockEvent>,
    refuse_remaining: AtomicU32,
    connects: AtomicU64,
    /// 当前连接的关闭标志（每次连接重新创建）
    current: Mutex<Option<Arc<AtomicBool>>>,
}

/// 测试侧的设备句柄
#[derive(Clone)]
pub struct MockDevice {
    id: DeviceId,
    link: Arc<MockLink>,
}

impl MockDevice {
    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    /// 注入一条原始消息（不要求合法 JSON）
    pub fn send_raw(&self, line: impl Into<Vec<u8>>) {
        // 通道两端都由 link 持有，发送不会失败
        let _ = self.link.tx.send(MockEvent::Line(line.into()));
    }

    /// 注入一条编码后的消息
    pub fn send(&self, msg: &WireMessage<'_>) {
        match msg.encode() {
            Ok(line) => self.send_raw(line),
            Err(e) => tracing::error!("Failed to encode mock message: {}", e),
        }
    }

    /// 在当前消息序列之后断开连接
    pub fn disconnect(&self) {
        let _ = self.link.tx.send(MockEvent::Disconnect);
    }

    /// 接下来的 `n` 次连接尝试失败
    pub fn refuse_next(&self, n: u32) {
        self.link.refuse_remaining.store(n, Ordering::SeqCst);
    }

    /// 成功建立的连接次数
    pub fn connect_count(&self) -> u64 {
        self.link.connects.load(Ordering::SeqCst)
    }

    /// 尚未被接收的消息数
    pub fn queued(&self) -> usize {
        self.link.rx.len()
    }

    /// 当前是否有活动连接
    pub fn is_connected(&self) -> bool {
        self.link
            .current
            .lock()
            .as_ref()
            .is_some_and(|closed| !closed.load(Ordering::SeqCst))
    }
}

/// Mock 连接器
#[derive(Clone, Default)]
pub struct MockConnector {
    links: Arc<Mutex<HashMap<DeviceId, Arc<MockLink>>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取（必要时创建）设备句柄
    pub fn device(&self, id: &DeviceId) -> MockDevice {
        let link = self
            .links
            .lock()
            .entry(id.clone())
            .or_insert_with(|| {
                let (tx, rx) = unbounded();
                Arc::new(MockLink {
                    tx,
                    rx,
                    refuse_remaining: AtomicU32::new(0),
                    connects: AtomicU64::new(0),
                    current: Mutex::new(None),
                })
            })
            .clone();
        MockDevice {
            id: id.clone(),
            link,
        }
    }
}

impl Connector for MockConnector {
    fn connect(
        &self,
        endpoint: &DeviceEndpoint,
        options: &ConnectOptions,
    ) -> Result<Box<dyn SampleSource>, TransportError> {
        let device = self.device(&endpoint.device_id);
        let link = device.link;

        let refused = link
            .refuse_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::Connect {
                address: endpoint.address.clone(),
                reason: "connection refused (mock)".to_string(),
            });
        }

        let closed = Arc::new(AtomicBool::new(false));
        *link.current.lock() = Some(closed.clone());
        link.connects.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(MockSource {
            rx: link.rx.clone(),
            closed,
            receive_timeout: options.receive_timeout,
            peer: format!("mock://{}", endpoint.device_id),
        }))
    }
}

struct MockSource {
    rx: Receiver<MockEvent>,
    closed: Arc<AtomicBool>,
    receive_timeout: Duration,
    peer: String,
}

impl SampleSource for MockSource {
    fn receive(&mut self, buf: &mut Vec<u8>) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        match self.rx.recv_timeout(self.receive_timeout) {
            Ok(MockEvent::Line(line)) => {
                buf.clear();
                buf.extend_from_slice(&line);
                Ok(())
            },
            Ok(MockEvent::Disconnect) => {
                self.closed.store(true, Ordering::SeqCst);
                Err(TransportError::Closed)
            },
            Err(RecvTimeoutError::Timeout) => Err(TransportError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Closed),
        }
    }

    fn closer(&self) -> ConnectionCloser {
        let closed = self.closed.clone();
        ConnectionCloser::new(move || closed.store(true, Ordering::SeqCst))
    }

    fn peer(&self) -> &str {
        &self.peer
    }
}
