//! 设备接收线程
//!
//! 每个设备一个线程，独占该设备的连接、时间戳归一化器、同步器和环形缓冲区生产端：
//!
//! ```text
//! connect ──→ receive ──→ decode ──→ normalize ──→ sync ──→ pool slot ──→ ring
//!    ↑                                                      (满: 丢弃最新, 释放槽)
//!    └── backoff (1s, 2s, 4s, 8s, 10s...) ←── 连接失败 / 断开
//! ```
//!
//! 接收超时是正常情况：借此推进同步器的融合超时。

use crate::clock::{HostClock, TimestampNormalizer};
use crate::config::ManagerConfig;
use crate::error::{DriverError, PoolError};
use crate::metrics::{DeviceMonitor, RateWindow};
use crate::mode::ConnectionState;
use crate::pool::{MemoryPool, SlotId};
use crate::ring::RingProducer;
use crate::sync::{PENDING_DEPTH, StreamSynchronizer};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use imu_protocol::{SampleRecord, decode_message};
use imu_transport::{
    ConnectOptions, ConnectionCloser, Connector, DeviceEndpoint, SampleSource, TransportError,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// 热路径日志限流：第一次和之后每 N 次输出一次
const LOG_EVERY: u64 = 1000;

fn should_log(count: u64) -> bool {
    count == 1 || count % LOG_EVERY == 0
}

/// 指数退避
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            next: initial.min(max),
        }
    }

    /// 返回本次等待时长，并把下一次翻倍（不超过上限）
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.initial.min(self.max);
    }
}

enum SessionEnd {
    Stopped,
    Lost(TransportError),
}

/// 单设备接收线程的全部状态
pub(crate) struct DeviceReceiver<C> {
    pub endpoint: DeviceEndpoint,
    pub connector: Arc<C>,
    pub config: ManagerConfig,
    pub pool: Arc<MemoryPool>,
    pub producer: RingProducer<SlotId>,
    pub monitor: Arc<DeviceMonitor>,
    pub clock: HostClock,
    pub is_running: Arc<AtomicBool>,
    /// 发送端被丢弃即表示停止（用于打断退避等待）
    pub stop_rx: Receiver<()>,
    /// 当前连接的关闭句柄，`stop()` 通过它打断阻塞中的读取
    pub closer: Arc<Mutex<ConnectionCloser>>,
}

impl<C: Connector> DeviceReceiver<C> {
    pub fn spawn(self) -> Result<JoinHandle<()>, DriverError> {
        let name = format!("imu-rx-{}", self.endpoint.device_id);
        thread::Builder::new()
            .name(name.clone())
            .spawn(move || self.run())
            .map_err(|source| DriverError::ThreadSpawn { name, source })
    }

    fn is_running(&self) -> bool {
        // Acquire: 看到 false 时必须同时看到 stop() 之前的写入
        self.is_running.load(Ordering::Acquire)
    }

    fn set_state(&self, state: ConnectionState) {
        self.monitor
            .connection
            .transition(state, self.clock.now_ns());
    }

    fn run(mut self) {
        // 设置线程优先级（可选 feature）
        #[cfg(feature = "realtime")]
        {
            use thread_priority::*;

            match set_current_thread_priority(ThreadPriority::Max) {
                Ok(_) => {
                    info!("RX thread priority set to MAX (realtime)");
                },
                Err(e) => {
                    warn!(
                        "Failed to set RX thread priority: {}. \
                        On Linux, you may need to run with CAP_SYS_NICE or use rtkit.",
                        e
                    );
                },
            }
        }

        let device_id = self.endpoint.device_id.clone();
        info!("Receiver {} started ({})", device_id, self.endpoint);

        let options = ConnectOptions {
            connect_timeout: self.config.connect_timeout(),
            receive_timeout: self.config.receive_timeout(),
        };
        let mut backoff = Backoff::new(self.config.backoff_initial(), self.config.backoff_max());
        let mut sync = StreamSynchronizer::new(
            device_id.clone(),
            self.config.fusion_window(),
            self.config.fusion_timeout(),
        );
        let mut normalizer = TimestampNormalizer::new(self.config.timestamp_mode);
        let mut rate = RateWindow::new(self.config.rate_window());

        while self.is_running() {
            self.set_state(ConnectionState::Connecting);

            match self.connector.connect(&self.endpoint, &options) {
                Ok(mut source) => {
                    *self.closer.lock() = source.closer();
                    // stop() 可能发生在连接建立期间，此时它看不到新的关闭句柄
                    if !self.is_running() {
                        source.closer().close();
                        break;
                    }

                    info!("Receiver {} connected to {}", device_id, source.peer());
                    self.set_state(ConnectionState::Streaming);
                    backoff.reset();

                    let end =
                        self.stream(source.as_mut(), &mut sync, &mut normalizer, &mut rate);

                    *self.closer.lock() = ConnectionCloser::noop();
                    // 时间戳偏移跨重连保留，补发的旧数据由顺序保护丢弃
                    sync.reset();

                    match end {
                        SessionEnd::Stopped => break,
                        SessionEnd::Lost(e) => {
                            warn!("Receiver {} lost connection: {}", device_id, e);
                        },
                    }
                },
                Err(e) => {
                    warn!(
                        "Receiver {} failed to connect to {}: {}",
                        device_id, self.endpoint.address, e
                    );
                },
            }

            if !self.is_running() {
                break;
            }
            self.set_state(ConnectionState::Reconnecting);
            self.monitor.metrics.set_message_rate(0.0);

            let delay = backoff.next_delay();
            debug!("Receiver {} reconnecting in {:?}", device_id, delay);
            match self.stop_rx.recv_timeout(delay) {
                Err(RecvTimeoutError::Timeout) => continue,
                // 发送端已丢弃：stop()
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        self.set_state(ConnectionState::Disconnected);
        info!("Receiver {} exited", device_id);
    }

    /// 处理一次连接直到断开或停止
    fn stream(
        &mut self,
        source: &mut dyn SampleSource,
        sync: &mut StreamSynchronizer,
        normalizer: &mut TimestampNormalizer,
        rate: &mut RateWindow,
    ) -> SessionEnd {
        let monitor = self.monitor.clone();
        let metrics = &monitor.metrics;
        let device_id = self.endpoint.device_id.clone();

        let mut buf = Vec::with_capacity(512);
        let mut fused: Vec<SampleRecord> = Vec::with_capacity(PENDING_DEPTH * 2);

        loop {
            if !self.is_running() {
                trace!("Receiver {}: is_running flag is false", device_id);
                return SessionEnd::Stopped;
            }

            match source.receive(&mut buf) {
                Ok(()) => {
                    let received_ns = self.clock.now_ns();
                    metrics.messages_received.fetch_add(1, Ordering::Relaxed);
                    metrics
                        .bytes_received
                        .fetch_add(buf.len() as u64, Ordering::Relaxed);

                    let now = Instant::now();
                    rate.record(now, 1);
                    metrics.set_message_rate(rate.rate_hz(now));

                    match decode_message(&buf) {
                        Ok(msg) if msg.device_id != device_id.as_str() => {
                            let n = metrics.foreign_messages.fetch_add(1, Ordering::Relaxed) + 1;
                            if should_log(n) {
                                warn!(
                                    "Receiver {}: dropping message for device {:?} ({} so far)",
                                    device_id, msg.device_id, n
                                );
                            }
                        },
                        Ok(msg) => {
                            let ts = normalizer.normalize(msg.timestamp_ns, received_ns);
                            sync.push(msg.channel, ts, msg.value, received_ns, &mut fused);
                        },
                        Err(e) => {
                            let n = metrics.decode_errors.fetch_add(1, Ordering::Relaxed) + 1;
                            if should_log(n) {
                                warn!(
                                    "Receiver {}: malformed message ({} so far): {}",
                                    device_id, n, e
                                );
                            }
                        },
                    }
                },
                Err(TransportError::Timeout) => {
                    sync.expire(self.clock.now_ns(), &mut fused);
                    metrics.set_message_rate(rate.rate_hz(Instant::now()));
                },
                Err(TransportError::Oversized { limit }) => {
                    let n = metrics.decode_errors.fetch_add(1, Ordering::Relaxed) + 1;
                    if should_log(n) {
                        warn!(
                            "Receiver {}: discarded message over {} bytes",
                            device_id, limit
                        );
                    }
                },
                Err(e) => {
                    if !self.is_running() {
                        return SessionEnd::Stopped;
                    }
                    return SessionEnd::Lost(e);
                },
            }

            metrics.store_sync_stats(sync.stats());
            if !fused.is_empty() {
                self.enqueue(&mut fused);
            }
        }
    }

    /// 写入内存池并推入环形缓冲区
    fn enqueue(&mut self, records: &mut Vec<SampleRecord>) {
        let metrics = &self.monitor.metrics;

        for record in records.drain(..) {
            let slot = match self.pool.acquire() {
                Ok(slot) => slot,
                Err(PoolError::PoolExhausted) => {
                    let n = metrics.pool_exhausted.fetch_add(1, Ordering::Relaxed) + 1;
                    if should_log(n) {
                        warn!(
                            "Receiver {}: memory pool exhausted, record dropped ({} so far)",
                            self.endpoint.device_id, n
                        );
                    }
                    continue;
                },
                Err(e) => {
                    internal_error(&metrics.internal_errors, &self.endpoint, e);
                    continue;
                },
            };

            if let Err(e) = self.pool.write(slot, record) {
                internal_error(&metrics.internal_errors, &self.endpoint, e);
                if let Err(e) = self.pool.release(slot) {
                    internal_error(&metrics.internal_errors, &self.endpoint, e);
                }
                continue;
            }

            if !self.producer.try_push(slot) {
                // 缓冲区满：丢弃最新记录
                if let Err(e) = self.pool.release(slot) {
                    internal_error(&metrics.internal_errors, &self.endpoint, e);
                }
                let n = self.monitor.ring().overflow_count();
                if should_log(n) {
                    warn!(
                        "Receiver {}: ring buffer full, record dropped ({} so far)",
                        self.endpoint.device_id, n
                    );
                }
            }
        }
    }
}

fn internal_error(counter: &AtomicU64, endpoint: &DeviceEndpoint, e: PoolError) {
    counter.fetch_add(1, Ordering::Relaxed);
    error!("Receiver {}: memory pool invariant violated: {}", endpoint.device_id, e);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::DeviceMonitor;
    use crate::ring::{RingBuffer, RingConsumer};
    use crossbeam_channel::{Sender, bounded};
    use imu_protocol::{Channel, DeviceId, Vec3, WireMessage};
    use imu_transport::MockConnector;
    use std::borrow::Cow;

    #[test]
    fn test_backoff_sequence() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(10));
        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 10, 10]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_initial_above_max() {
        let mut backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
    }

    struct Harness {
        handle: Option<JoinHandle<()>>,
        is_running: Arc<AtomicBool>,
        stop_tx: Option<Sender<()>>,
        closer: Arc<Mutex<ConnectionCloser>>,
        consumer: RingConsumer<SlotId>,
        pool: Arc<MemoryPool>,
        monitor: Arc<DeviceMonitor>,
    }

    impl Harness {
        fn start(connector: Arc<MockConnector>, id: &DeviceId, config: ManagerConfig) -> Self {
            let (producer, consumer) = RingBuffer::with_capacity(config.ring_capacity);
            let monitor = Arc::new(DeviceMonitor::new(id.clone(), producer.ring(), 16));
            let pool = Arc::new(MemoryPool::new(config.pool_capacity(1).unwrap()).unwrap());
            let is_running = Arc::new(AtomicBool::new(true));
            let (stop_tx, stop_rx) = bounded(0);
            let closer = Arc::new(Mutex::new(ConnectionCloser::noop()));

            let receiver = DeviceReceiver {
                endpoint: DeviceEndpoint::tcp(id.clone(), "mock"),
                connector,
                config,
                pool: pool.clone(),
                producer,
                monitor: monitor.clone(),
                clock: HostClock::new(),
                is_running: is_running.clone(),
                stop_rx,
                closer: closer.clone(),
            };
            Self {
                handle: Some(receiver.spawn().unwrap()),
                is_running,
                stop_tx: Some(stop_tx),
                closer,
                consumer,
                pool,
                monitor,
            }
        }

        fn drain(&mut self) -> Vec<SampleRecord> {
            let mut slots = Vec::new();
            self.consumer.try_pop_batch(usize::MAX, &mut slots);
            slots
                .into_iter()
                .map(|slot| {
                    let record = self.pool.take(slot).unwrap();
                    self.pool.release(slot).unwrap();
                    record
                })
                .collect()
        }

        fn stop(&mut self) {
            self.is_running.store(false, Ordering::Release);
            self.stop_tx.take();
            self.closer.lock().close();
            if let Some(handle) = self.handle.take() {
                handle.join().unwrap();
            }
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn message(id: &DeviceId, channel: Channel, ts_ms: u64) -> WireMessage<'static> {
        WireMessage {
            device_id: Cow::Owned(id.to_string()),
            channel,
            timestamp_ns: ts_ms * 1_000_000,
            value: Vec3::new(1.0, 2.0, 3.0),
        }
    }

    #[test]
    fn test_receiver_fuses_and_enqueues() {
        let connector = Arc::new(MockConnector::new());
        let id = DeviceId::new("left").unwrap();
        let device = connector.device(&id);
        let mut h = Harness::start(connector, &id, ManagerConfig::default());

        for i in 0..5 {
            device.send(&message(&id, Channel::Accel, i * 10));
            device.send(&message(&id, Channel::Gyro, i * 10 + 2));
        }
        device.send_raw("not json");
        device.send(&message(&DeviceId::new("right").unwrap(), Channel::Accel, 0));

        let mut records = Vec::new();
        assert!(wait_until(|| {
            records.extend(h.drain());
            records.len() >= 5
        }));
        assert!(records.iter().all(|r| r.is_fully_fused()));
        assert!(records.windows(2).all(|w| w[0].timestamp_ns <= w[1].timestamp_ns));
        assert_eq!(
            records.iter().map(|r| r.sequence).collect::<Vec<_>>(),
            vec![0, 1, 2, 3, 4]
        );

        assert!(wait_until(|| {
            h.monitor.metrics.foreign_messages.load(Ordering::Relaxed) == 1
        }));
        let stats = h.monitor.snapshot();
        assert_eq!(stats.messages_received, 12);
        assert_eq!(stats.decode_errors, 1);
        assert_eq!(stats.fused_records, 5);
        assert_eq!(stats.state, ConnectionState::Streaming);

        h.stop();
        assert_eq!(h.monitor.connection.state(), ConnectionState::Disconnected);
        assert_eq!(h.pool.in_use(), 0);
    }

    #[test]
    fn test_receiver_reconnects_with_backoff() {
        let connector = Arc::new(MockConnector::new());
        let id = DeviceId::new("left").unwrap();
        let device = connector.device(&id);
        device.refuse_next(2);

        let config = ManagerConfig {
            backoff_initial_ms: 10,
            backoff_max_ms: 40,
            ..Default::default()
        };
        let mut h = Harness::start(connector, &id, config);
        assert!(wait_until(|| device.is_connected()));
        assert!(wait_until(|| h.monitor.connection.state().is_streaming()));

        device.disconnect();
        assert!(wait_until(|| device.connect_count() >= 2));
        assert!(wait_until(|| h.monitor.connection.history().len() >= 9));

        let states: Vec<_> = h.monitor.connection.history().iter().map(|t| t.to).collect();
        use ConnectionState::*;
        assert_eq!(
            states,
            vec![
                Connecting,
                Reconnecting,
                Connecting,
                Reconnecting,
                Connecting,
                Streaming,
                Reconnecting,
                Connecting,
                Streaming
            ]
        );
        assert_eq!(h.monitor.connection.reconnects(), 3);

        h.stop();
    }

    #[test]
    fn test_stop_interrupts_backoff() {
        let connector = Arc::new(MockConnector::new());
        let id = DeviceId::new("left").unwrap();
        connector.device(&id).refuse_next(u32::MAX);

        let config = ManagerConfig {
            backoff_initial_ms: 60_000,
            backoff_max_ms: 60_000,
            ..Default::default()
        };
        let mut h = Harness::start(connector, &id, config);
        assert!(wait_until(|| {
            h.monitor.connection.state() == ConnectionState::Reconnecting
        }));

        let started = Instant::now();
        h.stop();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(h.monitor.connection.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_ring_overflow_drops_newest_and_releases_slot() {
        let connector = Arc::new(MockConnector::new());
        let id = DeviceId::new("left").unwrap();
        let device = connector.device(&id);
        let config = ManagerConfig {
            ring_capacity: 4,
            ..Default::default()
        };
        let mut h = Harness::start(connector, &id, config);

        for i in 0..10 {
            device.send(&message(&id, Channel::Accel, i * 10));
            device.send(&message(&id, Channel::Gyro, i * 10 + 1));
        }
        assert!(wait_until(|| h.monitor.ring().overflow_count() == 6));
        // 只有缓冲区里的 4 个槽被占用
        assert_eq!(h.pool.in_use(), 4);

        let records = h.drain();
        assert_eq!(
            records.iter().map(|r| r.sequence).collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );
        h.stop();
        assert_eq!(h.pool.in_use(), 0);
    }
}
