//! 管理器门面
//!
//! `ImuManager` 是对外的控制面接口，`StreamManager` 是其生产实现：
//!
//! - `start()` 校验配置后为每个设备创建环形缓冲区、同步器和接收线程，
//!   并创建共享内存池与分发线程
//! - `stop()` 通知接收线程、关闭连接、等待线程退出、执行最后一次分发，
//!   返回最终统计快照
//!
//! 读操作（`get_latest` / `get_stats` / `export_window`）通过 `ArcSwapOption`
//! 读取当前会话视图，不与控制面竞争锁。

use crate::clock::HostClock;
use crate::config::ManagerConfig;
use crate::dispatcher::{DispatchLane, DispatchSignal, Dispatcher};
use crate::error::{ConfigError, DriverError};
use crate::history::HistoryWindow;
use crate::hooks::{ConsumerId, ConsumerRegistry, SampleConsumer};
use crate::metrics::{DeviceMonitor, DispatchMetrics, ManagerStats, PerformanceMonitor};
use crate::mode::ConnectionState;
use crate::pool::MemoryPool;
use crate::receiver::DeviceReceiver;
use crate::ring::RingBuffer;
use arc_swap::ArcSwapOption;
use crossbeam_channel::{RecvTimeoutError, Sender, bounded, unbounded};
use imu_protocol::{DeviceId, ExportRow, SampleRecord};
use imu_transport::{ConnectionCloser, Connector, DeviceEndpoint, NetConnector};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{JoinHandle, spawn};
use std::time::Duration;
use tracing::{error, info};

/// 等待工作线程退出的上限
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// 等待 `flush()` 完成的上限
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// 带超时的 join
trait JoinTimeout {
    fn join_timeout(self, timeout: Duration) -> std::thread::Result<()>;
}

impl<T: Send + 'static> JoinTimeout for JoinHandle<T> {
    fn join_timeout(self, timeout: Duration) -> std::thread::Result<()> {
        use std::sync::mpsc;

        let (tx, rx) = mpsc::channel();

        // 看门狗线程负责 join，超时后它继续存活直到目标线程结束
        spawn(move || {
            let result = self.join();
            let _ = tx.send(result);
        });

        match rx.recv_timeout(timeout) {
            Ok(join_result) => join_result.map(|_| ()),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(Box::new(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "Thread join timeout",
            ))),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(Box::new(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "Thread panicked during join",
            ))),
        }
    }
}

/// 多设备 IMU 流管理器
pub trait ImuManager: Send + Sync {
    /// 启动所有设备的接收与分发；配置错误同步返回
    fn start(&self, endpoints: Vec<DeviceEndpoint>) -> Result<(), DriverError>;

    /// 停止并返回最终统计
    fn stop(&self) -> Result<ManagerStats, DriverError>;

    fn is_running(&self) -> bool;

    /// 注册消费者（运行前后均可）
    fn add_consumer(&self, consumer: Arc<dyn SampleConsumer>) -> ConsumerId;

    fn remove_consumer(&self, id: ConsumerId) -> bool;

    /// 设备最近一条已分发的记录
    fn get_latest(&self, device_id: &str) -> Option<SampleRecord>;

    /// 当前统计快照（未运行时为空）
    fn get_stats(&self) -> ManagerStats;

    /// 历史窗口中最近 `max_rows` 条记录
    fn export_window(&self, device_id: &str, max_rows: usize) -> Vec<ExportRow>;

    /// 立即执行一次分发周期并等待完成
    fn flush(&self) -> Result<(), DriverError>;

    fn connection_state(&self, device_id: &str) -> Option<ConnectionState>;
}

/// 运行中会话的只读视图
struct SessionView {
    monitor: PerformanceMonitor,
    latest: HashMap<DeviceId, Arc<ArcSwapOption<SampleRecord>>>,
    history: Arc<HistoryWindow>,
}

/// 运行中会话的控制句柄
struct SessionControl {
    is_running: Arc<AtomicBool>,
    /// 丢弃即通知接收线程停止退避等待
    stop_tx: Option<Sender<()>>,
    closers: Vec<Arc<Mutex<ConnectionCloser>>>,
    receivers: Vec<(DeviceId, JoinHandle<()>)>,
    /// 丢弃即通知分发线程最后排空并退出
    signal_tx: Option<Sender<DispatchSignal>>,
    dispatcher: Option<JoinHandle<()>>,
}

impl SessionControl {
    fn shutdown(&mut self) {
        // Release: 接收线程看到 false 时也能看到之前的所有写入
        self.is_running.store(false, Ordering::Release);
        self.stop_tx.take();
        for closer in &self.closers {
            closer.lock().close();
        }

        for (device_id, handle) in self.receivers.drain(..) {
            if handle.join_timeout(JOIN_TIMEOUT).is_err() {
                error!(
                    "Receiver {} panicked or failed to shut down within {:?}",
                    device_id, JOIN_TIMEOUT
                );
            }
        }

        // 接收线程全部退出后再停止分发，保证最后一次排空覆盖所有记录
        self.signal_tx.take();
        if let Some(handle) = self.dispatcher.take()
            && handle.join_timeout(JOIN_TIMEOUT).is_err()
        {
            error!(
                "Dispatcher panicked or failed to shut down within {:?}",
                JOIN_TIMEOUT
            );
        }
    }
}

/// `ImuManager` 的生产实现
pub struct StreamManager<C = NetConnector> {
    config: ManagerConfig,
    connector: Arc<C>,
    registry: Arc<ConsumerRegistry>,
    control: Mutex<Option<SessionControl>>,
    session: ArcSwapOption<SessionView>,
}

impl StreamManager<NetConnector> {
    /// 使用网络连接器创建
    pub fn new(config: ManagerConfig) -> Result<Self, ConfigError> {
        Self::with_connector(config, NetConnector)
    }
}

impl<C: Connector> StreamManager<C> {
    pub fn with_connector(config: ManagerConfig, connector: C) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            connector: Arc::new(connector),
            registry: Arc::new(ConsumerRegistry::new()),
            control: Mutex::new(None),
            session: ArcSwapOption::empty(),
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    fn view(&self) -> Option<Arc<SessionView>> {
        self.session.load_full()
    }

    fn validate_endpoints(endpoints: &[DeviceEndpoint]) -> Result<(), ConfigError> {
        if endpoints.is_empty() {
            return Err(ConfigError::NoEndpoints);
        }
        let mut seen = HashSet::with_capacity(endpoints.len());
        for endpoint in endpoints {
            if !seen.insert(&endpoint.device_id) {
                return Err(ConfigError::DuplicateDevice(endpoint.device_id.clone()));
            }
        }
        Ok(())
    }
}

impl<C: Connector> ImuManager for StreamManager<C> {
    fn start(&self, endpoints: Vec<DeviceEndpoint>) -> Result<(), DriverError> {
        let mut control = self.control.lock();
        if control.is_some() {
            return Err(DriverError::AlreadyRunning);
        }

        let config = &self.config;
        config.validate()?;
        Self::validate_endpoints(&endpoints)?;
        let pool = Arc::new(MemoryPool::new(config.pool_capacity(endpoints.len())?)?);

        let clock = HostClock::new();
        let is_running = Arc::new(AtomicBool::new(true));
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let (signal_tx, signal_rx) = unbounded();
        let history = Arc::new(HistoryWindow::new(
            endpoints.iter().map(|e| &e.device_id),
            config.history_capacity,
        ));
        let dispatch_metrics = Arc::new(DispatchMetrics::default());

        let mut lanes = Vec::with_capacity(endpoints.len());
        let mut receivers = Vec::with_capacity(endpoints.len());
        let mut monitors = Vec::with_capacity(endpoints.len());
        let mut latest = HashMap::with_capacity(endpoints.len());
        let mut closers = Vec::with_capacity(endpoints.len());

        for endpoint in endpoints {
            let device_id = endpoint.device_id.clone();
            let (producer, consumer) = RingBuffer::with_capacity(config.ring_capacity);
            let monitor = Arc::new(DeviceMonitor::new(
                device_id.clone(),
                producer.ring(),
                config.transition_history,
            ));
            let latest_slot = Arc::new(ArcSwapOption::empty());
            let closer = Arc::new(Mutex::new(ConnectionCloser::noop()));

            lanes.push(DispatchLane::new(
                consumer,
                monitor.clone(),
                latest_slot.clone(),
                config.max_batch,
                config.rate_window(),
            ));
            receivers.push(DeviceReceiver {
                endpoint,
                connector: self.connector.clone(),
                config: config.clone(),
                pool: pool.clone(),
                producer,
                monitor: monitor.clone(),
                clock,
                is_running: is_running.clone(),
                stop_rx: stop_rx.clone(),
                closer: closer.clone(),
            });
            monitors.push(monitor);
            latest.insert(device_id, latest_slot);
            closers.push(closer);
        }
        drop(stop_rx);

        let dispatcher = Dispatcher {
            lanes,
            pool: pool.clone(),
            registry: self.registry.clone(),
            history: history.clone(),
            metrics: dispatch_metrics.clone(),
            clock,
            max_batch: config.max_batch,
            drain_interval: config.drain_interval(),
            callback_grace: config.callback_grace(),
            signal_rx,
        }
        .spawn()?;

        let mut session = SessionControl {
            is_running,
            stop_tx: Some(stop_tx),
            closers,
            receivers: Vec::with_capacity(receivers.len()),
            signal_tx: Some(signal_tx),
            dispatcher: Some(dispatcher),
        };

        let device_count = receivers.len();
        for receiver in receivers {
            let device_id = receiver.endpoint.device_id.clone();
            match receiver.spawn() {
                Ok(handle) => session.receivers.push((device_id, handle)),
                Err(e) => {
                    error!("Failed to start receiver {}: {}", device_id, e);
                    session.shutdown();
                    return Err(e);
                },
            }
        }

        self.session.store(Some(Arc::new(SessionView {
            monitor: PerformanceMonitor::new(monitors, dispatch_metrics, pool),
            latest,
            history,
        })));
        *control = Some(session);

        info!("Streaming started for {} devices", device_count);
        Ok(())
    }

    fn stop(&self) -> Result<ManagerStats, DriverError> {
        let mut control = self.control.lock();
        let Some(mut session) = control.take() else {
            return Err(DriverError::NotRunning);
        };

        session.shutdown();
        let stats = self
            .session
            .swap(None)
            .map(|view| view.monitor.snapshot())
            .unwrap_or_default();

        info!(
            "Streaming stopped: {} records delivered, {} dropped by overflow",
            stats.totals.records_delivered, stats.totals.overflow_count
        );
        Ok(stats)
    }

    fn is_running(&self) -> bool {
        self.control.lock().is_some()
    }

    fn add_consumer(&self, consumer: Arc<dyn SampleConsumer>) -> ConsumerId {
        self.registry.add(consumer)
    }

    fn remove_consumer(&self, id: ConsumerId) -> bool {
        self.registry.remove(id)
    }

    fn get_latest(&self, device_id: &str) -> Option<SampleRecord> {
        let view = self.view()?;
        let record = view.latest.get(device_id)?.load_full()?;
        Some(SampleRecord::clone(&record))
    }

    fn get_stats(&self) -> ManagerStats {
        self.view()
            .map(|view| view.monitor.snapshot())
            .unwrap_or_default()
    }

    fn export_window(&self, device_id: &str, max_rows: usize) -> Vec<ExportRow> {
        self.view()
            .map(|view| view.history.export(device_id, max_rows))
            .unwrap_or_default()
    }

    fn flush(&self) -> Result<(), DriverError> {
        let signal_tx = self
            .control
            .lock()
            .as_ref()
            .and_then(|s| s.signal_tx.clone())
            .ok_or(DriverError::NotRunning)?;

        let (ack_tx, ack_rx) = bounded(1);
        signal_tx
            .send(DispatchSignal::Flush(ack_tx))
            .map_err(|_| DriverError::NotRunning)?;
        match ack_rx.recv_timeout(FLUSH_TIMEOUT) {
            Ok(()) => Ok(()),
            Err(RecvTimeoutError::Timeout) => Err(DriverError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(DriverError::NotRunning),
        }
    }

    fn connection_state(&self, device_id: &str) -> Option<ConnectionState> {
        let view = self.view()?;
        view.monitor
            .device(device_id)
            .map(|d| d.connection.state())
    }
}

impl<C> Drop for StreamManager<C> {
    fn drop(&mut self) {
        if let Some(mut session) = self.control.get_mut().take() {
            session.shutdown();
        }
    }
}
