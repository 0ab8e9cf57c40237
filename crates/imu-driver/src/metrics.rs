//! 性能监控
//!
//! 热路径上的计数全部是原子操作（`Relaxed`），任何线程都可以随时读取快照，
//! 不会阻塞接收线程或分发线程。
//!
//! 写入方：
//! - 接收线程：消息/字节/解码错误/融合统计/池耗尽，消息速率
//! - 分发线程：延迟、投递数、记录速率
//! - 环形缓冲区自身：溢出计数、占用率

use crate::mode::{ConnectionState, ConnectionTracker, StateTransition};
use crate::pool::{MemoryPool, PoolStats, SlotId};
use crate::ring::RingBuffer;
use crate::sync::SyncStats;
use imu_protocol::DeviceId;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// EWMA 平滑系数
const LATENCY_EWMA_ALPHA: f64 = 0.1;

/// 以 bit 形式存储在 `AtomicU64` 中的 f64
#[derive(Debug, Default)]
pub struct AtomicF64(AtomicU64);

impl AtomicF64 {
    pub fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

/// 单设备计数器
#[derive(Debug, Default)]
pub struct DeviceMetrics {
    /// 收到的消息数（含解码失败的）
    pub messages_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub decode_errors: AtomicU64,
    /// device_id 与端点配置不符的消息
    pub foreign_messages: AtomicU64,
    pub fused_records: AtomicU64,
    pub degraded_records: AtomicU64,
    pub out_of_order_drops: AtomicU64,
    pub pool_exhausted: AtomicU64,
    /// 已交给消费者的记录数
    pub records_delivered: AtomicU64,
    /// 内存池不变量被破坏的次数（不应发生）
    pub internal_errors: AtomicU64,

    latency_last_ms: AtomicF64,
    latency_max_ms: AtomicF64,
    latency_ewma_ms: AtomicF64,
    message_rate_hz: AtomicF64,
    record_rate_hz: AtomicF64,
}

impl DeviceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一条端到端延迟（只由分发线程调用）
    pub fn record_latency(&self, latency_ms: f64) {
        self.latency_last_ms.store(latency_ms);
        if latency_ms > self.latency_max_ms.load() {
            self.latency_max_ms.store(latency_ms);
        }

        let ewma = if self.records_delivered.load(Ordering::Relaxed) == 0 {
            latency_ms
        } else {
            let prev = self.latency_ewma_ms.load();
            prev + LATENCY_EWMA_ALPHA * (latency_ms - prev)
        };
        self.latency_ewma_ms.store(ewma);
    }

    /// 同步器统计是累计值，直接覆盖
    pub fn store_sync_stats(&self, stats: SyncStats) {
        self.fused_records.store(stats.fused, Ordering::Relaxed);
        self.degraded_records.store(stats.degraded, Ordering::Relaxed);
        self.out_of_order_drops
            .store(stats.out_of_order_drops, Ordering::Relaxed);
    }

    pub fn set_message_rate(&self, hz: f64) {
        self.message_rate_hz.store(hz);
    }

    pub fn set_record_rate(&self, hz: f64) {
        self.record_rate_hz.store(hz);
    }

    pub fn latency_last_ms(&self) -> f64 {
        self.latency_last_ms.load()
    }

    pub fn latency_max_ms(&self) -> f64 {
        self.latency_max_ms.load()
    }

    pub fn latency_ewma_ms(&self) -> f64 {
        self.latency_ewma_ms.load()
    }

    pub fn message_rate_hz(&self) -> f64 {
        self.message_rate_hz.load()
    }

    pub fn record_rate_hz(&self) -> f64 {
        self.record_rate_hz.load()
    }
}

/// 滑动窗口速率计（单线程持有）
#[derive(Debug)]
pub struct RateWindow {
    window: Duration,
    events: VecDeque<(Instant, u64)>,
    in_window: u64,
}

impl RateWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            events: VecDeque::new(),
            in_window: 0,
        }
    }

    pub fn record(&mut self, now: Instant, count: u64) {
        if count == 0 {
            return;
        }
        self.events.push_back((now, count));
        self.in_window += count;
        self.prune(now);
    }

    /// 窗口内事件数 / 窗口长度
    pub fn rate_hz(&mut self, now: Instant) -> f64 {
        self.prune(now);
        let secs = self.window.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.in_window as f64 / secs
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&(at, count)) = self.events.front() {
            if now.saturating_duration_since(at) <= self.window {
                break;
            }
            self.events.pop_front();
            self.in_window -= count;
        }
    }
}

/// 单设备监视器：计数器 + 连接状态 + 环形缓冲区句柄
#[derive(Debug)]
pub struct DeviceMonitor {
    pub device_id: DeviceId,
    pub metrics: DeviceMetrics,
    pub connection: ConnectionTracker,
    ring: RingBuffer<SlotId>,
}

impl DeviceMonitor {
    pub fn new(device_id: DeviceId, ring: RingBuffer<SlotId>, transition_history: usize) -> Self {
        Self {
            device_id,
            metrics: DeviceMetrics::new(),
            connection: ConnectionTracker::new(transition_history),
            ring,
        }
    }

    pub fn ring(&self) -> &RingBuffer<SlotId> {
        &self.ring
    }

    pub fn snapshot(&self) -> DeviceStats {
        let m = &self.metrics;
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        DeviceStats {
            device_id: self.device_id.clone(),
            state: self.connection.state(),
            messages_received: load(&m.messages_received),
            bytes_received: load(&m.bytes_received),
            decode_errors: load(&m.decode_errors),
            foreign_messages: load(&m.foreign_messages),
            fused_records: load(&m.fused_records),
            degraded_records: load(&m.degraded_records),
            out_of_order_drops: load(&m.out_of_order_drops),
            overflow_count: self.ring.overflow_count(),
            pool_exhausted: load(&m.pool_exhausted),
            records_delivered: load(&m.records_delivered),
            internal_errors: load(&m.internal_errors),
            reconnects: self.connection.reconnects(),
            message_rate_hz: m.message_rate_hz(),
            record_rate_hz: m.record_rate_hz(),
            latency_last_ms: m.latency_last_ms(),
            latency_max_ms: m.latency_max_ms(),
            latency_ewma_ms: m.latency_ewma_ms(),
            buffer_len: self.ring.len(),
            buffer_capacity: self.ring.capacity(),
            buffer_occupancy_pct: self.ring.occupancy(),
            buffer_max_depth: self.ring.max_depth(),
            transitions: self.connection.history(),
        }
    }
}

/// 单设备统计快照
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceStats {
    pub device_id: DeviceId,
    pub state: ConnectionState,
    pub messages_received: u64,
    pub bytes_received: u64,
    pub decode_errors: u64,
    pub foreign_messages: u64,
    pub fused_records: u64,
    pub degraded_records: u64,
    pub out_of_order_drops: u64,
    /// 环形缓冲区满被丢弃的记录
    pub overflow_count: u64,
    pub pool_exhausted: u64,
    pub records_delivered: u64,
    pub internal_errors: u64,
    pub reconnects: u64,
    pub message_rate_hz: f64,
    pub record_rate_hz: f64,
    pub latency_last_ms: f64,
    pub latency_max_ms: f64,
    pub latency_ewma_ms: f64,
    pub buffer_len: usize,
    pub buffer_capacity: usize,
    pub buffer_occupancy_pct: f64,
    pub buffer_max_depth: usize,
    pub transitions: Vec<StateTransition>,
}

impl DeviceStats {
    /// 所有丢弃（溢出 + 池耗尽 + 乱序）
    pub fn dropped_records(&self) -> u64 {
        self.overflow_count + self.pool_exhausted + self.out_of_order_drops
    }
}

/// 分发线程计数器
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    pub consumer_failures: AtomicU64,
    pub slow_callbacks: AtomicU64,
    pub cycles: AtomicU64,
}

/// 全部设备的汇总
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TotalStats {
    pub messages_received: u64,
    pub decode_errors: u64,
    pub fused_records: u64,
    pub degraded_records: u64,
    pub out_of_order_drops: u64,
    pub overflow_count: u64,
    pub pool_exhausted: u64,
    pub records_delivered: u64,
    pub message_rate_hz: f64,
    pub latency_max_ms: f64,
    /// 各设备 EWMA 的平均值
    pub latency_ewma_ms: f64,
}

/// 管理器统计快照
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ManagerStats {
    pub devices: Vec<DeviceStats>,
    pub totals: TotalStats,
    pub pool: PoolStats,
    pub consumer_failures: u64,
    pub slow_callbacks: u64,
    pub dispatch_cycles: u64,
    pub uptime_ms: u64,
}

impl ManagerStats {
    pub fn device(&self, device_id: &str) -> Option<&DeviceStats> {
        self.devices.iter().find(|d| d.device_id == device_id)
    }
}

/// 性能监视器（随 `start()` 创建，`stop()` 时输出最终快照后丢弃）
#[derive(Debug)]
pub struct PerformanceMonitor {
    devices: Vec<Arc<DeviceMonitor>>,
    dispatch: Arc<DispatchMetrics>,
    pool: Arc<MemoryPool>,
    started: Instant,
}

impl PerformanceMonitor {
    pub fn new(
        devices: Vec<Arc<DeviceMonitor>>,
        dispatch: Arc<DispatchMetrics>,
        pool: Arc<MemoryPool>,
    ) -> Self {
        Self {
            devices,
            dispatch,
            pool,
            started: Instant::now(),
        }
    }

    pub fn device(&self, device_id: &str) -> Option<&Arc<DeviceMonitor>> {
        self.devices.iter().find(|d| d.device_id == device_id)
    }

    pub fn devices(&self) -> &[Arc<DeviceMonitor>] {
        &self.devices
    }

    pub fn snapshot(&self) -> ManagerStats {
        let devices: Vec<DeviceStats> = self.devices.iter().map(|d| d.snapshot()).collect();

        let mut totals = TotalStats::default();
        for d in &devices {
            totals.messages_received += d.messages_received;
            totals.decode_errors += d.decode_errors;
            totals.fused_records += d.fused_records;
            totals.degraded_records += d.degraded_records;
            totals.out_of_order_drops += d.out_of_order_drops;
            totals.overflow_count += d.overflow_count;
            totals.pool_exhausted += d.pool_exhausted;
            totals.records_delivered += d.records_delivered;
            totals.message_rate_hz += d.message_rate_hz;
            totals.latency_max_ms = totals.latency_max_ms.max(d.latency_max_ms);
            totals.latency_ewma_ms += d.latency_ewma_ms;
        }
        if !devices.is_empty() {
            totals.latency_ewma_ms /= devices.len() as f64;
        }

        ManagerStats {
            devices,
            totals,
            pool: self.pool.stats(),
            consumer_failures: self.dispatch.consumer_failures.load(Ordering::Relaxed),
            slow_callbacks: self.dispatch.slow_callbacks.load(Ordering::Relaxed),
            dispatch_cycles: self.dispatch.cycles.load(Ordering::Relaxed),
            uptime_ms: self.started.elapsed().as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(id: &str, capacity: usize) -> (Arc<DeviceMonitor>, crate::ring::RingProducer<SlotId>) {
        let (tx, _rx) = RingBuffer::<SlotId>::with_capacity(capacity);
        let ring = tx.ring();
        (
            Arc::new(DeviceMonitor::new(DeviceId::new(id).unwrap(), ring, 4)),
            tx,
        )
    }

    #[test]
    fn test_latency_tracking() {
        let m = DeviceMetrics::new();
        m.record_latency(4.0);
        m.records_delivered.fetch_add(1, Ordering::Relaxed);
        m.record_latency(14.0);
        m.records_delivered.fetch_add(1, Ordering::Relaxed);
        m.record_latency(2.0);

        assert_eq!(m.latency_last_ms(), 2.0);
        assert_eq!(m.latency_max_ms(), 14.0);
        // 4.0 → 5.0 → 4.7
        assert!((m.latency_ewma_ms() - 4.7).abs() < 1e-9);
    }

    #[test]
    fn test_rate_window() {
        let start = Instant::now();
        let mut rate = RateWindow::new(Duration::from_secs(1));
        for i in 0..100u64 {
            rate.record(start + Duration::from_millis(i * 10), 1);
        }
        let hz = rate.rate_hz(start + Duration::from_millis(999));
        assert!((hz - 100.0).abs() < 1e-9);

        // 窗口滑过后旧事件被清除
        let hz = rate.rate_hz(start + Duration::from_millis(1_500));
        assert!(hz < 60.0);
        assert_eq!(rate.rate_hz(start + Duration::from_secs(5)), 0.0);
    }

    #[test]
    fn test_device_snapshot_reads_ring() {
        let (monitor, mut tx) = monitor("left", 2);
        let slot = crate::pool::MemoryPool::new(1).unwrap().acquire().unwrap();
        assert!(tx.try_push(slot));
        assert!(tx.try_push(slot));
        assert!(!tx.try_push(slot));

        monitor.metrics.messages_received.fetch_add(3, Ordering::Relaxed);
        monitor
            .connection
            .transition(ConnectionState::Streaming, 10);

        let stats = monitor.snapshot();
        assert_eq!(stats.device_id, "left");
        assert_eq!(stats.state, ConnectionState::Streaming);
        assert_eq!(stats.messages_received, 3);
        assert_eq!(stats.overflow_count, 1);
        assert_eq!(stats.buffer_len, 2);
        assert_eq!(stats.buffer_occupancy_pct, 100.0);
        assert_eq!(stats.transitions.len(), 1);
        assert_eq!(stats.dropped_records(), 1);
    }

    #[test]
    fn test_manager_snapshot_aggregates() {
        let (left, _tx1) = monitor("left", 4);
        let (right, _tx2) = monitor("right", 4);
        left.metrics.messages_received.fetch_add(10, Ordering::Relaxed);
        right.metrics.messages_received.fetch_add(5, Ordering::Relaxed);
        left.metrics.record_latency(8.0);
        right.metrics.record_latency(2.0);

        let dispatch = Arc::new(DispatchMetrics::default());
        dispatch.consumer_failures.fetch_add(2, Ordering::Relaxed);
        let pool = Arc::new(MemoryPool::new(16).unwrap());

        let monitor = PerformanceMonitor::new(vec![left, right], dispatch, pool);
        let stats = monitor.snapshot();

        assert_eq!(stats.devices.len(), 2);
        assert_eq!(stats.totals.messages_received, 15);
        assert_eq!(stats.totals.latency_max_ms, 8.0);
        assert!((stats.totals.latency_ewma_ms - 5.0).abs() < 1e-9);
        assert_eq!(stats.consumer_failures, 2);
        assert_eq!(stats.pool.capacity, 16);
        assert!(stats.device("right").is_some());
        assert!(stats.device("missing").is_none());
        assert!(monitor.device("left").is_some());
    }
}
