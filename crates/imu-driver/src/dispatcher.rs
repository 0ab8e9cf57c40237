//! 分发线程
//!
//! 单个线程按 `drain_interval` 周期（或收到 `flush()` 信号时）依次排空每个设备的
//! 环形缓冲区：
//!
//! 1. 按 `max_batch` 批量取出槽引用
//! 2. 把记录移出内存池并立即释放槽（回调不会延迟槽的归还）
//! 3. 更新最新记录、延迟与速率
//! 4. 先写入历史窗口，再按注册顺序调用全部消费者
//!
//! 消费者返回错误或 panic 都被隔离：记录日志、计数，继续分发。
//! 信号通道断开即表示停止，退出前执行最后一次排空。

use crate::clock::HostClock;
use crate::error::DriverError;
use crate::history::HistoryWindow;
use crate::hooks::{ConsumerRegistry, HookManager, SampleConsumer};
use crate::metrics::{DeviceMonitor, DispatchMetrics, RateWindow};
use crate::pool::{MemoryPool, SlotId};
use crate::ring::RingConsumer;
use arc_swap::ArcSwapOption;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use imu_protocol::{DeviceId, SampleRecord};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{error, info, trace, warn};

/// 分发线程控制信号
pub(crate) enum DispatchSignal {
    /// 立即执行一次分发周期，完成后通过 ack 通知
    Flush(Sender<()>),
}

/// 单设备分发通道
pub(crate) struct DispatchLane {
    device_id: DeviceId,
    consumer: RingConsumer<SlotId>,
    monitor: Arc<DeviceMonitor>,
    latest: Arc<ArcSwapOption<SampleRecord>>,
    slots: Vec<SlotId>,
    batch: Vec<SampleRecord>,
    rate: RateWindow,
}

impl DispatchLane {
    pub fn new(
        consumer: RingConsumer<SlotId>,
        monitor: Arc<DeviceMonitor>,
        latest: Arc<ArcSwapOption<SampleRecord>>,
        max_batch: usize,
        rate_window: Duration,
    ) -> Self {
        Self {
            device_id: monitor.device_id.clone(),
            consumer,
            monitor,
            latest,
            slots: Vec::with_capacity(max_batch),
            batch: Vec::with_capacity(max_batch),
            rate: RateWindow::new(rate_window),
        }
    }

    /// 排空本设备的环形缓冲区，返回投递的记录数
    fn drain(&mut self, ctx: &CycleContext<'_>) -> usize {
        // 上限防止生产者持续写入时饿死其他设备
        let max_rounds = self.consumer.ring().capacity() / ctx.max_batch + 1;
        let mut delivered = 0;

        for _ in 0..max_rounds {
            self.slots.clear();
            if self.consumer.try_pop_batch(ctx.max_batch, &mut self.slots) == 0 {
                break;
            }

            self.batch.clear();
            for &slot in &self.slots {
                match ctx.pool.take(slot) {
                    Ok(record) => self.batch.push(record),
                    Err(e) => ctx.internal_error(&self.monitor, e),
                }
                if let Err(e) = ctx.pool.release(slot) {
                    ctx.internal_error(&self.monitor, e);
                }
            }

            if !self.batch.is_empty() {
                delivered += self.batch.len();
                self.deliver(ctx);
            }
        }

        self.monitor
            .metrics
            .set_record_rate(self.rate.rate_hz(Instant::now()));
        delivered
    }

    fn deliver(&mut self, ctx: &CycleContext<'_>) {
        let metrics = &self.monitor.metrics;
        let now_ns = ctx.clock.now_ns();
        for record in &self.batch {
            metrics.record_latency(record.age_ms(now_ns));
            metrics.records_delivered.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(last) = self.batch.last() {
            self.latest.store(Some(Arc::new(last.clone())));
        }
        self.rate.record(Instant::now(), self.batch.len() as u64);

        ctx.invoke(ctx.history, &self.device_id, &self.batch);
        for consumer in ctx.hooks.iter() {
            ctx.invoke(consumer.as_ref(), &self.device_id, &self.batch);
        }
    }
}

/// 一个分发周期内共享的只读上下文
struct CycleContext<'a> {
    pool: &'a MemoryPool,
    history: &'a HistoryWindow,
    hooks: &'a HookManager,
    metrics: &'a DispatchMetrics,
    clock: HostClock,
    max_batch: usize,
    callback_grace: Duration,
}

impl CycleContext<'_> {
    fn invoke(&self, consumer: &dyn SampleConsumer, device_id: &DeviceId, batch: &[SampleRecord]) {
        let started = Instant::now();
        let result = panic::catch_unwind(AssertUnwindSafe(|| consumer.on_batch(device_id, batch)));
        let elapsed = started.elapsed();

        match result {
            Ok(Ok(())) => {},
            Ok(Err(e)) => {
                let n = self.metrics.consumer_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if n == 1 || n % 100 == 0 {
                    warn!(
                        "Consumer {} failed on {} batch ({} failures so far): {}",
                        consumer.name(),
                        device_id,
                        n,
                        e
                    );
                }
            },
            Err(payload) => {
                self.metrics.consumer_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    "Consumer {} panicked on {} batch: {}",
                    consumer.name(),
                    device_id,
                    panic_message(payload.as_ref())
                );
            },
        }

        if elapsed > self.callback_grace {
            let n = self.metrics.slow_callbacks.fetch_add(1, Ordering::Relaxed) + 1;
            if n == 1 || n % 100 == 0 {
                warn!(
                    "Consumer {} took {:?} for {} records (grace {:?}, {} slow so far)",
                    consumer.name(),
                    elapsed,
                    batch.len(),
                    self.callback_grace,
                    n
                );
            }
        }
    }

    fn internal_error(&self, monitor: &DeviceMonitor, e: crate::PoolError) {
        monitor
            .metrics
            .internal_errors
            .fetch_add(1, Ordering::Relaxed);
        error!("Dispatcher {}: memory pool invariant violated: {}", monitor.device_id, e);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic payload>"
    }
}

pub(crate) struct Dispatcher {
    pub lanes: Vec<DispatchLane>,
    pub pool: Arc<MemoryPool>,
    pub registry: Arc<ConsumerRegistry>,
    pub history: Arc<HistoryWindow>,
    pub metrics: Arc<DispatchMetrics>,
    pub clock: HostClock,
    pub max_batch: usize,
    pub drain_interval: Duration,
    pub callback_grace: Duration,
    pub signal_rx: Receiver<DispatchSignal>,
}

impl Dispatcher {
    pub fn spawn(self) -> Result<JoinHandle<()>, DriverError> {
        let name = "imu-dispatch".to_string();
        thread::Builder::new()
            .name(name.clone())
            .spawn(move || self.run())
            .map_err(|source| DriverError::ThreadSpawn { name, source })
    }

    fn run(mut self) {
        info!("Dispatcher started ({} devices)", self.lanes.len());

        loop {
            match self.signal_rx.recv_timeout(self.drain_interval) {
                Ok(DispatchSignal::Flush(ack)) => {
                    self.run_cycle();
                    let _ = ack.send(());
                },
                Err(RecvTimeoutError::Timeout) => {
                    self.run_cycle();
                },
                Err(RecvTimeoutError::Disconnected) => {
                    let n = self.run_cycle();
                    info!("Dispatcher exiting after final drain ({} records)", n);
                    break;
                },
            }
        }
    }

    /// 执行一个分发周期，返回投递的记录数
    pub fn run_cycle(&mut self) -> usize {
        self.metrics.cycles.fetch_add(1, Ordering::Relaxed);
        let hooks = self.registry.snapshot();
        let ctx = CycleContext {
            pool: &self.pool,
            history: &self.history,
            hooks: &hooks,
            metrics: &self.metrics,
            clock: self.clock,
            max_batch: self.max_batch,
            callback_grace: self.callback_grace,
        };

        let delivered: usize = self.lanes.iter_mut().map(|lane| lane.drain(&ctx)).sum();
        if delivered > 0 {
            trace!("Dispatch cycle delivered {} records", delivered);
        }
        delivered
    }
}
