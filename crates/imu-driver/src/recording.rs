//! 通道转发消费者
//!
//! 把每个批次拷贝后用 `try_send` 投递到有界 crossbeam 通道，由调用方在自己的
//! 线程中处理（写文件、渲染等）。通道满时丢弃整批并计数，绝不阻塞分发线程。
//!
//! ```rust
//! use imu_driver::recording::ChannelConsumer;
//! use imu_driver::hooks::SampleConsumer;
//! use std::sync::Arc;
//!
//! let (consumer, rx) = ChannelConsumer::new(1024);
//! let dropped = consumer.dropped_records().clone();
//! let consumer: Arc<dyn SampleConsumer> = Arc::new(consumer);
//!
//! std::thread::spawn(move || {
//!     while let Ok(batch) = rx.recv() {
//!         // 处理 batch.records ...
//!         let _ = batch;
//!     }
//! });
//! # let _ = (consumer, dropped);
//! ```

use crate::error::ConsumerError;
use crate::hooks::SampleConsumer;
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use imu_protocol::{DeviceId, SampleRecord};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// 一个设备的一批记录
#[derive(Debug, Clone)]
pub struct RecordBatch {
    pub device_id: DeviceId,
    pub records: Vec<SampleRecord>,
}

/// 转发到有界通道的消费者
pub struct ChannelConsumer {
    tx: Sender<RecordBatch>,
    dropped_records: Arc<AtomicU64>,
    forwarded_records: Arc<AtomicU64>,
}

impl ChannelConsumer {
    /// `capacity` 为通道可缓存的批次数
    #[must_use]
    pub fn new(capacity: usize) -> (Self, Receiver<RecordBatch>) {
        let (tx, rx) = bounded(capacity);
        let consumer = Self {
            tx,
            dropped_records: Arc::new(AtomicU64::new(0)),
            forwarded_records: Arc::new(AtomicU64::new(0)),
        };
        (consumer, rx)
    }

    /// 因通道满被丢弃的记录数（共享计数器）
    #[must_use]
    pub fn dropped_records(&self) -> &Arc<AtomicU64> {
        &self.dropped_records
    }

    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped_records.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn forwarded_count(&self) -> u64 {
        self.forwarded_records.load(Ordering::Relaxed)
    }
}

impl SampleConsumer for ChannelConsumer {
    fn on_batch(&self, device_id: &DeviceId, batch: &[SampleRecord]) -> Result<(), ConsumerError> {
        let message = RecordBatch {
            device_id: device_id.clone(),
            records: batch.to_vec(),
        };
        match self.tx.try_send(message) {
            Ok(()) => {
                self.forwarded_records
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                Ok(())
            },
            Err(TrySendError::Full(_)) => {
                self.dropped_records
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                Ok(())
            },
            Err(TrySendError::Disconnected(_)) => Err(ConsumerError::Disconnected),
        }
    }

    fn name(&self) -> &str {
        "channel"
    }
}
