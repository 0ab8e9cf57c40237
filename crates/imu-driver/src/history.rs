//! 最近记录窗口
//!
//! 内置消费者：每个设备保留最近 `capacity` 条记录，供 `export_window()` 导出。
//! 设备集合在 `start()` 时确定。
//!
//! 每个设备的窗口是一份 `ArcSwap` 快照：分发线程（唯一写者）每批生成新快照并发布，
//! 控制面读取只做一次无锁 `load`，不会阻塞分发。快照由若干不可变记录块组成，
//! 发布时只复制块指针和末尾的小块。

use crate::error::ConsumerError;
use crate::hooks::SampleConsumer;
use arc_swap::ArcSwap;
use imu_protocol::{DeviceId, ExportRow, SampleRecord};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// 小于该长度的末尾块会与下一批合并
const CHUNK_TARGET: usize = 64;

/// 不可变的窗口快照
#[derive(Debug, Clone, Default)]
struct Chunks {
    chunks: VecDeque<Arc<[SampleRecord]>>,
    /// 所有块的记录总数
    total: usize,
    /// 首块中已淘汰的记录数
    skip: usize,
}

impl Chunks {
    fn len(&self) -> usize {
        self.total - self.skip
    }

    fn iter(&self) -> impl Iterator<Item = &SampleRecord> {
        self.chunks.iter().flat_map(|c| c.iter()).skip(self.skip)
    }

    fn latest(&self) -> Option<&SampleRecord> {
        self.chunks.back().and_then(|c| c.last())
    }

    /// 追加一批并淘汰超出 `capacity` 的旧记录，返回新快照
    fn appended(&self, batch: &[SampleRecord], capacity: usize) -> Self {
        let keep = &batch[batch.len().saturating_sub(capacity)..];
        let mut next = self.clone();

        let mut merged = Vec::with_capacity(keep.len() + CHUNK_TARGET);
        if next.chunks.back().is_some_and(|last| last.len() < CHUNK_TARGET)
            && let Some(last) = next.chunks.pop_back()
        {
            next.total -= last.len();
            let start = if next.chunks.is_empty() {
                std::mem::take(&mut next.skip)
            } else {
                0
            };
            merged.extend_from_slice(&last[start..]);
        }
        merged.extend_from_slice(keep);
        next.total += merged.len();
        next.chunks.push_back(Arc::from(merged));

        while next.len() > capacity {
            let excess = next.len() - capacity;
            let Some(front) = next.chunks.front() else {
                break;
            };
            let front_visible = front.len() - next.skip;
            if excess >= front_visible {
                next.total -= front.len();
                next.skip = 0;
                next.chunks.pop_front();
            } else {
                next.skip += excess;
            }
        }
        next
    }
}

pub struct HistoryWindow {
    capacity: usize,
    devices: HashMap<DeviceId, ArcSwap<Chunks>>,
}

impl HistoryWindow {
    pub fn new<'a>(devices: impl IntoIterator<Item = &'a DeviceId>, capacity: usize) -> Self {
        let devices = devices
            .into_iter()
            .map(|id| (id.clone(), ArcSwap::from_pointee(Chunks::default())))
            .collect();
        Self { capacity, devices }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self, device_id: &str) -> usize {
        self.devices.get(device_id).map_or(0, |h| h.load().len())
    }

    /// 最近 `max_rows` 条记录（按时间从旧到新）
    pub fn export(&self, device_id: &str, max_rows: usize) -> Vec<ExportRow> {
        let Some(history) = self.devices.get(device_id) else {
            return Vec::new();
        };
        let snapshot = history.load();
        let skip = snapshot.len().saturating_sub(max_rows);
        snapshot.iter().skip(skip).map(ExportRow::from).collect()
    }

    /// 最新记录
    pub fn latest(&self, device_id: &str) -> Option<SampleRecord> {
        self.devices.get(device_id)?.load().latest().cloned()
    }
}

impl SampleConsumer for HistoryWindow {
    /// 只能由分发线程调用（单写者）
    fn on_batch(&self, device_id: &DeviceId, batch: &[SampleRecord]) -> Result<(), ConsumerError> {
        if self.capacity == 0 || batch.is_empty() {
            return Ok(());
        }
        let Some(history) = self.devices.get(device_id) else {
            return Err(ConsumerError::other(format!("unknown device {device_id}")));
        };

        let next = history.load().appended(batch, self.capacity);
        history.store(Arc::new(next));
        Ok(())
    }

    fn name(&self) -> &str {
        "history"
    }
}
