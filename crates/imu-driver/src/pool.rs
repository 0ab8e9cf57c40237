//! 固定容量的记录槽内存池
//!
//! 所有槽在构造时一次性分配，运行期间不再增长。空闲槽索引保存在无锁有界队列中，
//! 每个槽带有原子状态和代数（generation）计数：
//!
//! ```text
//! acquire ──→ CheckedOut ──write──→ (ring) ──take──→ release ──→ Free
//!               generation = g                         generation = g + 1
//! ```
//!
//! `SlotId` 携带获取时的代数，释放后再使用旧引用会被检测为 `UseAfterRelease`，
//! 重复释放返回 `DoubleRelease`，两者都不会影响其他槽。

use crate::error::PoolError;
use crossbeam_queue::ArrayQueue;
use imu_protocol::SampleRecord;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use tracing::error;

const FREE: u8 = 0;
const CHECKED_OUT: u8 = 1;

/// 槽引用
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId {
    index: u32,
    generation: u32,
}

impl SlotId {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

struct Slot {
    state: AtomicU8,
    generation: AtomicU32,
    // 同一时刻只有持有者访问，锁不会发生竞争
    record: Mutex<Option<SampleRecord>>,
}

/// 内存池统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub in_use: usize,
    /// `acquire()` 因无空闲槽失败的次数
    pub exhausted: u64,
}

/// 记录槽内存池
pub struct MemoryPool {
    slots: Box<[Slot]>,
    free: ArrayQueue<u32>,
    exhausted: AtomicU64,
}

impl MemoryPool {
    /// 创建内存池
    ///
    /// # 错误
    /// - `capacity == 0` 或超过 `u32::MAX`
    pub fn new(capacity: usize) -> Result<Self, crate::ConfigError> {
        if capacity == 0 || capacity > u32::MAX as usize {
            return Err(crate::ConfigError::invalid(
                "pool_capacity",
                format!("must be in 1..={}", u32::MAX),
            ));
        }

        let slots: Box<[Slot]> = (0..capacity)
            .map(|_| Slot {
                state: AtomicU8::new(FREE),
                generation: AtomicU32::new(0),
                record: Mutex::new(None),
            })
            .collect();

        let free = ArrayQueue::new(capacity);
        for index in 0..capacity as u32 {
            // 队列容量与槽数相同，不会失败
            let _ = free.push(index);
        }

        Ok(Self {
            slots,
            free,
            exhausted: AtomicU64::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// 当前被持有的槽数
    pub fn in_use(&self) -> usize {
        self.capacity() - self.free.len()
    }

    /// 获取一个空闲槽
    pub fn acquire(&self) -> Result<SlotId, PoolError> {
        let Some(index) = self.free.pop() else {
            self.exhausted.fetch_add(1, Ordering::Relaxed);
            return Err(PoolError::PoolExhausted);
        };

        let slot = &self.slots[index as usize];
        slot.state.store(CHECKED_OUT, Ordering::Release);
        Ok(SlotId {
            index,
            generation: slot.generation.load(Ordering::Acquire),
        })
    }

    fn checked(&self, id: SlotId) -> Result<&Slot, PoolError> {
        let slot = self
            .slots
            .get(id.index as usize)
            .ok_or(PoolError::UseAfterRelease { index: id.index })?;
        if slot.state.load(Ordering::Acquire) != CHECKED_OUT
            || slot.generation.load(Ordering::Acquire) != id.generation
        {
            return Err(PoolError::UseAfterRelease { index: id.index });
        }
        Ok(slot)
    }

    /// 写入记录
    pub fn write(&self, id: SlotId, record: SampleRecord) -> Result<(), PoolError> {
        let slot = self.checked(id)?;
        *slot.record.lock() = Some(record);
        Ok(())
    }

    /// 读取记录副本
    pub fn read(&self, id: SlotId) -> Result<SampleRecord, PoolError> {
        let slot = self.checked(id)?;
        slot.record
            .lock()
            .clone()
            .ok_or(PoolError::EmptySlot { index: id.index })
    }

    /// 取出记录（槽保持 CheckedOut，仍需 `release()`）
    pub fn take(&self, id: SlotId) -> Result<SampleRecord, PoolError> {
        let slot = self.checked(id)?;
        slot.record
            .lock()
            .take()
            .ok_or(PoolError::EmptySlot { index: id.index })
    }

    /// 归还槽
    pub fn release(&self, id: SlotId) -> Result<(), PoolError> {
        let double = PoolError::DoubleRelease { index: id.index };
        let slot = self.slots.get(id.index as usize).ok_or(double)?;

        if slot.generation.load(Ordering::Acquire) != id.generation {
            return Err(double);
        }
        slot.state
            .compare_exchange(CHECKED_OUT, FREE, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| double)?;

        slot.record.lock().take();
        slot.generation.fetch_add(1, Ordering::AcqRel);
        if self.free.push(id.index).is_err() {
            error!("Free list overflow while releasing slot {}", id.index);
        }
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.capacity(),
            in_use: self.in_use(),
            exhausted: self.exhausted.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPool")
            .field("capacity", &self.capacity())
            .field("in_use", &self.in_use())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imu_protocol::{DeviceId, VALID_ACCEL, Vec3};
    use std::sync::Arc;
    use std::thread;

    fn record(ts: u64) -> SampleRecord {
        SampleRecord {
            device_id: DeviceId::new("left").unwrap(),
            timestamp_ns: ts,
            accel: Vec3::new(0.0, 9.8, 0.0),
            gyro: Vec3::ZERO,
            mag: Vec3::ZERO,
            valid_mask: VALID_ACCEL,
            sequence: ts,
        }
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(MemoryPool::new(0).is_err());
    }

    #[test]
    fn test_acquire_write_read_release() {
        let pool = MemoryPool::new(2).unwrap();
        let id = pool.acquire().unwrap();
        pool.write(id, record(7)).unwrap();
        assert_eq!(pool.read(id).unwrap().timestamp_ns, 7);
        assert_eq!(pool.in_use(), 1);

        pool.release(id).unwrap();
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_exhaustion_and_recovery() {
        let pool = MemoryPool::new(2).unwrap();
        let a = pool.acquire().unwrap();
        let _b = pool.acquire().unwrap();
        assert_eq!(pool.acquire(), Err(PoolError::PoolExhausted));
        assert_eq!(pool.stats().exhausted, 1);

        pool.release(a).unwrap();
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn test_double_release_detected() {
        let pool = MemoryPool::new(2).unwrap();
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        pool.release(a).unwrap();
        assert_eq!(
            pool.release(a),
            Err(PoolError::DoubleRelease { index: a.index() })
        );

        // 其他槽不受影响
        pool.write(b, record(1)).unwrap();
        assert_eq!(pool.in_use(), 1);
        pool.release(b).unwrap();
    }

    #[test]
    fn test_stale_reference_after_reuse() {
        let pool = MemoryPool::new(1).unwrap();
        let old = pool.acquire().unwrap();
        pool.release(old).unwrap();

        let new = pool.acquire().unwrap();
        assert_eq!(new.index(), old.index());
        assert_ne!(new.generation(), old.generation());

        assert_eq!(
            pool.write(old, record(1)),
            Err(PoolError::UseAfterRelease { index: old.index() })
        );
        assert!(matches!(pool.release(old), Err(PoolError::DoubleRelease { .. })));
        // 新引用仍然有效
        pool.write(new, record(2)).unwrap();
        assert_eq!(pool.take(new).unwrap().timestamp_ns, 2);
        assert_eq!(
            pool.take(new),
            Err(PoolError::EmptySlot { index: new.index() })
        );
        pool.release(new).unwrap();
    }

    #[test]
    fn test_concurrent_acquire_release() {
        let pool = Arc::new(MemoryPool::new(64).unwrap());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let pool = pool.clone();
                thread::spawn(move || {
                    for i in 0..10_000u64 {
                        if let Ok(id) = pool.acquire() {
                            pool.write(id, record(t * 100_000 + i)).unwrap();
                            assert_eq!(pool.read(id).unwrap().timestamp_ns, t * 100_000 + i);
                            pool.release(id).unwrap();
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pool.in_use(), 0);
    }
}
