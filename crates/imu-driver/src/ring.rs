//! 单生产者/单消费者（SPSC）环形缓冲区
//!
//! `RingBuffer::with_capacity` 返回生产者与消费者两半，二者都不可克隆，
//! `try_push` / `try_pop_batch` 需要 `&mut self`，由类型系统保证 SPSC。
//!
//! head / tail 是自由递增的计数器：
//!
//! ```text
//! count = tail - head      空: head == tail      满: count == capacity
//! ```
//!
//! 因此容量为 N 的缓冲区恰好能容纳 N 个元素。
//!
//! # 内存序
//!
//! - 生产者写槽位后以 Release 发布 tail，消费者以 Acquire 读取 tail
//! - 消费者读槽位后以 Release 发布 head，生产者以 Acquire 读取 head

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

struct Shared<T> {
    buffer: Box<[UnsafeCell<MaybeUninit<T>>]>,
    /// 下一个读取位置（消费者拥有）
    head: AtomicUsize,
    /// 下一个写入位置（生产者拥有）
    tail: AtomicUsize,
    overflow: AtomicU64,
    pushed: AtomicU64,
    max_depth: AtomicUsize,
}

// SAFETY: 槽位只会被一个生产者写、一个消费者读，且读写区间由 head/tail 的
// Acquire/Release 同步隔开；T: Send 保证元素可以跨线程移动。
unsafe impl<T: Send> Sync for Shared<T> {}
unsafe impl<T: Send> Send for Shared<T> {}

impl<T> Shared<T> {
    fn capacity(&self) -> usize {
        self.buffer.len()
    }

    fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        tail.wrapping_sub(head).min(self.capacity())
    }
}

/// 只读监视句柄（可克隆，可在任意线程读取）
pub struct RingBuffer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for RingBuffer<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> std::fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("overflow", &self.overflow_count())
            .finish()
    }
}

impl<T: Copy + Send> RingBuffer<T> {
    /// 创建容量为 `capacity` 的环形缓冲区
    ///
    /// # Panics
    ///
    /// `capacity == 0` 时 panic（配置校验会提前拒绝）。
    pub fn with_capacity(capacity: usize) -> (RingProducer<T>, RingConsumer<T>) {
        assert!(capacity > 0, "ring capacity must be > 0");

        let buffer = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();
        let shared = Arc::new(Shared {
            buffer,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            overflow: AtomicU64::new(0),
            pushed: AtomicU64::new(0),
            max_depth: AtomicUsize::new(0),
        });

        (
            RingProducer {
                shared: shared.clone(),
            },
            RingConsumer { shared },
        )
    }
}

impl<T> RingBuffer<T> {
    pub fn len(&self) -> usize {
        self.shared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }

    /// 占用率（百分比）
    pub fn occupancy(&self) -> f64 {
        self.len() as f64 / self.capacity() as f64 * 100.0
    }

    /// 因缓冲区满被拒绝的元素数
    pub fn overflow_count(&self) -> u64 {
        self.shared.overflow.load(Ordering::Relaxed)
    }

    /// 成功写入的元素总数
    pub fn pushed_count(&self) -> u64 {
        self.shared.pushed.load(Ordering::Relaxed)
    }

    /// 观测到的最大深度
    pub fn max_depth(&self) -> usize {
        self.shared.max_depth.load(Ordering::Relaxed)
    }
}

/// 生产者一半
pub struct RingProducer<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Copy + Send> RingProducer<T> {
    /// 非阻塞写入；缓冲区满时返回 `false` 并计入溢出
    pub fn try_push(&mut self, item: T) -> bool {
        let shared = &*self.shared;
        let tail = shared.tail.load(Ordering::Relaxed);
        let head = shared.head.load(Ordering::Acquire);
        let count = tail.wrapping_sub(head);

        if count >= shared.capacity() {
            shared.overflow.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let cell = &shared.buffer[tail % shared.capacity()];
        // SAFETY: [head, tail) 之外的槽位只属于生产者
        unsafe { (*cell.get()).write(item) };
        shared.tail.store(tail.wrapping_add(1), Ordering::Release);

        shared.pushed.fetch_add(1, Ordering::Relaxed);
        shared.max_depth.fetch_max(count + 1, Ordering::Relaxed);
        true
    }

    pub fn ring(&self) -> RingBuffer<T> {
        RingBuffer {
            shared: self.shared.clone(),
        }
    }
}

/// 消费者一半
pub struct RingConsumer<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Copy + Send> RingConsumer<T> {
    /// 非阻塞批量读取，最多 `max_items` 个，追加到 `out`
    ///
    /// 返回读取的数量（0 表示为空）。
    pub fn try_pop_batch(&mut self, max_items: usize, out: &mut Vec<T>) -> usize {
        let shared = &*self.shared;
        let head = shared.head.load(Ordering::Relaxed);
        let tail = shared.tail.load(Ordering::Acquire);
        let n = tail.wrapping_sub(head).min(max_items);

        out.reserve(n);
        for i in 0..n {
            let cell = &shared.buffer[head.wrapping_add(i) % shared.capacity()];
            // SAFETY: [head, tail) 内的槽位已由生产者初始化并发布
            out.push(unsafe { (*cell.get()).assume_init_read() });
        }
        if n > 0 {
            shared.head.store(head.wrapping_add(n), Ordering::Release);
        }
        n
    }

    pub fn try_pop(&mut self) -> Option<T> {
        let shared = &*self.shared;
        let head = shared.head.load(Ordering::Relaxed);
        let tail = shared.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let cell = &shared.buffer[head % shared.capacity()];
        // SAFETY: 同上
        let item = unsafe { (*cell.get()).assume_init_read() };
        shared.head.store(head.wrapping_add(1), Ordering::Release);
        Some(item)
    }

    pub fn ring(&self) -> RingBuffer<T> {
        RingBuffer {
            shared: self.shared.clone(),
        }
    }
}
