//! 设备连接状态
//!
//! 接收线程写入状态，控制面与监视器只读。状态以原子 u8 存储，读取不加锁；
//! 状态变迁另外记录在有界历史中用于诊断。

use num_enum::{IntoPrimitive, TryFromPrimitive};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use tracing::debug;

/// 连接状态
///
/// ```text
/// Disconnected → Connecting → Streaming → (Disconnected | Reconnecting)
///                    ↑                              │
///                    └──────────── backoff ─────────┘
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, TryFromPrimitive, IntoPrimitive,
)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ConnectionState {
    #[default]
    Disconnected = 0,
    Connecting = 1,
    Streaming = 2,
    /// 连接失败或断开，正在退避等待
    Reconnecting = 3,
}

impl ConnectionState {
    /// 从 u8 转换（无效值视为 Disconnected）
    pub fn from_u8(value: u8) -> Self {
        Self::try_from(value).unwrap_or_default()
    }

    pub fn is_streaming(self) -> bool {
        self == Self::Streaming
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Streaming => "streaming",
            Self::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// 连接状态（原子版本）
#[derive(Debug, Default)]
pub struct AtomicConnectionState {
    inner: AtomicU8,
}

impl AtomicConnectionState {
    pub fn new(state: ConnectionState) -> Self {
        Self {
            inner: AtomicU8::new(state.into()),
        }
    }

    pub fn get(&self, ordering: Ordering) -> ConnectionState {
        ConnectionState::from_u8(self.inner.load(ordering))
    }

    /// 设置状态，返回旧状态
    pub fn swap(&self, state: ConnectionState, ordering: Ordering) -> ConnectionState {
        ConnectionState::from_u8(self.inner.swap(state.into(), ordering))
    }
}

/// 一次状态变迁
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StateTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    /// 主机时间（纳秒）
    pub at_ns: u64,
}

/// 连接状态跟踪器
#[derive(Debug)]
pub struct ConnectionTracker {
    state: AtomicConnectionState,
    history: Mutex<VecDeque<StateTransition>>,
    history_capacity: usize,
    reconnects: AtomicU64,
}

impl ConnectionTracker {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            state: AtomicConnectionState::default(),
            history: Mutex::new(VecDeque::with_capacity(history_capacity)),
            history_capacity,
            reconnects: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get(Ordering::Acquire)
    }

    /// 切换状态；与当前状态相同时不记录
    pub fn transition(&self, to: ConnectionState, now_ns: u64) {
        let from = self.state.swap(to, Ordering::AcqRel);
        if from == to {
            return;
        }
        if to == ConnectionState::Reconnecting {
            self.reconnects.fetch_add(1, Ordering::Relaxed);
        }
        debug!("Connection state {} -> {}", from, to);

        if self.history_capacity == 0 {
            return;
        }
        let mut history = self.history.lock();
        if history.len() >= self.history_capacity {
            history.pop_front();
        }
        history.push_back(StateTransition { from, to, at_ns: now_ns });
    }

    /// 进入 Reconnecting 的次数
    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// 最近的状态变迁（从旧到新）
    pub fn history(&self) -> Vec<StateTransition> {
        self.history.lock().iter().copied().collect()
    }
}
