//! 主机时钟与设备时间戳归一化
//!
//! `HostClock` 以创建时刻为锚点：墙钟时间只读取一次，之后用单调时钟推进，
//! 因此不受 NTP 或手动调时影响，同时仍然可以与设备上报的 Unix 时间比较。

use crate::config::TimestampMode;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// 单调推进的主机时钟（Unix 纪元纳秒）
#[derive(Debug, Clone, Copy)]
pub struct HostClock {
    anchor: Instant,
    anchor_unix_ns: u64,
}

impl HostClock {
    pub fn new() -> Self {
        let anchor = Instant::now();
        let anchor_unix_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Self {
            anchor,
            anchor_unix_ns,
        }
    }

    /// 当前主机时间
    pub fn now_ns(&self) -> u64 {
        self.unix_ns_at(Instant::now())
    }

    /// 将单调时刻换算为主机时间
    pub fn unix_ns_at(&self, instant: Instant) -> u64 {
        self.anchor_unix_ns
            .saturating_add(instant.saturating_duration_since(self.anchor).as_nanos() as u64)
    }
}

impl Default for HostClock {
    fn default() -> Self {
        Self::new()
    }
}

/// 映射时间与到达时间的最大允许偏差
pub const RESYNC_THRESHOLD_NS: u64 = 30_000_000_000;

/// 设备时间戳 → 主机时间
///
/// `Normalized` 模式在设备的首个采样处固定偏移
/// `offset = host_receipt - device_ts`，之后的采样保持设备端的相对间隔。
///
/// 偏移跨重连保留：重连后设备补发的旧数据仍映射到旧的主机时间，
/// 由同步器的顺序保护丢弃。只有当映射结果与到达时间相差超过
/// [`RESYNC_THRESHOLD_NS`]（设备重启或时钟被重置）时才重新估计。
#[derive(Debug, Clone)]
pub struct TimestampNormalizer {
    mode: TimestampMode,
    offset_ns: Option<i128>,
}

impl TimestampNormalizer {
    pub fn new(mode: TimestampMode) -> Self {
        Self {
            mode,
            offset_ns: None,
        }
    }

    /// 当前偏移（尚未估计时为 `None`）
    pub fn offset_ns(&self) -> Option<i128> {
        self.offset_ns
    }

    pub fn normalize(&mut self, device_ts_ns: u64, host_now_ns: u64) -> u64 {
        match self.mode {
            TimestampMode::Passthrough => device_ts_ns,
            TimestampMode::Normalized => {
                let estimate = host_now_ns as i128 - device_ts_ns as i128;
                let offset = match self.offset_ns {
                    Some(offset)
                        if (offset - estimate).unsigned_abs()
                            <= RESYNC_THRESHOLD_NS as u128 =>
                    {
                        offset
                    },
                    _ => {
                        self.offset_ns = Some(estimate);
                        estimate
                    },
                };
                (device_ts_ns as i128 + offset).clamp(0, u64::MAX as i128) as u64
            },
        }
    }
}
