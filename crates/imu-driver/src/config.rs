//! 管线配置
//!
//! `ManagerConfig` 是纯数据（POD），可以从 TOML 反序列化；运行时组件
//! （消费者、连接器）由 `StreamManager` 单独持有。

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// 设备时间戳处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampMode {
    /// 以每次连接的首个采样估计设备时钟偏移，映射到主机时间
    #[default]
    Normalized,
    /// 原样使用设备时间戳（设备已与主机对时）
    Passthrough,
}

/// 管线配置
///
/// # Example
///
/// ```
/// use imu_driver::ManagerConfig;
///
/// let config = ManagerConfig::from_toml_str("ring_capacity = 256\nfusion_window_ms = 5").unwrap();
/// assert_eq!(config.ring_capacity, 256);
/// assert_eq!(config.fusion_timeout_ms, 50);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ManagerConfig {
    /// 每个设备的环形缓冲区容量（条记录）
    pub ring_capacity: usize,
    /// 内存池大小 = multiplier × 全部环形缓冲区容量之和
    pub pool_multiplier: usize,
    /// 加速度计/陀螺仪配对窗口（毫秒）
    pub fusion_window_ms: u64,
    /// 未配对采样的最长等待（毫秒），超时后以降级记录输出
    pub fusion_timeout_ms: u64,
    /// 分发周期（毫秒）
    pub drain_interval_ms: u64,
    /// 单批最大记录数
    pub max_batch: usize,
    /// 单次接收超时（毫秒）
    pub receive_timeout_ms: u64,
    /// 建立连接超时（毫秒）
    pub connect_timeout_ms: u64,
    /// 首次重连等待（毫秒），之后指数翻倍
    pub backoff_initial_ms: u64,
    /// 重连等待上限（毫秒）
    pub backoff_max_ms: u64,
    /// 回调耗时告警阈值（毫秒）
    pub callback_grace_ms: u64,
    /// 每个设备保留的最近记录数（0 表示关闭导出窗口）
    pub history_capacity: usize,
    /// 速率统计滑动窗口（毫秒）
    pub rate_window_ms: u64,
    /// 每个设备保留的连接状态变迁条数
    pub transition_history: usize,
    pub timestamp_mode: TimestampMode,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 1024,
            pool_multiplier: 2,
            fusion_window_ms: 10,
            fusion_timeout_ms: 50,
            drain_interval_ms: 10,
            max_batch: 256,
            receive_timeout_ms: 20,
            connect_timeout_ms: 2000,
            backoff_initial_ms: 1000,
            backoff_max_ms: 10_000,
            callback_grace_ms: 5,
            history_capacity: 1000,
            rate_window_ms: 1000,
            transition_history: 32,
            timestamp_mode: TimestampMode::Normalized,
        }
    }
}

impl ManagerConfig {
    /// 从 TOML 文本解析（缺省字段取默认值），并执行校验
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// 从 TOML 文件加载
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// 校验配置
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn positive(field: &'static str, value: u64) -> Result<(), ConfigError> {
            if value == 0 {
                return Err(ConfigError::invalid(field, "must be > 0"));
            }
            Ok(())
        }

        positive("ring_capacity", self.ring_capacity as u64)?;
        positive("pool_multiplier", self.pool_multiplier as u64)?;
        positive("fusion_window_ms", self.fusion_window_ms)?;
        positive("fusion_timeout_ms", self.fusion_timeout_ms)?;
        positive("drain_interval_ms", self.drain_interval_ms)?;
        positive("max_batch", self.max_batch as u64)?;
        positive("receive_timeout_ms", self.receive_timeout_ms)?;
        positive("connect_timeout_ms", self.connect_timeout_ms)?;
        positive("backoff_initial_ms", self.backoff_initial_ms)?;
        positive("rate_window_ms", self.rate_window_ms)?;

        if self.fusion_timeout_ms < self.fusion_window_ms {
            return Err(ConfigError::invalid(
                "fusion_timeout_ms",
                format!(
                    "must be >= fusion_window_ms ({} < {})",
                    self.fusion_timeout_ms, self.fusion_window_ms
                ),
            ));
        }
        if self.backoff_max_ms < self.backoff_initial_ms {
            return Err(ConfigError::invalid(
                "backoff_max_ms",
                format!(
                    "must be >= backoff_initial_ms ({} < {})",
                    self.backoff_max_ms, self.backoff_initial_ms
                ),
            ));
        }
        Ok(())
    }

    /// 给定设备数时的内存池容量
    pub fn pool_capacity(&self, devices: usize) -> Result<usize, ConfigError> {
        self.ring_capacity
            .checked_mul(devices)
            .and_then(|n| n.checked_mul(self.pool_multiplier))
            .filter(|&n| n <= u32::MAX as usize)
            .ok_or_else(|| {
                ConfigError::invalid(
                    "ring_capacity",
                    format!("pool for {devices} devices exceeds {} slots", u32::MAX),
                )
            })
    }

    pub fn fusion_window(&self) -> Duration {
        Duration::from_millis(self.fusion_window_ms)
    }

    pub fn fusion_timeout(&self) -> Duration {
        Duration::from_millis(self.fusion_timeout_ms)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn callback_grace(&self) -> Duration {
        Duration::from_millis(self.callback_grace_ms)
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_millis(self.rate_window_ms)
    }
}
