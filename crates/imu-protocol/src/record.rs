//! 采样记录类型
//!
//! `SampleRecord` 是整个管线对外暴露的唯一数据类型：一次融合后的运动读数。

use crate::ProtocolError;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// 加速度计数据有效位
pub const VALID_ACCEL: u8 = 1 << 0;
/// 陀螺仪数据有效位
pub const VALID_GYRO: u8 = 1 << 1;
/// 磁力计数据有效位
pub const VALID_MAG: u8 = 1 << 2;

/// 设备标识（调用方分配，永不为空）
///
/// 内部使用 `Arc<str>`，克隆只增加引用计数，不分配内存。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId(Arc<str>);

impl DeviceId {
    /// 创建设备标识
    ///
    /// # 错误
    /// - `ProtocolError::EmptyDeviceId`: 标识为空（或只含空白）
    pub fn new(id: impl AsRef<str>) -> Result<Self, ProtocolError> {
        let id = id.as_ref().trim();
        if id.is_empty() {
            return Err(ProtocolError::EmptyDeviceId);
        }
        Ok(Self(Arc::from(id)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for DeviceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for DeviceId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for DeviceId {
    fn eq(&self, other: &str) -> bool {
        &*self.0 == other
    }
}

impl PartialEq<&str> for DeviceId {
    fn eq(&self, other: &&str) -> bool {
        &*self.0 == *other
    }
}

impl TryFrom<String> for DeviceId {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for DeviceId {
    type Error = ProtocolError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.0.to_string()
    }
}

/// 三轴向量
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// 向量模长
    pub fn magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    pub fn to_array(self) -> [f64; 3] {
        [self.x, self.y, self.z]
    }
}

impl From<[f64; 3]> for Vec3 {
    fn from(v: [f64; 3]) -> Self {
        Self::new(v[0], v[1], v[2])
    }
}

/// 传感器通道
///
/// 线协议中每条消息只携带一个通道的数据。
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive, Serialize, Deserialize,
)]
#[repr(u8)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// 加速度计
    Accel = 0,
    /// 陀螺仪
    Gyro = 1,
    /// 磁力计
    Mag = 2,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Accel => "accel",
            Channel::Gyro => "gyro",
            Channel::Mag => "mag",
        }
    }

    /// 对应的 `SampleRecord::valid_mask` 位
    pub fn valid_bit(self) -> u8 {
        match self {
            Channel::Accel => VALID_ACCEL,
            Channel::Gyro => VALID_GYRO,
            Channel::Mag => VALID_MAG,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = ProtocolError;

    /// 接受短名和全名（手表端上报 `accelerometer` / `gyroscope` 等）
    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        const ACCEL: [&str; 2] = ["accel", "accelerometer"];
        const GYRO: [&str; 2] = ["gyro", "gyroscope"];
        const MAG: [&str; 2] = ["mag", "magnetometer"];

        let matches = |names: &[&str]| names.iter().any(|n| n.eq_ignore_ascii_case(tag));
        if matches(&ACCEL) {
            Ok(Channel::Accel)
        } else if matches(&GYRO) {
            Ok(Channel::Gyro)
        } else if matches(&MAG) {
            Ok(Channel::Mag)
        } else {
            Err(ProtocolError::UnknownChannel {
                tag: tag.to_string(),
            })
        }
    }
}

/// 融合后的运动读数
///
/// # 不变量
///
/// - `device_id` 永不为空（由 `DeviceId` 保证）
/// - 同一设备的记录按 `timestamp_ns` 非递减顺序交付
/// - 缺失的通道填零，并在 `valid_mask` 中清除对应位
///
/// # 时间基准
///
/// `timestamp_ns` 是设备时钟经归一化后的**主机时间**（Unix 纪元纳秒），
/// 因此不同设备的记录可以直接按该字段对齐。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    /// 来源设备
    pub device_id: DeviceId,
    /// 主机时间基准下的时间戳（纳秒）
    pub timestamp_ns: u64,
    /// 加速度（设备上报的单位，参考手表为 m/s²）
    pub accel: Vec3,
    /// 角速度（rad/s）
    pub gyro: Vec3,
    /// 磁场强度（缺失时为零）
    pub mag: Vec3,
    /// 通道有效掩码（`VALID_ACCEL` | `VALID_GYRO` | `VALID_MAG`）
    pub valid_mask: u8,
    /// 设备内单调递增的序号，间隙表示下游丢弃
    pub sequence: u64,
}

impl SampleRecord {
    pub fn has_accel(&self) -> bool {
        self.valid_mask & VALID_ACCEL != 0
    }

    pub fn has_gyro(&self) -> bool {
        self.valid_mask & VALID_GYRO != 0
    }

    pub fn has_mag(&self) -> bool {
        self.valid_mask & VALID_MAG != 0
    }

    /// 加速度计与陀螺仪均有效
    pub fn is_fully_fused(&self) -> bool {
        self.has_accel() && self.has_gyro()
    }

    /// 磁力计读数（仅在有效时返回）
    pub fn mag(&self) -> Option<Vec3> {
        self.has_mag().then_some(self.mag)
    }

    pub fn accel_magnitude(&self) -> f64 {
        self.accel.magnitude()
    }

    pub fn gyro_magnitude(&self) -> f64 {
        self.gyro.magnitude()
    }

    /// 记录相对 `now_ns` 的年龄（纳秒，未来时间戳按 0 计）
    pub fn age_ns(&self, now_ns: u64) -> u64 {
        now_ns.saturating_sub(self.timestamp_ns)
    }

    /// 记录相对 `now_ns` 的年龄（毫秒）
    pub fn age_ms(&self, now_ns: u64) -> f64 {
        self.age_ns(now_ns) as f64 / 1_000_000.0
    }
}
