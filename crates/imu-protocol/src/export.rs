//! 扁平导出行
//!
//! 一条 `SampleRecord` 展开为一行，列顺序即 CSV 表头顺序。

use crate::SampleRecord;
use serde::{Deserialize, Serialize};

/// 导出行（磁力计缺失时对应列为空）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRow {
    #[serde(rename = "timestamp")]
    pub timestamp_ns: u64,
    pub accel_x: f64,
    pub accel_y: f64,
    pub accel_z: f64,
    pub gyro_x: f64,
    pub gyro_y: f64,
    pub gyro_z: f64,
    pub mag_x: Option<f64>,
    pub mag_y: Option<f64>,
    pub mag_z: Option<f64>,
    pub device_id: String,
}

impl From<&SampleRecord> for ExportRow {
    fn from(record: &SampleRecord) -> Self {
        let mag = record.mag();
        Self {
            timestamp_ns: record.timestamp_ns,
            accel_x: record.accel.x,
            accel_y: record.accel.y,
            accel_z: record.accel.z,
            gyro_x: record.gyro.x,
            gyro_y: record.gyro.y,
            gyro_z: record.gyro.z,
            mag_x: mag.map(|m| m.x),
            mag_y: mag.map(|m| m.y),
            mag_z: mag.map(|m| m.z),
            device_id: record.device_id.to_string(),
        }
    }
}
