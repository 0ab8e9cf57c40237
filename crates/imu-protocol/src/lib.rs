//! # IMU Protocol
//!
//! 腕戴设备 IMU 数据流的协议定义（无网络依赖）
//!
//! ## 模块
//!
//! - `record`: 融合后的采样记录 `SampleRecord` 及其组成类型
//! - `wire`: 线协议消息解码（NDJSON / 单数据报 JSON）
//! - `export`: 扁平导出行 `ExportRow`
//!
//! ## 线协议
//!
//! 每条消息描述**一个通道**的一次采样：
//!
//! ```text
//! {"device_id":"left","type":"accel","timestamp_ns":1700000000000000000,"x":0.1,"y":9.8,"z":0.2}
//! ```
//!
//! 加速度计、陀螺仪、磁力计分别作为独立事件上报，由驱动层按时间戳融合。

pub mod export;
pub mod record;
pub mod wire;

// 重新导出常用类型
pub use export::ExportRow;
pub use record::*;
pub use wire::{WireMessage, decode_message};

use thiserror::Error;

/// 协议解析错误类型
///
/// 所有变体都是**单条消息级别**的错误：调用方计数后丢弃该消息即可。
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown channel tag: {tag:?}")]
    UnknownChannel { tag: String },

    #[error("Empty device id")]
    EmptyDeviceId,

    #[error("Message is not valid UTF-8")]
    InvalidUtf8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::UnknownChannel {
            tag: "baro".to_string(),
        };
        assert_eq!(format!("{}", err), "Unknown channel tag: \"baro\"");

        let err = ProtocolError::EmptyDeviceId;
        assert_eq!(format!("{}", err), "Empty device id");
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: ProtocolError = json_err.into();
        assert!(matches!(err, ProtocolError::Json(_)));
        assert!(format!("{}", err).contains("Malformed message"));
    }
}
