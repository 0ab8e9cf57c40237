//! 线协议消息解码
//!
//! 一条消息 = 一个通道的一次采样。WebSocket 每帧一条，TCP 按行分隔，UDP 每个数据报一条。
//! 同时接受两种键名拼写：`channel`/`type` 与 `timestamp`/`timestamp_ns`；
//! 手表端以 `watch_id` 标识自己，等同于 `device_id`。

use crate::{Channel, ProtocolError, Vec3};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// 解码后的单通道采样
///
/// `device_id` 在无转义字符时直接借用输入缓冲区，避免热路径上的分配。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WireMessage<'a> {
    pub device_id: Cow<'a, str>,
    #[serde(rename = "type")]
    pub channel: Channel,
    pub timestamp_ns: u64,
    #[serde(flatten)]
    pub value: Vec3,
}

impl WireMessage<'_> {
    pub fn into_owned(self) -> WireMessage<'static> {
        WireMessage {
            device_id: Cow::Owned(self.device_id.into_owned()),
            channel: self.channel,
            timestamp_ns: self.timestamp_ns,
            value: self.value,
        }
    }

    /// 编码为单行 JSON（不含换行符），使用参考手表的键名
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Deserialize)]
struct RawMessage<'a> {
    #[serde(alias = "watch_id", borrow)]
    device_id: Cow<'a, str>,
    #[serde(alias = "type", borrow)]
    channel: Cow<'a, str>,
    #[serde(alias = "timestamp_ns")]
    timestamp: u64,
    x: f64,
    y: f64,
    z: f64,
}

/// 解码一条消息
///
/// 输入可以带有行尾空白（`\n` / `\r\n`）。
///
/// # 错误
/// - `InvalidUtf8`: 输入不是 UTF-8
/// - `Json`: 结构不符（缺字段、类型错误、数值越界）
/// - `UnknownChannel`: 通道标签无法识别
/// - `EmptyDeviceId`: `device_id` 为空
pub fn decode_message(bytes: &[u8]) -> Result<WireMessage<'_>, ProtocolError> {
    let text = std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)?;
    let raw: RawMessage<'_> = serde_json::from_str(text.trim_end())?;

    if raw.device_id.trim().is_empty() {
        return Err(ProtocolError::EmptyDeviceId);
    }
    let channel: Channel = raw.channel.parse()?;

    Ok(WireMessage {
        device_id: raw.device_id,
        channel,
        timestamp_ns: raw.timestamp,
        value: Vec3::new(raw.x, raw.y, raw.z),
    })
}
