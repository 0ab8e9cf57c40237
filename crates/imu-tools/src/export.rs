//! # CSV 导出格式
//!
//! 每个设备一个文件，前置 `#` 元数据行，之后是标准 CSV：
//!
//! ```text
//! # Session ID: imu-1700000000
//! # Device ID: left
//! # Start Time: 1700000000123
//! # Sample Count: 2
//! timestamp,accel_x,accel_y,accel_z,gyro_x,gyro_y,gyro_z,mag_x,mag_y,mag_z,device_id
//! 1700000000125000000,0.1,9.8,0.2,0.0,0.0,0.01,,,,left
//! ...
//! ```

use anyhow::{Context, Result};
use imu_protocol::ExportRow;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

const SESSION_ID: &str = "Session ID";
const DEVICE_ID: &str = "Device ID";
const START_TIME: &str = "Start Time";
const SAMPLE_COUNT: &str = "Sample Count";

/// 导出会话元数据
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: String,
    pub device_id: String,
    /// 会话开始时间（Unix 毫秒）
    pub start_time_ms: u64,
}

impl SessionMetadata {
    /// 以当前时间为开始时间
    pub fn now(session_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            device_id: device_id.into(),
            start_time_ms: unix_time_ms(),
        }
    }
}

/// 当前 Unix 时间（毫秒）
pub fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// 读回的导出文件
#[derive(Debug, Clone, PartialEq)]
pub struct ExportFile {
    pub metadata: SessionMetadata,
    /// 元数据中记录的样本数
    pub sample_count: usize,
    pub rows: Vec<ExportRow>,
}

/// 写入元数据与全部行
pub fn write_csv<W: Write>(mut writer: W, metadata: &SessionMetadata, rows: &[ExportRow]) -> Result<()> {
    writeln!(writer, "# {SESSION_ID}: {}", metadata.session_id)?;
    writeln!(writer, "# {DEVICE_ID}: {}", metadata.device_id)?;
    writeln!(writer, "# {START_TIME}: {}", metadata.start_time_ms)?;
    writeln!(writer, "# {SAMPLE_COUNT}: {}", rows.len())?;

    let mut csv = csv::Writer::from_writer(writer);
    if rows.is_empty() {
        // 空文件也保留表头
        csv.write_record([
            "timestamp", "accel_x", "accel_y", "accel_z", "gyro_x", "gyro_y", "gyro_z", "mag_x",
            "mag_y", "mag_z", "device_id",
        ])?;
    }
    for row in rows {
        csv.serialize(row).context("序列化导出行失败")?;
    }
    csv.flush()?;
    Ok(())
}

/// 保存到文件
pub fn save_csv<P: AsRef<Path>>(path: P, metadata: &SessionMetadata, rows: &[ExportRow]) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path).with_context(|| format!("创建导出文件失败: {}", path.display()))?;
    write_csv(BufWriter::new(file), metadata, rows)
        .with_context(|| format!("写入导出文件失败: {}", path.display()))
}

/// 从文件加载
pub fn load_csv<P: AsRef<Path>>(path: P) -> Result<ExportFile> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("打开导出文件失败: {}", path.display()))?;
    let mut reader = BufReader::new(file);

    let mut metadata = SessionMetadata {
        session_id: String::new(),
        device_id: String::new(),
        start_time_ms: 0,
    };
    let mut sample_count = 0;

    // 逐行读取 `#` 前导行，第一行非注释行即表头
    let mut header = String::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        let Some(comment) = line.strip_prefix('#') else {
            header = line;
            break;
        };
        let Some((key, value)) = comment.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            SESSION_ID => metadata.session_id = value.to_string(),
            DEVICE_ID => metadata.device_id = value.to_string(),
            START_TIME => metadata.start_time_ms = value.parse().context("无效的开始时间")?,
            SAMPLE_COUNT => sample_count = value.parse().context("无效的样本数")?,
            _ => {},
        }
    }

    let mut csv = csv::Reader::from_reader(header.as_bytes().chain(reader));
    let rows = csv
        .deserialize()
        .collect::<Result<Vec<ExportRow>, _>>()
        .context("解析导出行失败")?;

    if rows.len() != sample_count {
        anyhow::bail!(
            "样本数不匹配: 元数据 {} 行, 实际 {} 行",
            sample_count,
            rows.len()
        );
    }

    Ok(ExportFile {
        metadata,
        sample_count,
        rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(ts: u64, mag: bool) -> ExportRow {
        ExportRow {
            timestamp_ns: ts,
            accel_x: 0.1,
            accel_y: 9.8,
            accel_z: 0.2,
            gyro_x: 0.0,
            gyro_y: 0.0,
            gyro_z: 0.01,
            mag_x: mag.then_some(30.0),
            mag_y: mag.then_some(-5.0),
            mag_z: mag.then_some(12.5),
            device_id: "left".to_string(),
        }
    }

    fn metadata() -> SessionMetadata {
        SessionMetadata {
            session_id: "imu-1700000000".to_string(),
            device_id: "left".to_string(),
            start_time_ms: 1_700_000_000_123,
        }
    }

    #[test]
    fn test_preamble_and_header() {
        let mut out = Vec::new();
        write_csv(&mut out, &metadata(), &[row(1, false), row(2, true)]).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], "# Session ID: imu-1700000000");
        assert_eq!(lines[1], "# Device ID: left");
        assert_eq!(lines[2], "# Start Time: 1700000000123");
        assert_eq!(lines[3], "# Sample Count: 2");
        assert_eq!(
            lines[4],
            "timestamp,accel_x,accel_y,accel_z,gyro_x,gyro_y,gyro_z,mag_x,mag_y,mag_z,device_id"
        );
        assert_eq!(lines[5], "1,0.1,9.8,0.2,0.0,0.0,0.01,,,,left");
        assert_eq!(lines[6], "2,0.1,9.8,0.2,0.0,0.0,0.01,30.0,-5.0,12.5,left");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("left_imu.csv");
        let rows = vec![row(10, true), row(20, false), row(30, true)];
        save_csv(&path, &metadata(), &rows).unwrap();

        let file = load_csv(&path).unwrap();
        assert_eq!(file.metadata, metadata());
        assert_eq!(file.sample_count, 3);
        assert_eq!(file.rows, rows);
    }

    #[test]
    fn test_empty_export_keeps_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.csv");
        save_csv(&path, &metadata(), &[]).unwrap();

        let mut text = String::new();
        File::open(&path).unwrap().read_to_string(&mut text).unwrap();
        assert!(text.contains("# Sample Count: 0"));
        assert!(text.lines().last().unwrap().starts_with("timestamp,"));

        let file = load_csv(&path).unwrap();
        assert!(file.rows.is_empty());
    }

    #[test]
    fn test_load_detects_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        let mut out = Vec::new();
        write_csv(&mut out, &metadata(), &[row(1, false), row(2, false)]).unwrap();
        let text = String::from_utf8(out).unwrap();
        let truncated: Vec<&str> = text.lines().take(6).collect();
        std::fs::write(&path, truncated.join("\n")).unwrap();

        let err = load_csv(&path).unwrap_err();
        assert!(err.to_string().contains("样本数不匹配"));
    }

    #[test]
    fn test_load_missing_file() {
        assert!(load_csv("/nonexistent/imu.csv").is_err());
    }
}
