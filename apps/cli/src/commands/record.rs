//! 录制命令
//!
//! 采集指定时长，结束后为每个设备写一个 CSV 文件。

use crate::commands::config::load_config;
use crate::utils::{check_endpoints, install_ctrlc, print_summary, wait_tick};
use anyhow::{Context, Result};
use clap::Args;
use imu_sdk::prelude::*;
use imu_tools::{SessionMetadata, StreamStatistics, save_csv, unix_time_ms};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// 录制命令参数
#[derive(Args, Debug)]
pub struct RecordCommand {
    /// 设备端点（id=host:port[/udp|/ws]）
    #[arg(required = true)]
    pub endpoints: Vec<DeviceEndpoint>,

    /// 录制时长（秒）
    #[arg(short, long, default_value_t = 10)]
    pub duration: u64,

    /// 输出目录
    #[arg(short, long, default_value = ".")]
    pub output: PathBuf,

    /// 会话标识（默认 imu-<unix 秒>）
    #[arg(short, long)]
    pub session: Option<String>,

    /// 写入队列可缓存的批次数
    #[arg(long, default_value_t = 1024)]
    pub queue: usize,
}

impl RecordCommand {
    pub fn execute(self, config_path: Option<&Path>) -> Result<()> {
        check_endpoints(&self.endpoints)?;
        if self.duration == 0 {
            anyhow::bail!("--duration 必须大于 0");
        }
        let config = load_config(config_path)?;
        fs::create_dir_all(&self.output)
            .with_context(|| format!("创建输出目录失败: {}", self.output.display()))?;
        let running = install_ctrlc()?;

        let start_time_ms = unix_time_ms();
        let session_id = self
            .session
            .clone()
            .unwrap_or_else(|| format!("imu-{}", start_time_ms / 1000));

        // 写入线程只收集，结束后统一落盘
        let (consumer, rx) = ChannelConsumer::new(self.queue.max(1));
        let consumer = Arc::new(consumer);
        let dropped = consumer.dropped_records().clone();
        let collector = thread::Builder::new()
            .name("imu-record".into())
            .spawn(move || {
                let mut records: HashMap<DeviceId, Vec<SampleRecord>> = HashMap::new();
                while let Ok(batch) = rx.recv() {
                    records.entry(batch.device_id).or_default().extend(batch.records);
                }
                records
            })
            .context("启动写入线程失败")?;

        let manager = ManagerBuilder::new().config(config).consumer(consumer).build()?;
        let devices: Vec<DeviceId> = self.endpoints.iter().map(|e| e.device_id.clone()).collect();

        println!("⏳ 录制 {} 秒...", self.duration);
        let started = Instant::now();
        manager.start(self.endpoints).context("启动采集失败")?;

        let deadline = Some(started + Duration::from_secs(self.duration));
        while wait_tick(&running, Duration::from_secs(1), deadline) {
            let delivered = manager.get_stats().totals.records_delivered;
            println!("  {:.0}s: {} 条记录", started.elapsed().as_secs_f64(), delivered);
        }

        let stats = manager.stop()?;
        let elapsed = started.elapsed();
        // 释放消费者，写入线程随通道关闭退出
        drop(manager);
        let records = collector
            .join()
            .map_err(|_| anyhow::anyhow!("写入线程异常退出"))?;

        println!("\n✅ 录制完成");
        for device in &devices {
            let device_records = records.get(device).map(Vec::as_slice).unwrap_or_default();
            let rows: Vec<ExportRow> = device_records.iter().map(ExportRow::from).collect();

            let path = self.output.join(format!("{}_{}.csv", session_id, device));
            let metadata = SessionMetadata {
                session_id: session_id.clone(),
                device_id: device.to_string(),
                start_time_ms,
            };
            save_csv(&path, &metadata, &rows)?;

            println!(
                "💾 {}: {} 行, {:.1} Hz, 序号间隙 {} → {}",
                device,
                rows.len(),
                StreamStatistics::calculate_rate(rows.len() as u64, elapsed),
                StreamStatistics::sequence_gaps(device_records),
                path.display()
            );
        }

        let dropped = dropped.load(std::sync::atomic::Ordering::Relaxed);
        if dropped > 0 {
            println!("⚠️  写入队列满，丢弃 {} 条记录", dropped);
        }
        print_summary(&stats);
        Ok(())
    }
}
