//! 流监控命令
//!
//! 连接设备并周期性打印每个设备的统计，Ctrl-C 结束。

use crate::commands::config::load_config;
use crate::utils::{check_endpoints, install_ctrlc, print_stats, print_summary, wait_tick};
use anyhow::{Context, Result};
use clap::Args;
use imu_sdk::prelude::*;
use std::path::Path;
use std::time::{Duration, Instant};

/// 流监控参数
#[derive(Args, Debug)]
pub struct StreamCommand {
    /// 设备端点（id=host:port[/udp|/ws]）
    #[arg(required = true)]
    pub endpoints: Vec<DeviceEndpoint>,

    /// 统计打印间隔（秒）
    #[arg(short, long, default_value_t = 1.0)]
    pub interval: f64,

    /// 运行时长（秒），缺省表示直到 Ctrl-C
    #[arg(short, long)]
    pub duration: Option<u64>,
}

impl StreamCommand {
    pub fn execute(self, config_path: Option<&Path>) -> Result<()> {
        check_endpoints(&self.endpoints)?;
        if !self.interval.is_finite() || self.interval <= 0.0 {
            anyhow::bail!("--interval 必须大于 0");
        }
        let config = load_config(config_path)?;
        let running = install_ctrlc()?;

        let manager = ManagerBuilder::new().config(config).build()?;
        println!("⏳ 连接 {} 个设备...", self.endpoints.len());
        manager.start(self.endpoints).context("启动采集失败")?;

        let tick = Duration::from_secs_f64(self.interval);
        let deadline = self.duration.map(|s| Instant::now() + Duration::from_secs(s));
        while wait_tick(&running, tick, deadline) {
            println!();
            print_stats(&manager.get_stats());
        }

        let stats = manager.stop()?;
        print_summary(&stats);
        Ok(())
    }
}
