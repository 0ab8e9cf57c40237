//! 设备模拟命令
//!
//! 每个设备监听一个端口，向连入的客户端推送 JSON 采样：
//! `/ws` 端点与手表端一样按 WebSocket 帧发送，其余按行分隔的 TCP。

use crate::utils::{check_endpoints, install_ctrlc, wait_tick};
use anyhow::{Context, Result};
use clap::Args;
use imu_sdk::DeviceEndpoint;
use imu_sdk::transport::TransportKind;
use imu_sdk::transport::sim::{SimConfig, SimServer};
use std::time::{Duration, Instant};

/// 模拟命令参数
#[derive(Args, Debug)]
pub struct SimulateCommand {
    /// 模拟设备（id=bind_host:port[/ws]）
    #[arg(required = true)]
    pub devices: Vec<DeviceEndpoint>,

    /// 每个通道的采样率（Hz）
    #[arg(short, long, default_value_t = 100.0)]
    pub rate: f64,

    /// 同时发送磁力计
    #[arg(long)]
    pub mag: bool,

    /// 陀螺仪相对加速度计的时间偏移（毫秒）
    #[arg(long, default_value_t = 2)]
    pub skew_ms: u64,

    /// 运行时长（秒），缺省表示直到 Ctrl-C
    #[arg(short, long)]
    pub duration: Option<u64>,

    /// 随机种子
    #[arg(long, default_value_t = 0)]
    pub seed: u64,
}

impl SimulateCommand {
    fn sim_config(&self, endpoint: &DeviceEndpoint, index: u64) -> SimConfig {
        SimConfig {
            rate_hz: self.rate,
            with_mag: self.mag,
            gyro_skew: Duration::from_millis(self.skew_ms),
            seed: self.seed.wrapping_add(index),
            transport: endpoint.transport,
            ..SimConfig::new(endpoint.device_id.clone())
        }
    }

    pub fn execute(self) -> Result<()> {
        check_endpoints(&self.devices)?;
        if !self.rate.is_finite() || self.rate <= 0.0 {
            anyhow::bail!("--rate 必须大于 0");
        }
        if let Some(udp) = self.devices.iter().find(|d| d.transport == TransportKind::Udp) {
            anyhow::bail!("模拟设备只支持 TCP / WebSocket: {}", udp.device_id);
        }
        let running = install_ctrlc()?;

        let mut servers = Vec::with_capacity(self.devices.len());
        for (index, endpoint) in self.devices.iter().enumerate() {
            let server = SimServer::spawn(&endpoint.address, self.sim_config(endpoint, index as u64))
                .with_context(|| format!("监听 {} 失败", endpoint.address))?;
            println!("📡 {} → {}", endpoint.device_id, server.local_addr());
            servers.push(server);
        }

        let deadline = self.duration.map(|s| Instant::now() + Duration::from_secs(s));
        while wait_tick(&running, Duration::from_secs(1), deadline) {
            let sent: u64 = servers.iter().map(SimServer::messages_sent).sum();
            println!("  已发送 {} 条消息", sent);
        }

        for server in servers {
            server.stop();
        }
        println!("✅ 模拟结束");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_config_from_args() {
        let cmd = SimulateCommand {
            devices: vec!["left=127.0.0.1:0".parse().unwrap()],
            rate: 50.0,
            mag: true,
            skew_ms: 3,
            duration: Some(1),
            seed: 7,
        };
        let config = cmd.sim_config(&cmd.devices[0], 1);
        assert_eq!(config.device_id.as_str(), "left");
        assert_eq!(config.rate_hz, 50.0);
        assert!(config.with_mag);
        assert_eq!(config.gyro_skew, Duration::from_millis(3));
        assert_eq!(config.seed, 8);
        assert_eq!(config.transport, TransportKind::Tcp);
    }

    #[test]
    fn test_sim_config_keeps_websocket_transport() {
        let cmd = SimulateCommand {
            devices: vec!["left_watch=127.0.0.1:0/ws".parse().unwrap()],
            rate: 100.0,
            mag: false,
            skew_ms: 2,
            duration: Some(1),
            seed: 0,
        };
        let config = cmd.sim_config(&cmd.devices[0], 0);
        assert_eq!(config.transport, TransportKind::Ws);
        assert_eq!(config.device_id.as_str(), "left_watch");
    }

    #[test]
    fn test_simulate_rejects_udp() {
        let cmd = SimulateCommand {
            devices: vec!["left=127.0.0.1:0/udp".parse().unwrap()],
            rate: 100.0,
            mag: false,
            skew_ms: 2,
            duration: Some(1),
            seed: 0,
        };
        assert!(cmd.execute().is_err());
    }
}
