//! # IMU CLI
//!
//! 多设备 IMU 流的命令行工具。
//!
//! ```bash
//! # 实时查看两只手表的统计
//! imu-cli stream left=192.168.1.20:8765 right=192.168.1.21:8765
//!
//! # 录制 30 秒，每个设备一个 CSV
//! imu-cli record left=192.168.1.20:8765 --duration 30 --output ./data
//!
//! # 本机模拟一个设备
//! imu-cli simulate left=127.0.0.1:8765 --rate 100
//! ```
//!
//! 管线配置从 `--config` 指定的 TOML 文件加载；未指定时使用用户配置目录下的
//! `imu-stream/config.toml`（存在时）。

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod utils;

use commands::{ConfigCommand, RecordCommand, SimulateCommand, StreamCommand};

/// IMU CLI - 多设备 IMU 流工具
#[derive(Parser, Debug)]
#[command(name = "imu-cli")]
#[command(about = "Command-line interface for multi-device IMU streaming", long_about = None)]
#[command(version)]
struct Cli {
    /// 管线配置文件（TOML）
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 连接设备并周期性打印统计
    Stream {
        #[command(flatten)]
        args: StreamCommand,
    },

    /// 录制到 CSV（每个设备一个文件）
    Record {
        #[command(flatten)]
        args: RecordCommand,
    },

    /// 通过 TCP 模拟设备
    Simulate {
        #[command(flatten)]
        args: SimulateCommand,
    },

    /// 配置管理
    #[command(subcommand)]
    Config(ConfigCommand),
}

fn main() -> Result<()> {
    // 初始化日志
    imu_sdk::init_logging("warn,imu_cli=info").map_err(|e| anyhow::anyhow!(e))?;

    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Stream { args } => args.execute(config_path),
        Commands::Record { args } => args.execute(config_path),
        Commands::Simulate { args } => args.execute(),
        Commands::Config(cmd) => cmd.execute(config_path),
    }
}
