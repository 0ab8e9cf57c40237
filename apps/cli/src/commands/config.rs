//! 配置管理命令
//!
//! 管线配置是 `ManagerConfig` 的 TOML 表示，缺省字段取默认值。

use anyhow::{Context, Result};
use clap::Subcommand;
use imu_sdk::ManagerConfig;
use std::fs;
use std::path::{Path, PathBuf};

/// 默认配置文件路径
pub fn default_config_file() -> Result<PathBuf> {
    let mut path = dirs::config_dir().ok_or_else(|| anyhow::anyhow!("无法确定配置目录"))?;
    path.push("imu-stream");
    path.push("config.toml");
    Ok(path)
}

/// 加载管线配置
///
/// 显式指定的文件必须存在；默认路径不存在时返回默认配置。
pub fn load_config(explicit: Option<&Path>) -> Result<ManagerConfig> {
    if let Some(path) = explicit {
        return ManagerConfig::from_file(path)
            .with_context(|| format!("加载配置文件失败: {}", path.display()));
    }

    let path = default_config_file()?;
    if !path.exists() {
        return Ok(ManagerConfig::default());
    }
    ManagerConfig::from_file(&path).with_context(|| format!("加载配置文件失败: {}", path.display()))
}

/// 配置命令
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// 打印生效的配置（TOML）
    Show,

    /// 写入默认配置文件
    Init {
        /// 覆盖已存在的文件
        #[arg(short, long)]
        force: bool,
    },

    /// 打印配置文件路径
    Path,
}

impl ConfigCommand {
    pub fn execute(self, explicit: Option<&Path>) -> Result<()> {
        match self {
            ConfigCommand::Show => {
                let config = load_config(explicit)?;
                print!("{}", config.to_toml_string()?);
                Ok(())
            },

            ConfigCommand::Init { force } => {
                let path = match explicit {
                    Some(path) => path.to_path_buf(),
                    None => default_config_file()?,
                };
                if path.exists() && !force {
                    anyhow::bail!("配置文件已存在: {} (使用 --force 覆盖)", path.display());
                }
                if let Some(dir) = path.parent() {
                    fs::create_dir_all(dir).context("创建配置目录失败")?;
                }
                let content = format!(
                    "# IMU stream pipeline configuration\n\n{}",
                    ManagerConfig::default().to_toml_string()?
                );
                fs::write(&path, content).context("写入配置文件失败")?;
                println!("✅ 已写入: {}", path.display());
                Ok(())
            },

            ConfigCommand::Path => {
                match explicit {
                    Some(path) => println!("{}", path.display()),
                    None => println!("{}", default_config_file()?.display()),
                }
                Ok(())
            },
        }
    }
}
