//! 命令共用的工具函数

use anyhow::{Context, Result};
use imu_sdk::{DeviceEndpoint, ManagerStats};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// 安装 Ctrl-C 处理，返回运行标志（收到信号后变为 false）
pub fn install_ctrlc() -> Result<Arc<AtomicBool>> {
    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    ctrlc::set_handler(move || {
        flag.store(false, Ordering::Release);
    })
    .context("设置 Ctrl-C 处理失败")?;
    Ok(running)
}

/// 等待直到 `deadline`、收到 Ctrl-C，或者 `tick` 到期
///
/// 返回 `false` 表示应当结束。
pub fn wait_tick(running: &AtomicBool, tick: Duration, deadline: Option<Instant>) -> bool {
    let wake = Instant::now() + tick;
    loop {
        if !running.load(Ordering::Acquire) {
            return false;
        }
        let now = Instant::now();
        if deadline.is_some_and(|d| now >= d) {
            return false;
        }
        if now >= wake {
            return true;
        }
        thread::sleep(Duration::from_millis(20).min(wake - now));
    }
}

/// 设备标识不得重复
pub fn check_endpoints(endpoints: &[DeviceEndpoint]) -> Result<()> {
    if endpoints.is_empty() {
        anyhow::bail!("至少需要一个设备（格式: id=host:port[/udp|/ws]）");
    }
    let mut seen = HashSet::new();
    for endpoint in endpoints {
        if !seen.insert(endpoint.device_id.as_str()) {
            anyhow::bail!("设备重复: {}", endpoint.device_id);
        }
    }
    Ok(())
}

/// 打印一行一个设备的统计
pub fn print_stats(stats: &ManagerStats) {
    for d in &stats.devices {
        println!(
            "{:<10} {:<12} {:>7.1} Hz  msgs {:>8}  fused {:>8}  degraded {:>6}  dropped {:>6}  buf {:>5}/{:<5} lat {:>6.2} ms",
            d.device_id.as_str(),
            d.state.to_string(),
            d.record_rate_hz,
            d.messages_received,
            d.fused_records,
            d.degraded_records,
            d.dropped_records(),
            d.buffer_len,
            d.buffer_capacity,
            d.latency_ewma_ms,
        );
    }
}

/// 打印会话汇总
pub fn print_summary(stats: &ManagerStats) {
    let t = &stats.totals;
    println!("\n📊 会话汇总 ({:.1}s)", stats.uptime_ms as f64 / 1000.0);
    println!("  消息: {}  解码错误: {}", t.messages_received, t.decode_errors);
    println!(
        "  融合: {}  降级: {}  交付: {}",
        t.fused_records, t.degraded_records, t.records_delivered
    );
    println!(
        "  溢出: {}  池耗尽: {}  乱序丢弃: {}",
        t.overflow_count, t.pool_exhausted, t.out_of_order_drops
    );
    println!(
        "  延迟: 平均 {:.2} ms  最大 {:.2} ms  回调失败: {}",
        t.latency_ewma_ms, t.latency_max_ms, stats.consumer_failures
    );
    for d in &stats.devices {
        println!("  {}: 重连 {} 次", d.device_id, d.reconnects);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_endpoints() {
        let left: DeviceEndpoint = "left=127.0.0.1:9000".parse().unwrap();
        let right: DeviceEndpoint = "right=127.0.0.1:9001/udp".parse().unwrap();
        assert!(check_endpoints(&[left.clone(), right]).is_ok());
        assert!(check_endpoints(&[left.clone(), left]).is_err());
        assert!(check_endpoints(&[]).is_err());
    }

    #[test]
    fn test_wait_tick() {
        let running = AtomicBool::new(true);
        assert!(wait_tick(&running, Duration::from_millis(10), None));

        let past = Instant::now();
        assert!(!wait_tick(&running, Duration::from_secs(10), Some(past)));

        running.store(false, Ordering::Release);
        assert!(!wait_tick(&running, Duration::from_secs(10), None));
    }
}
