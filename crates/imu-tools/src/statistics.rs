//! # 统计算法模块
//!
//! **注意**: 此模块是可选的，需要启用 `statistics` feature
//!
//! 纯函数实现，不持有状态。

use imu_protocol::SampleRecord;
use std::time::Duration;

/// 流统计
pub struct StreamStatistics;

impl StreamStatistics {
    /// 计算速率（Hz）
    pub fn calculate_rate(count: u64, elapsed: Duration) -> f64 {
        let secs = elapsed.as_secs_f64();
        if secs > 0.0 { count as f64 / secs } else { 0.0 }
    }

    /// 计算丢失率（百分比）
    pub fn calculate_loss_rate(expected: u64, received: u64) -> f64 {
        if expected > 0 {
            expected.saturating_sub(received) as f64 / expected as f64 * 100.0
        } else {
            0.0
        }
    }

    /// 按标称采样率估计期望样本数
    pub fn expected_samples(nominal_hz: f64, elapsed: Duration) -> u64 {
        (nominal_hz * elapsed.as_secs_f64()).round().max(0.0) as u64
    }

    /// 统计序号间隙（即下游丢弃的记录数）
    ///
    /// `records` 必须来自同一设备且按交付顺序排列。
    pub fn sequence_gaps(records: &[SampleRecord]) -> u64 {
        records
            .windows(2)
            .map(|pair| pair[1].sequence.saturating_sub(pair[0].sequence + 1))
            .sum()
    }

    /// 相邻记录时间戳是否非递减
    pub fn is_ordered(records: &[SampleRecord]) -> bool {
        records.windows(2).all(|pair| pair[0].timestamp_ns <= pair[1].timestamp_ns)
    }
}

/// 延迟统计（毫秒）
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LatencyStatistics {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub std_dev: f64,
    pub p95: f64,
    pub sample_count: usize,
}

impl LatencyStatistics {
    /// 计算延迟统计
    pub fn calculate(latencies_ms: &[f64]) -> Self {
        if latencies_ms.is_empty() {
            return Self::default();
        }

        let count = latencies_ms.len() as f64;
        let mean = latencies_ms.iter().sum::<f64>() / count;
        let min = latencies_ms.iter().copied().fold(f64::INFINITY, f64::min);
        let max = latencies_ms.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        let variance = latencies_ms.iter().map(|&x| (x - mean).powi(2)).sum::<f64>() / count;

        Self {
            mean,
            min,
            max,
            std_dev: variance.sqrt(),
            p95: percentile(latencies_ms, 95.0),
            sample_count: latencies_ms.len(),
        }
    }

    /// 从记录年龄计算（`now_ns` 为统计时刻的主机时间）
    pub fn from_records(records: &[SampleRecord], now_ns: u64) -> Self {
        let ages: Vec<f64> = records.iter().map(|r| r.age_ms(now_ns)).collect();
        Self::calculate(&ages)
    }
}

/// 百分位数（最近秩法），`p` 取值 0..=100
pub fn percentile(samples: &[f64], p: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(f64::total_cmp);

    let rank = (p.clamp(0.0, 100.0) / 100.0 * sorted.len() as f64).ceil() as usize;
    sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use imu_protocol::{DeviceId, VALID_ACCEL, VALID_GYRO, Vec3};

    fn record(sequence: u64, timestamp_ns: u64) -> SampleRecord {
        SampleRecord {
            device_id: DeviceId::new("left").unwrap(),
            timestamp_ns,
            accel: Vec3::ZERO,
            gyro: Vec3::ZERO,
            mag: Vec3::ZERO,
            valid_mask: VALID_ACCEL | VALID_GYRO,
            sequence,
        }
    }

    #[test]
    fn test_calculate_rate() {
        assert_eq!(StreamStatistics::calculate_rate(100, Duration::from_secs(1)), 100.0);
        assert_eq!(StreamStatistics::calculate_rate(50, Duration::from_millis(500)), 100.0);
        assert_eq!(StreamStatistics::calculate_rate(10, Duration::ZERO), 0.0);
    }

    #[test]
    fn test_calculate_loss_rate() {
        assert_eq!(StreamStatistics::calculate_loss_rate(100, 90), 10.0);
        assert_eq!(StreamStatistics::calculate_loss_rate(100, 120), 0.0);
        assert_eq!(StreamStatistics::calculate_loss_rate(0, 0), 0.0);
    }

    #[test]
    fn test_expected_samples() {
        assert_eq!(StreamStatistics::expected_samples(100.0, Duration::from_secs(2)), 200);
        assert_eq!(StreamStatistics::expected_samples(50.0, Duration::from_millis(10)), 1);
    }

    #[test]
    fn test_sequence_gaps() {
        let records = vec![record(0, 10), record(1, 20), record(4, 30), record(5, 40)];
        assert_eq!(StreamStatistics::sequence_gaps(&records), 2);
        assert_eq!(StreamStatistics::sequence_gaps(&records[..2]), 0);
        assert_eq!(StreamStatistics::sequence_gaps(&[]), 0);
    }

    #[test]
    fn test_is_ordered() {
        assert!(StreamStatistics::is_ordered(&[record(0, 10), record(1, 10), record(2, 20)]));
        assert!(!StreamStatistics::is_ordered(&[record(0, 20), record(1, 10)]));
    }

    #[test]
    fn test_latency_statistics() {
        let latencies = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let stats = LatencyStatistics::calculate(&latencies);

        assert_eq!(stats.mean, 3.0);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 5.0);
        assert_eq!(stats.p95, 5.0);
        assert_eq!(stats.sample_count, 5);
        assert!((stats.std_dev - 2.0_f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn test_latency_statistics_empty() {
        assert_eq!(LatencyStatistics::calculate(&[]), LatencyStatistics::default());
    }

    #[test]
    fn test_latency_from_records() {
        let now = 100_000_000;
        let records = vec![record(0, now - 2_000_000), record(1, now - 4_000_000)];
        let stats = LatencyStatistics::from_records(&records, now);
        assert_eq!(stats.mean, 3.0);
        assert_eq!(stats.max, 4.0);
    }

    #[test]
    fn test_percentile() {
        let samples: Vec<f64> = (1..=100).map(f64::from).collect();
        assert_eq!(percentile(&samples, 95.0), 95.0);
        assert_eq!(percentile(&samples, 50.0), 50.0);
        assert_eq!(percentile(&samples, 0.0), 1.0);
        assert_eq!(percentile(&samples, 100.0), 100.0);
        assert_eq!(percentile(&[], 95.0), 0.0);
    }
}
