//! 加速度计/陀螺仪流融合
//!
//! 设备把每个通道作为独立事件上报。同步器为每个通道保留少量未配对采样，
//! 新采样到达时在对侧队列中寻找时间戳最接近、且相差不超过融合窗口的采样，
//! 配对成功即输出一条融合记录（时间戳取二者中较晚者）。
//!
//! - 配对点之前的待定采样先以降级记录输出，保证输出按时间戳有序
//! - 未配对采样在主机接收后等待满 `fusion_timeout` 才以降级记录输出
//! - 磁力计只保留最新值，在融合窗口内时顺带合并，不阻塞融合
//! - 输出端保证时间戳非递减，更早的记录被丢弃并计数

use imu_protocol::{Channel, DeviceId, SampleRecord, VALID_ACCEL, VALID_GYRO, VALID_MAG, Vec3};
use smallvec::SmallVec;
use std::time::Duration;

/// 每个通道最多保留的未配对采样数
pub const PENDING_DEPTH: usize = 16;

#[derive(Debug, Clone, Copy)]
struct Pending {
    ts: u64,
    value: Vec3,
    received_ns: u64,
}

type PendingQueue = SmallVec<[Pending; PENDING_DEPTH]>;

/// 同步器累计统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// 输出的完整融合记录
    pub fused: u64,
    /// 输出的降级记录（缺少加速度计或陀螺仪）
    pub degraded: u64,
    /// 因时间戳回退被丢弃的记录
    pub out_of_order_drops: u64,
    /// 因待定队列满被提前输出的采样
    pub evicted: u64,
}

/// 单设备流同步器（由接收线程独占）
pub struct StreamSynchronizer {
    device_id: DeviceId,
    window_ns: u64,
    timeout_ns: u64,
    accel: PendingQueue,
    gyro: PendingQueue,
    mag: Option<Pending>,
    staged: Vec<SampleRecord>,
    last_emitted_ns: Option<u64>,
    next_sequence: u64,
    stats: SyncStats,
}

impl StreamSynchronizer {
    pub fn new(device_id: DeviceId, window: Duration, timeout: Duration) -> Self {
        Self {
            device_id,
            window_ns: window.as_nanos() as u64,
            timeout_ns: timeout.as_nanos() as u64,
            accel: SmallVec::new(),
            gyro: SmallVec::new(),
            mag: None,
            staged: Vec::with_capacity(PENDING_DEPTH * 2),
            last_emitted_ns: None,
            next_sequence: 0,
            stats: SyncStats::default(),
        }
    }

    /// 输入一个单通道采样，把可以输出的记录追加到 `out`
    ///
    /// `timestamp_ns` 为主机时间基准下的采样时间，`received_ns` 为主机接收时刻。
    pub fn push(
        &mut self,
        channel: Channel,
        timestamp_ns: u64,
        value: Vec3,
        received_ns: u64,
        out: &mut Vec<SampleRecord>,
    ) {
        self.stage_expired(received_ns);

        let sample = Pending {
            ts: timestamp_ns,
            value,
            received_ns,
        };
        match channel {
            Channel::Mag => self.mag = Some(sample),
            Channel::Accel => self.fuse_or_queue(sample, Channel::Accel),
            Channel::Gyro => self.fuse_or_queue(sample, Channel::Gyro),
        }

        self.commit(out);
    }

    /// 推进时间：输出等待已满超时的未配对采样
    pub fn expire(&mut self, now_ns: u64, out: &mut Vec<SampleRecord>) {
        self.stage_expired(now_ns);
        self.commit(out);
    }

    /// 丢弃所有待定采样（重连时调用），保留顺序保护与序号
    pub fn reset(&mut self) {
        self.accel.clear();
        self.gyro.clear();
        self.mag = None;
        self.staged.clear();
    }

    /// 待定（未配对）采样数
    pub fn pending(&self) -> usize {
        self.accel.len() + self.gyro.len()
    }

    pub fn stats(&self) -> SyncStats {
        self.stats
    }

    pub fn last_emitted_ns(&self) -> Option<u64> {
        self.last_emitted_ns
    }

    fn fuse_or_queue(&mut self, sample: Pending, channel: Channel) {
        let window = self.window_ns;
        let counterpart = match channel {
            Channel::Accel => &self.gyro,
            _ => &self.accel,
        };
        let best = counterpart
            .iter()
            .enumerate()
            .map(|(i, p)| (i, p.ts.abs_diff(sample.ts)))
            .filter(|&(_, diff)| diff <= window)
            .min_by_key(|&(_, diff)| diff)
            .map(|(i, _)| i);

        match best {
            Some(index) => {
                let (accel, gyro) = match channel {
                    Channel::Accel => (sample, self.gyro.remove(index)),
                    _ => (self.accel.remove(index), sample),
                };
                let fused_ts = accel.ts.max(gyro.ts);

                self.flush_through(fused_ts);
                let record = self.build(fused_ts, Some(accel.value), Some(gyro.value));
                self.staged.push(record);
            },
            None => {
                let own = match channel {
                    Channel::Accel => &mut self.accel,
                    _ => &mut self.gyro,
                };
                let evicted = (own.len() >= PENDING_DEPTH).then(|| own.remove(0));
                own.push(sample);

                if let Some(oldest) = evicted {
                    self.stats.evicted += 1;
                    self.stage_degraded(oldest, channel);
                }
            },
        }
    }

    /// 把两侧时间戳不晚于 `cutoff_ns` 的待定采样输出为降级记录
    fn flush_through(&mut self, cutoff_ns: u64) {
        for channel in [Channel::Accel, Channel::Gyro] {
            let mut i = 0;
            loop {
                let queue = match channel {
                    Channel::Accel => &mut self.accel,
                    _ => &mut self.gyro,
                };
                if i >= queue.len() {
                    break;
                }
                if queue[i].ts <= cutoff_ns {
                    let pending = queue.remove(i);
                    self.stage_degraded(pending, channel);
                } else {
                    i += 1;
                }
            }
        }
    }

    fn stage_expired(&mut self, now_ns: u64) {
        let timeout = self.timeout_ns;
        let take_expired = |queue: &mut PendingQueue| match queue.first() {
            Some(p) if now_ns.saturating_sub(p.received_ns) >= timeout => Some(queue.remove(0)),
            _ => None,
        };

        while let Some(p) = take_expired(&mut self.accel) {
            self.stage_degraded(p, Channel::Accel);
        }
        while let Some(p) = take_expired(&mut self.gyro) {
            self.stage_degraded(p, Channel::Gyro);
        }
    }

    fn stage_degraded(&mut self, pending: Pending, channel: Channel) {
        let record = match channel {
            Channel::Accel => self.build(pending.ts, Some(pending.value), None),
            _ => self.build(pending.ts, None, Some(pending.value)),
        };
        self.staged.push(record);
    }

    fn build(&self, ts: u64, accel: Option<Vec3>, gyro: Option<Vec3>) -> SampleRecord {
        let mag = self
            .mag
            .filter(|m| m.ts.abs_diff(ts) <= self.window_ns)
            .map(|m| m.value);

        let mut valid_mask = 0;
        if accel.is_some() {
            valid_mask |= VALID_ACCEL;
        }
        if gyro.is_some() {
            valid_mask |= VALID_GYRO;
        }
        if mag.is_some() {
            valid_mask |= VALID_MAG;
        }

        SampleRecord {
            device_id: self.device_id.clone(),
            timestamp_ns: ts,
            accel: accel.unwrap_or(Vec3::ZERO),
            gyro: gyro.unwrap_or(Vec3::ZERO),
            mag: mag.unwrap_or(Vec3::ZERO),
            valid_mask,
            sequence: 0,
        }
    }

    /// 按时间戳排序暂存记录，经过顺序保护后分配序号并输出
    fn commit(&mut self, out: &mut Vec<SampleRecord>) {
        if self.staged.is_empty() {
            return;
        }
        self.staged.sort_by_key(|r| r.timestamp_ns);

        for mut record in self.staged.drain(..) {
            if let Some(last) = self.last_emitted_ns
                && record.timestamp_ns < last
            {
                self.stats.out_of_order_drops += 1;
                continue;
            }

            if record.is_fully_fused() {
                self.stats.fused += 1;
            } else {
                self.stats.degraded += 1;
            }
            record.sequence = self.next_sequence;
            self.next_sequence += 1;
            self.last_emitted_ns = Some(record.timestamp_ns);
            out.push(record);
        }
    }
}
