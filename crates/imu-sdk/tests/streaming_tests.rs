//! 端到端流测试
//!
//! 通过 mock 连接器驱动完整管线：接收线程 → 融合 → 内存池/环形缓冲区 → 分发 → 消费者。

use imu_sdk::prelude::*;
use imu_sdk::protocol::Channel;
use imu_sdk::transport::sim::{SampleGenerator, SimConfig, SimServer, unix_time_ns};
use imu_sdk::transport::{MockConnector, MockDevice};
use parking_lot::Mutex;
use serial_test::serial;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

type Collected = Arc<Mutex<HashMap<String, Vec<SampleRecord>>>>;

/// 按设备收集所有交付的记录
fn collector() -> (Arc<dyn SampleConsumer>, Collected) {
    let collected: Collected = Arc::new(Mutex::new(HashMap::new()));
    let sink = collected.clone();
    let consumer = FnConsumer::named("collector", move |device: &DeviceId, batch: &[SampleRecord]| {
        sink.lock()
            .entry(device.to_string())
            .or_default()
            .extend_from_slice(batch);
        Ok(())
    });
    (Arc::new(consumer), collected)
}

fn count(collected: &Collected, device: &str) -> usize {
    collected.lock().get(device).map_or(0, Vec::len)
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

fn id(name: &str) -> DeviceId {
    DeviceId::new(name).unwrap()
}

fn endpoint(name: &str) -> DeviceEndpoint {
    DeviceEndpoint::tcp(id(name), format!("mock-{name}"))
}

fn message(device: &DeviceId, channel: Channel, timestamp_ns: u64) -> imu_sdk::protocol::WireMessage<'static> {
    imu_sdk::protocol::WireMessage {
        device_id: Cow::Owned(device.to_string()),
        channel,
        timestamp_ns,
        value: Vec3::new(0.1, 9.8, 0.2),
    }
}

fn send_pair(device: &MockDevice, ts_ns: u64) {
    device.send(&message(device.id(), Channel::Accel, ts_ns));
    device.send(&message(device.id(), Channel::Gyro, ts_ns + 2_000_000));
}

fn assert_ordered(records: &[SampleRecord]) {
    assert!(
        records.windows(2).all(|w| w[0].timestamp_ns <= w[1].timestamp_ns),
        "records out of order"
    );
}

#[test]
#[serial]
fn test_two_devices_steady_100hz() {
    let manager = ManagerBuilder::new()
        .connector(MockConnector::new())
        .fusion_window(Duration::from_millis(10))
        .build()
        .unwrap();
    let (consumer, collected) = collector();
    manager.add_consumer(consumer);

    let devices: Vec<MockDevice> = ["left", "right"]
        .iter()
        .map(|name| manager.connector().device(&id(name)))
        .collect();
    manager.start(vec![endpoint("left"), endpoint("right")]).unwrap();
    assert!(wait_until(Duration::from_secs(2), || devices.iter().all(|d| d.is_connected())));

    let mut generators: Vec<SampleGenerator> = devices
        .iter()
        .map(|d| {
            let mut config = SimConfig::new(d.id().clone());
            config.noise = 0.0;
            SampleGenerator::new(config)
        })
        .collect();

    // 100 Hz 稳定发送 1 秒
    let period = Duration::from_millis(10);
    let started = Instant::now();
    for tick in 0..100u32 {
        let now_ns = unix_time_ns();
        for (device, generator) in devices.iter().zip(generators.iter_mut()) {
            for msg in generator.next_messages(now_ns) {
                device.send(&msg);
            }
        }
        let next = started + period * (tick + 1);
        if let Some(wait) = next.checked_duration_since(Instant::now()) {
            thread::sleep(wait);
        }
    }

    assert!(wait_until(Duration::from_secs(2), || {
        count(&collected, "left") >= 100 && count(&collected, "right") >= 100
    }));
    manager.flush().unwrap();
    let stats = manager.get_stats();
    let final_stats = manager.stop().unwrap();

    for name in ["left", "right"] {
        let records = collected.lock().remove(name).unwrap();
        assert_eq!(records.len(), 100, "{name}");
        assert!(records.iter().all(SampleRecord::is_fully_fused));
        assert_ordered(&records);
        assert_eq!(
            records.iter().map(|r| r.sequence).collect::<Vec<_>>(),
            (0..100).collect::<Vec<u64>>()
        );

        let device = stats.device(name).unwrap();
        assert_eq!(device.fused_records, 100);
        assert_eq!(device.degraded_records, 0);
        assert_eq!(device.overflow_count, 0);
        assert_eq!(device.records_delivered, 100);
        assert!(device.latency_ewma_ms < 20.0, "latency {}", device.latency_ewma_ms);
    }
    assert_eq!(final_stats.totals.overflow_count, 0);
    assert_eq!(final_stats.pool.in_use, 0);
}

#[test]
#[serial]
fn test_missing_gyro_emits_degraded_after_timeout() {
    let manager = ManagerBuilder::new()
        .connector(MockConnector::new())
        .fusion_timeout(Duration::from_millis(50))
        .build()
        .unwrap();
    let (consumer, collected) = collector();
    manager.add_consumer(consumer);
    let device = manager.connector().device(&id("left"));
    manager.start(vec![endpoint("left")]).unwrap();
    assert!(wait_until(Duration::from_secs(2), || device.is_connected()));

    let sent = Instant::now();
    device.send(&message(device.id(), Channel::Accel, unix_time_ns()));
    assert!(wait_until(Duration::from_secs(2), || count(&collected, "left") == 1));
    assert!(sent.elapsed() >= Duration::from_millis(50));

    let record = manager.get_latest("left").unwrap();
    assert!(record.has_accel());
    assert!(!record.has_gyro());
    assert_eq!(record.gyro, Vec3::ZERO);
    manager.stop().unwrap();
}

/// 断线、拒绝两次重连后先补发 3 对旧数据，再继续发送新数据
fn reconnect_with_replay(mode: TimestampMode, base: u64) -> Vec<SampleRecord> {
    let manager = ManagerBuilder::new()
        .connector(MockConnector::new())
        .backoff(Duration::from_millis(100), Duration::from_millis(200))
        .timestamp_mode(mode)
        .build()
        .unwrap();
    let (consumer, collected) = collector();
    manager.add_consumer(consumer);
    let device = manager.connector().device(&id("left"));
    manager.start(vec![endpoint("left")]).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        manager.connection_state("left") == Some(ConnectionState::Streaming)
    }));

    let ms = 1_000_000;
    for i in 0..10 {
        send_pair(&device, base + i * 10 * ms);
    }
    assert!(wait_until(Duration::from_secs(2), || count(&collected, "left") == 10));

    device.refuse_next(2);
    device.disconnect();
    assert!(wait_until(Duration::from_secs(3), || device.connect_count() >= 2));
    assert!(wait_until(Duration::from_secs(3), || {
        manager.connection_state("left") == Some(ConnectionState::Streaming)
    }));

    for i in 0..3 {
        send_pair(&device, base + i * 10 * ms);
    }
    for i in 10..20 {
        send_pair(&device, base + i * 10 * ms);
    }
    assert!(wait_until(Duration::from_secs(2), || count(&collected, "left") == 20));
    manager.flush().unwrap();

    let stats = manager.get_stats();
    let device_stats = stats.device("left").unwrap();
    assert_eq!(device_stats.state, ConnectionState::Streaming);
    assert_eq!(device_stats.out_of_order_drops, 3);
    assert!(device_stats.reconnects >= 3);

    let states: Vec<ConnectionState> = device_stats.transitions.iter().map(|t| t.to).collect();
    let reconnecting = states
        .iter()
        .position(|s| *s == ConnectionState::Reconnecting)
        .unwrap();
    assert!(states[reconnecting..].contains(&ConnectionState::Streaming));

    manager.stop().unwrap();
    let records = collected.lock().remove("left").unwrap();
    assert_eq!(records.len(), 20);
    assert_ordered(&records);
    records
}

#[test]
#[serial]
fn test_reconnect_keeps_order() {
    let base = unix_time_ns();
    let records = reconnect_with_replay(TimestampMode::Passthrough, base);
    assert_eq!(records[0].timestamp_ns, base + 2_000_000);
}

#[test]
#[serial]
fn test_reconnect_drops_replay_with_normalized_timestamps() {
    // 设备时钟与主机时钟无关（开机后计时）
    let records = reconnect_with_replay(TimestampMode::Normalized, 5_000_000_000);

    // 重连后设备端间隔保持不变，没有整体平移到重连时刻
    let ms = 1_000_000;
    for pair in records.windows(2) {
        assert_eq!(pair[1].timestamp_ns - pair[0].timestamp_ns, 10 * ms);
    }
}

#[test]
#[serial]
fn test_interleaved_channels_delivered_in_order() {
    let manager = ManagerBuilder::new()
        .connector(MockConnector::new())
        .timestamp_mode(TimestampMode::Passthrough)
        .build()
        .unwrap();
    let (consumer, collected) = collector();
    manager.add_consumer(consumer);
    let device = manager.connector().device(&id("left"));
    manager.start(vec![endpoint("left")]).unwrap();

    let base = unix_time_ns();
    let ms = 1_000_000;
    // 陀螺仪先到，加速度计滞后一个周期
    for i in 0..50u64 {
        let ts = base + i * 10 * ms;
        device.send(&message(device.id(), Channel::Gyro, ts + 3 * ms));
        if i > 0 {
            device.send(&message(device.id(), Channel::Accel, ts - 10 * ms));
        }
    }
    device.send(&message(device.id(), Channel::Accel, base + 490 * ms));

    assert!(wait_until(Duration::from_secs(2), || count(&collected, "left") >= 50));
    manager.flush().unwrap();
    manager.stop().unwrap();

    let records = collected.lock().remove("left").unwrap();
    assert_ordered(&records);
    assert!(records.windows(2).all(|w| w[1].sequence == w[0].sequence + 1));
}

#[test]
#[serial]
fn test_export_window_returns_recent_rows() {
    let manager = ManagerBuilder::new()
        .connector(MockConnector::new())
        .history_capacity(50)
        .build()
        .unwrap();
    let device = manager.connector().device(&id("left"));
    manager.start(vec![endpoint("left")]).unwrap();

    let base = unix_time_ns();
    for i in 0..80 {
        send_pair(&device, base + i * 10_000_000);
    }
    assert!(wait_until(Duration::from_secs(2), || {
        manager
            .get_stats()
            .device("left")
            .is_some_and(|d| d.records_delivered == 80)
    }));
    manager.flush().unwrap();

    assert_eq!(manager.export_window("left", 1000).len(), 50);
    let rows = manager.export_window("left", 20);
    assert_eq!(rows.len(), 20);
    assert!(rows.iter().all(|r| r.device_id == "left" && r.mag_x.is_none()));
    assert!(rows.windows(2).all(|w| w[0].timestamp_ns <= w[1].timestamp_ns));
    assert_eq!(
        rows.last().map(|r| r.timestamp_ns),
        manager.get_latest("left").map(|r| r.timestamp_ns)
    );
    assert!(manager.export_window("unknown", 10).is_empty());

    manager.stop().unwrap();
    assert!(manager.export_window("left", 10).is_empty());
}

#[test]
#[serial]
fn test_channel_consumer_forwards_batches() {
    let (consumer, rx) = ChannelConsumer::new(64);
    let consumer = Arc::new(consumer);
    let manager = ManagerBuilder::new()
        .connector(MockConnector::new())
        .consumer(consumer.clone())
        .build()
        .unwrap();
    let device = manager.connector().device(&id("left"));
    manager.start(vec![endpoint("left")]).unwrap();

    let base = unix_time_ns();
    for i in 0..30 {
        send_pair(&device, base + i * 10_000_000);
    }

    let mut received = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(2);
    while received.len() < 30 && Instant::now() < deadline {
        if let Ok(batch) = rx.recv_timeout(Duration::from_millis(50)) {
            assert_eq!(batch.device_id.as_str(), "left");
            received.extend(batch.records);
        }
    }
    manager.stop().unwrap();

    assert_eq!(received.len(), 30);
    assert_eq!(consumer.forwarded_count(), 30);
    assert_eq!(consumer.dropped_count(), 0);
    assert_ordered(&received);
}

#[test]
#[serial]
fn test_failing_consumer_does_not_block_others() {
    let manager = ManagerBuilder::new()
        .connector(MockConnector::new())
        .build()
        .unwrap();
    manager.add_consumer(Arc::new(FnConsumer::new(|_: &DeviceId, _: &[SampleRecord]| {
        panic!("consumer bug")
    })));
    manager.add_consumer(Arc::new(FnConsumer::new(|_: &DeviceId, _: &[SampleRecord]| {
        Err(ConsumerError::other("disk full"))
    })));
    let (consumer, collected) = collector();
    manager.add_consumer(consumer);

    let device = manager.connector().device(&id("left"));
    manager.start(vec![endpoint("left")]).unwrap();
    let base = unix_time_ns();
    for i in 0..10 {
        send_pair(&device, base + i * 10_000_000);
    }
    assert!(wait_until(Duration::from_secs(2), || count(&collected, "left") == 10));

    let stats = manager.stop().unwrap();
    assert!(stats.consumer_failures >= 2);
    assert_eq!(stats.pool.in_use, 0);
}

#[test]
#[serial]
fn test_simulator_over_tcp() {
    let mut config = SimConfig::new(id("sim"));
    config.with_mag = true;
    let server = SimServer::spawn("127.0.0.1:0", config).unwrap();

    let manager = ManagerBuilder::new().build().unwrap();
    let (consumer, collected) = collector();
    manager.add_consumer(consumer);
    manager
        .start(vec![DeviceEndpoint::tcp(id("sim"), server.local_addr().to_string())])
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || count(&collected, "sim") >= 20));
    let stats = manager.stop().unwrap();
    server.stop();

    let device = stats.device("sim").unwrap();
    assert_eq!(device.decode_errors, 0);
    assert!(device.fused_records >= 20);

    let records = collected.lock().remove("sim").unwrap();
    assert_ordered(&records);
    assert!(records.windows(2).all(|w| w[1].sequence > w[0].sequence));
}

#[test]
#[serial]
fn test_simulated_watch_over_websocket() {
    let config = SimConfig {
        transport: imu_sdk::transport::TransportKind::Ws,
        ..SimConfig::new(id("left_watch"))
    };
    let server = SimServer::spawn("127.0.0.1:0", config).unwrap();

    let manager = ManagerBuilder::new().build().unwrap();
    let (consumer, collected) = collector();
    manager.add_consumer(consumer);
    let endpoint: DeviceEndpoint = format!("left_watch={}/ws", server.local_addr())
        .parse()
        .unwrap();
    manager.start(vec![endpoint]).unwrap();

    assert!(wait_until(Duration::from_secs(5), || count(&collected, "left_watch") >= 20));
    let stats = manager.stop().unwrap();
    server.stop();

    let device = stats.device("left_watch").unwrap();
    assert_eq!(device.decode_errors, 0);
    assert_eq!(device.foreign_messages, 0);
    assert!(device.fused_records >= 20);

    let records = collected.lock().remove("left_watch").unwrap();
    assert_ordered(&records);
    assert!(records.iter().all(|r| r.device_id == "left_watch"));
}
