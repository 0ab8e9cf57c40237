//! 设备仿真
//!
//! `SampleGenerator` 以固定速率生成加速度计/陀螺仪（可选磁力计）消息，
//! `SimServer` 向连入的客户端推送 JSON 消息：WebSocket 每帧一条（与手表端相同，
//! 路径 `/imu`），或 TCP 按行分隔。

use crate::TransportKind;
use crate::ws::WS_PATH;
use imu_protocol::{Channel, DeviceId, Vec3, WireMessage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::borrow::Cow;
use std::f64::consts::TAU;
use std::io::{self, BufWriter, ErrorKind, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::{Message, WebSocket};

/// 当前 Unix 时间（纳秒）
pub fn unix_time_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// 仿真设备参数
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub device_id: DeviceId,
    /// 每个通道的采样率
    pub rate_hz: f64,
    /// 是否发送磁力计
    pub with_mag: bool,
    /// 陀螺仪相对加速度计的时间偏移
    pub gyro_skew: Duration,
    /// 各轴噪声幅度
    pub noise: f64,
    pub seed: u64,
    /// 服务协议（`Tcp` 或 `Ws`）
    pub transport: TransportKind,
}

impl SimConfig {
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            rate_hz: 100.0,
            with_mag: false,
            gyro_skew: Duration::from_millis(2),
            noise: 0.02,
            seed: 0,
            transport: TransportKind::Tcp,
        }
    }
}

/// 稳定速率采样生成器
pub struct SampleGenerator {
    config: SimConfig,
    rng: StdRng,
    index: u64,
}

impl SampleGenerator {
    pub fn new(config: SimConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            rng,
            index: 0,
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// 采样周期
    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.config.rate_hz.max(0.001))
    }

    /// 已生成的采样时刻数
    pub fn ticks(&self) -> u64 {
        self.index
    }

    fn noisy(&mut self, v: Vec3) -> Vec3 {
        let amp = self.config.noise;
        if amp == 0.0 {
            return v;
        }
        let mut jitter = || (self.rng.r#gen::<f64>() * 2.0 - 1.0) * amp;
        Vec3::new(v.x + jitter(), v.y + jitter(), v.z + jitter())
    }

    /// 生成一个采样时刻的所有通道消息
    ///
    /// 加速度计（及磁力计）使用 `timestamp_ns`，陀螺仪偏移 `gyro_skew`。
    pub fn next_messages(&mut self, timestamp_ns: u64) -> Vec<WireMessage<'static>> {
        let t = self.index as f64 / self.config.rate_hz.max(0.001);
        self.index += 1;

        let accel = self.noisy(Vec3::new(
            0.3 * (TAU * 1.5 * t).sin(),
            9.81 + 0.2 * (TAU * 1.5 * t).cos(),
            0.1 * (TAU * 0.5 * t).sin(),
        ));
        let gyro = self.noisy(Vec3::new(
            0.5 * (TAU * t).cos(),
            0.2 * (TAU * t).sin(),
            0.1,
        ));

        let mag = if self.config.with_mag {
            Some(self.noisy(Vec3::new(22.0, -5.0, 40.0)))
        } else {
            None
        };
        let gyro_ts = timestamp_ns + self.config.gyro_skew.as_nanos() as u64;

        let id = self.config.device_id.as_str();
        let message = |channel, timestamp_ns, value| WireMessage {
            device_id: Cow::Owned(id.to_string()),
            channel,
            timestamp_ns,
            value,
        };

        let mut out = Vec::with_capacity(3);
        out.push(message(Channel::Accel, timestamp_ns, accel));
        out.push(message(Channel::Gyro, gyro_ts, gyro));
        if let Some(mag) = mag {
            out.push(message(Channel::Mag, timestamp_ns, mag));
        }
        out
    }
}

/// 仿真服务：每个连入的客户端收到一条独立的采样流
pub struct SimServer {
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    sent: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl SimServer {
    pub fn spawn(bind_address: &str, config: SimConfig) -> io::Result<Self> {
        if config.transport == TransportKind::Udp {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "simulator serves TCP or WebSocket only",
            ));
        }
        let listener = TcpListener::bind(bind_address)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let running = Arc::new(AtomicBool::new(true));
        let sent = Arc::new(AtomicU64::new(0));

        let transport = config.transport;
        let running_clone = running.clone();
        let sent_clone = sent.clone();
        let handle = thread::Builder::new()
            .name(format!("imu-sim-{}", config.device_id))
            .spawn(move || accept_loop(listener, config, running_clone, sent_clone))?;

        info!("Simulated device listening on {} ({})", local_addr, transport);
        Ok(Self {
            local_addr,
            running,
            sent,
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 已发送的消息总数
    pub fn messages_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("Simulator thread panicked");
        }
    }
}

impl Drop for SimServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(
    listener: TcpListener,
    config: SimConfig,
    running: Arc<AtomicBool>,
    sent: Arc<AtomicU64>,
) {
    while running.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                info!("Simulator client connected: {}", peer);
                let mut generator = SampleGenerator::new(config.clone());
                match serve_client(stream, &mut generator, &running, &sent) {
                    Ok(()) => debug!("Simulator session with {} ended", peer),
                    Err(e) => info!("Simulator client {} disconnected: {}", peer, e),
                }
            },
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(10));
            },
            Err(e) => {
                warn!("Simulator accept failed: {}", e);
                thread::sleep(Duration::from_millis(100));
            },
        }
    }
}

/// 按帧写出一批消息
trait FrameSink {
    fn write_frame(&mut self, json: String) -> io::Result<()>;
    fn flush_frames(&mut self) -> io::Result<()>;
}

impl FrameSink for BufWriter<TcpStream> {
    fn write_frame(&mut self, json: String) -> io::Result<()> {
        self.write_all(json.as_bytes())?;
        self.write_all(b"\n")
    }

    fn flush_frames(&mut self) -> io::Result<()> {
        self.flush()
    }
}

impl FrameSink for WebSocket<TcpStream> {
    fn write_frame(&mut self, json: String) -> io::Result<()> {
        self.write(Message::text(json)).map_err(ws_error)
    }

    fn flush_frames(&mut self) -> io::Result<()> {
        self.flush().map_err(ws_error)
    }
}

fn ws_error(e: tungstenite::Error) -> io::Error {
    match e {
        tungstenite::Error::Io(e) => e,
        other => io::Error::other(other.to_string()),
    }
}

fn serve_client(
    stream: TcpStream,
    generator: &mut SampleGenerator,
    running: &AtomicBool,
    sent: &AtomicU64,
) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    match generator.config().transport {
        TransportKind::Ws => {
            // 握手读超时，避免不发请求的客户端卡住服务线程
            stream.set_read_timeout(Some(Duration::from_secs(2)))?;
            let check_path = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                if req.uri().path() != WS_PATH {
                    debug!("Simulator client requested {}", req.uri());
                }
                Ok(resp)
            };
            let mut socket = tungstenite::accept_hdr(stream, check_path)
                .map_err(|e| io::Error::other(e.to_string()))?;
            stream_samples(&mut socket, generator, running, sent)?;
            let _ = socket.close(None);
            let _ = socket.flush();
            Ok(())
        },
        _ => stream_samples(&mut BufWriter::new(stream), generator, running, sent),
    }
}

fn stream_samples(
    sink: &mut impl FrameSink,
    generator: &mut SampleGenerator,
    running: &AtomicBool,
    sent: &AtomicU64,
) -> io::Result<()> {
    let period = generator.period();
    let mut next_tick = Instant::now();

    while running.load(Ordering::Acquire) {
        let messages = generator.next_messages(unix_time_ns());
        for msg in &messages {
            sink.write_frame(msg.encode().map_err(io::Error::other)?)?;
        }
        sink.flush_frames()?;
        sent.fetch_add(messages.len() as u64, Ordering::Relaxed);

        next_tick += period;
        spin_sleep::sleep(next_tick.saturating_duration_since(Instant::now()));
    }
    Ok(())
}
