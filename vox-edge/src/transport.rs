//! Broker link: one background task owns the socket, the durable subscription set and the
//! reconnect loop. Callers talk to it through channels.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use vox_core::mqtt::{self, Connect, Packet, Publish, QoS};
use vox_core::Backoff;

/// Any duplex byte stream the link can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxStream = Box<dyn AsyncStream>;
pub type DialFuture<'a> = Pin<Box<dyn Future<Output = io::Result<BoxStream>> + Send + 'a>>;

/// Opens a fresh stream to the broker; called once per connection attempt.
pub trait Dialer: Send + Sync + 'static {
    fn dial(&self) -> DialFuture<'_>;
    fn describe(&self) -> String;
}

const PUBLISH_ENQUEUE_TIMEOUT: Duration = Duration::from_secs(1);
const REQUEST_CAPACITY: usize = 64;
const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Zero disables keep-alive pings.
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub inbound_capacity: usize,
    pub backoff_unit: Duration,
    pub backoff_max_units: u32,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            client_id: "ultra96".into(),
            username: None,
            password: None,
            keep_alive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            inbound_capacity: 64,
            backoff_unit: Duration::from_secs(1),
            backoff_max_units: vox_core::backoff::DEFAULT_MAX_UNITS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
}

/// One message received on a subscribed topic.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: std::time::Instant,
    pub received_wall: SystemTime,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("not connected to broker")]
    NotConnected,
    #[error("outbound queue full")]
    Busy,
    #[error("link task has stopped")]
    Closed,
    #[error("broker refused connection: {0}")]
    Refused(&'static str),
    #[error("broker did not answer CONNECT within {0:?}")]
    ConnectTimeout(Duration),
    #[error("keep-alive ping unanswered")]
    KeepAlive,
    #[error("connection closed by broker")]
    Eof,
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("encode: {0}")]
    Encode(#[from] mqtt::EncodeError),
    #[error("decode: {0}")]
    Decode(#[from] mqtt::DecodeError),
}

enum Request {
    Publish { topic: String, payload: Vec<u8> },
    Subscribe(String),
}

/// Handle to the background link. Cheap operations only; all socket work happens in the task.
pub struct TransportClient {
    requests: mpsc::Sender<Request>,
    state: watch::Receiver<LinkState>,
    stop: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TransportClient {
    /// Spawn the link task and return immediately. The first connection attempt, and every
    /// reconnect, happen in the background.
    pub fn start(
        dialer: std::sync::Arc<dyn Dialer>,
        options: TransportOptions,
    ) -> (Self, mpsc::Receiver<Inbound>) {
        let (req_tx, req_rx) = mpsc::channel(REQUEST_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel(options.inbound_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(LinkState::Connecting);
        let (stop_tx, stop_rx) = watch::channel(false);
        let link = Link {
            dialer,
            options,
            requests: req_rx,
            inbound: in_tx,
            state: state_tx,
            stop: stop_rx,
            topics: Vec::new(),
            next_packet_id: 0,
        };
        let task = tokio::spawn(link.run());
        let client = Self {
            requests: req_tx,
            state: state_rx,
            stop: stop_tx,
            task: Mutex::new(Some(task)),
        };
        (client, in_rx)
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }

    /// Add a topic to the durable subscription set. Sent now if connected, and re-sent after
    /// every reconnect.
    pub async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.requests
            .send(Request::Subscribe(topic.to_string()))
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Queue a QoS 0 publish. Fails fast while the link is down; waits at most one second for
    /// queue space.
    ///
    /// `Ok` means queued, not delivered. If the link drops after the state check, the link task
    /// discards the queued message with a warning and the caller is not told.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.state() != LinkState::Connected {
            warn!(topic, "failed to send message: not connected");
            return Err(TransportError::NotConnected);
        }
        let req = Request::Publish {
            topic: topic.to_string(),
            payload,
        };
        match self.requests.send_timeout(req, PUBLISH_ENQUEUE_TIMEOUT).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                warn!(topic, "failed to send message: outbound queue full");
                Err(TransportError::Busy)
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                warn!(topic, "failed to send message: link stopped");
                Err(TransportError::Closed)
            }
        }
    }

    /// Intentional disconnect: stops any reconnect loop, sends DISCONNECT if connected and
    /// waits for the link task to finish.
    pub async fn disconnect(&self) {
        self.stop.send_replace(true);
        let task = match self.task.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "link task panicked");
            }
        }
        info!("disconnected from broker");
    }
}

/// Why a connected session ended.
enum SessionEnd {
    Stopped,
    Lost(TransportError),
}

struct Connection {
    stream: BoxStream,
    buf: Vec<u8>,
}

struct Link {
    dialer: std::sync::Arc<dyn Dialer>,
    options: TransportOptions,
    requests: mpsc::Receiver<Request>,
    inbound: mpsc::Sender<Inbound>,
    state: watch::Sender<LinkState>,
    stop: watch::Receiver<bool>,
    /// Durable subscription set; survives reconnects.
    topics: Vec<String>,
    next_packet_id: u16,
}

impl Link {
    async fn run(mut self) {
        let mut backoff = Backoff::new(self.options.backoff_unit, self.options.backoff_max_units);
        let target = self.dialer.describe();
        loop {
            if self.stopping() {
                break;
            }
            let mut stop = self.stop.clone();
            let attempt = tokio::select! {
                r = self.establish() => Some(r),
                _ = wait_stop(&mut stop) => None,
            };
            match attempt {
                None => break,
                Some(Ok(conn)) => {
                    backoff.reset();
                    self.state.send_replace(LinkState::Connected);
                    info!(broker = %target, "connected to broker");
                    match self.drive(conn).await {
                        SessionEnd::Stopped => break,
                        SessionEnd::Lost(e) => warn!(error = %e, "connection lost"),
                    }
                }
                Some(Err(e)) => {
                    warn!(broker = %target, error = %e, attempt = backoff.attempts() + 1, "connect failed")
                }
            }
            self.state.send_replace(LinkState::Reconnecting);
            let delay = backoff.next_delay();
            info!(?delay, attempt = backoff.attempts(), "reconnecting after backoff");
            if !self.wait_backoff(delay).await {
                break;
            }
        }
        self.state.send_replace(LinkState::Disconnected);
    }

    fn stopping(&self) -> bool {
        *self.stop.borrow()
    }

    fn packet_id(&mut self) -> u16 {
        self.next_packet_id = self.next_packet_id.checked_add(1).unwrap_or(1);
        self.next_packet_id
    }

    /// Sleep `delay`, absorbing requests. Returns false if stopped or the client is gone.
    async fn wait_backoff(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                _ = wait_stop(&mut self.stop) => return false,
                req = self.requests.recv() => match req {
                    None => return false,
                    Some(Request::Subscribe(topic)) => {
                        self.remember(topic);
                    }
                    Some(Request::Publish { topic, .. }) => {
                        warn!(topic, "failed to send message: link down");
                    }
                },
            }
        }
    }

    /// Add to the durable set; true if it was new.
    fn remember(&mut self, topic: String) -> bool {
        if self.topics.contains(&topic) {
            return false;
        }
        self.topics.push(topic);
        true
    }

    /// Dial, CONNECT, wait for CONNACK, then re-subscribe every durable topic in one packet.
    async fn establish(&mut self) -> Result<Connection, TransportError> {
        let limit = self.options.connect_timeout;
        let mut conn = tokio::time::timeout(limit, self.handshake())
            .await
            .map_err(|_| TransportError::ConnectTimeout(limit))??;
        if !self.topics.is_empty() {
            let packet = Packet::Subscribe {
                packet_id: self.packet_id(),
                topics: self
                    .topics
                    .iter()
                    .map(|t| (t.clone(), QoS::AtMostOnce))
                    .collect(),
            };
            write_packet(&mut conn.stream, &packet).await?;
            info!(topics = ?self.topics, "subscriptions restored");
        }
        Ok(conn)
    }

    async fn handshake(&self) -> Result<Connection, TransportError> {
        let mut stream = self.dialer.dial().await?;
        let o = &self.options;
        let connect = Packet::Connect(Connect {
            client_id: o.client_id.clone(),
            keep_alive_secs: u16::try_from(o.keep_alive.as_secs()).unwrap_or(u16::MAX),
            clean_session: true,
            username: o.username.clone(),
            password: o.password.as_ref().map(|p| p.as_bytes().to_vec()),
        });
        write_packet(&mut stream, &connect).await?;
        let mut conn = Connection {
            stream,
            buf: Vec::new(),
        };
        match read_packet(&mut conn).await? {
            Packet::ConnAck { code: 0, .. } => Ok(conn),
            Packet::ConnAck { code, .. } => Err(TransportError::Refused(mqtt::connack_reason(code))),
            other => {
                debug!(?other, "unexpected packet before CONNACK");
                Err(TransportError::Decode(mqtt::DecodeError::Malformed(
                    "expected CONNACK",
                )))
            }
        }
    }

    /// Run one connected session until the link is lost or a stop is requested.
    async fn drive(&mut self, conn: Connection) -> SessionEnd {
        let Connection { stream, mut buf } = conn;
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut ping = keep_alive_interval(self.options.keep_alive);
        let mut ping_outstanding = false;
        let mut chunk = vec![0u8; READ_CHUNK];

        loop {
            // Drain complete packets already buffered (including any left over from CONNACK).
            loop {
                match mqtt::decode_packet(&buf) {
                    Ok((packet, used)) => {
                        buf.drain(..used);
                        if let Err(e) = self.on_packet(packet, &mut writer, &mut ping_outstanding).await {
                            return SessionEnd::Lost(e);
                        }
                    }
                    Err(mqtt::DecodeError::NeedMore) => break,
                    Err(e) => return SessionEnd::Lost(e.into()),
                }
            }

            tokio::select! {
                _ = wait_stop(&mut self.stop) => {
                    if let Err(e) = write_packet(&mut writer, &Packet::Disconnect).await {
                        debug!(error = %e, "DISCONNECT not delivered");
                    }
                    let _ = writer.shutdown().await;
                    return SessionEnd::Stopped;
                }
                read = reader.read(&mut chunk) => match read {
                    Ok(0) => return SessionEnd::Lost(TransportError::Eof),
                    Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    Err(e) => return SessionEnd::Lost(e.into()),
                },
                _ = next_ping(ping.as_mut()) => {
                    if ping_outstanding {
                        return SessionEnd::Lost(TransportError::KeepAlive);
                    }
                    if let Err(e) = write_packet(&mut writer, &Packet::PingReq).await {
                        return SessionEnd::Lost(e);
                    }
                    ping_outstanding = true;
                }
                req = self.requests.recv() => {
                    let Some(req) = req else {
                        // Every client handle dropped: leave cleanly.
                        let _ = write_packet(&mut writer, &Packet::Disconnect).await;
                        return SessionEnd::Stopped;
                    };
                    if let Err(e) = self.on_request(req, &mut writer).await {
                        return SessionEnd::Lost(e);
                    }
                }
            }
        }
    }

    async fn on_request<W: AsyncWrite + Unpin>(
        &mut self,
        req: Request,
        writer: &mut W,
    ) -> Result<(), TransportError> {
        match req {
            Request::Publish { topic, payload } => {
                let packet = Packet::Publish(Publish {
                    topic: topic.clone(),
                    qos: QoS::AtMostOnce,
                    retain: false,
                    dup: false,
                    packet_id: None,
                    payload,
                });
                match write_packet(writer, &packet).await {
                    Ok(()) => {
                        info!(topic, "message sent");
                        Ok(())
                    }
                    Err(e) => {
                        warn!(topic, error = %e, "failed to send message");
                        Err(e)
                    }
                }
            }
            Request::Subscribe(topic) => {
                if !self.remember(topic.clone()) {
                    return Ok(());
                }
                let packet = Packet::Subscribe {
                    packet_id: self.packet_id(),
                    topics: vec![(topic.clone(), QoS::AtMostOnce)],
                };
                write_packet(writer, &packet).await?;
                info!(topic, "subscribed");
                Ok(())
            }
        }
    }

    async fn on_packet<W: AsyncWrite + Unpin>(
        &mut self,
        packet: Packet,
        writer: &mut W,
        ping_outstanding: &mut bool,
    ) -> Result<(), TransportError> {
        match packet {
            Packet::Publish(p) => {
                if let (QoS::AtLeastOnce, Some(packet_id)) = (p.qos, p.packet_id) {
                    write_packet(writer, &Packet::PubAck { packet_id }).await?;
                }
                debug!(topic = %p.topic, bytes = p.payload.len(), "message received");
                let msg = Inbound {
                    topic: p.topic,
                    payload: p.payload,
                    received_at: Instant::now().into_std(),
                    received_wall: SystemTime::now(),
                };
                if self.inbound.send(msg).await.is_err() {
                    debug!("inbound receiver dropped; message discarded");
                }
            }
            Packet::PingResp => *ping_outstanding = false,
            Packet::SubAck {
                packet_id,
                return_codes,
            } => {
                if return_codes.contains(&mqtt::SUBACK_FAILURE) {
                    warn!(packet_id, ?return_codes, "broker refused a subscription");
                } else {
                    debug!(packet_id, "subscription acknowledged");
                }
            }
            Packet::PubAck { packet_id } => debug!(packet_id, "publish acknowledged"),
            Packet::Disconnect => return Err(TransportError::Eof),
            Packet::Unsupported { kind } => warn!(kind, "skipping unsupported packet"),
            other => debug!(?other, "ignoring unexpected packet"),
        }
        Ok(())
    }
}

async fn wait_stop(stop: &mut watch::Receiver<bool>) {
    // A dropped sender means the client is gone; treat it as a stop.
    let _ = stop.wait_for(|s| *s).await;
}

fn keep_alive_interval(period: Duration) -> Option<Interval> {
    if period.is_zero() {
        return None;
    }
    let mut i = tokio::time::interval_at(Instant::now() + period, period);
    i.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(i)
}

async fn next_ping(interval: Option<&mut Interval>) {
    match interval {
        Some(i) => {
            i.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn write_packet<W: AsyncWrite + Unpin + ?Sized>(
    writer: &mut W,
    packet: &Packet,
) -> Result<(), TransportError> {
    let frame = mqtt::encode_packet(packet)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_packet(conn: &mut Connection) -> Result<Packet, TransportError> {
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        match mqtt::decode_packet(&conn.buf) {
            Ok((packet, used)) => {
                conn.buf.drain(..used);
                return Ok(packet);
            }
            Err(mqtt::DecodeError::NeedMore) => {}
            Err(e) => return Err(e.into()),
        }
        let n = conn.stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(TransportError::Eof);
        }
        conn.buf.extend_from_slice(&chunk[..n]);
    }
}
