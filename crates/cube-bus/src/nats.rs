//! # NATS Transport
//!
//! Minimal client for the NATS text protocol, enough for the node substrate:
//!
//! | Client → Server | Server → Client |
//! |-----------------|-----------------|
//! | `CONNECT {json}` | `INFO {json}` |
//! | `PUB <subj> [reply] <len>` | `MSG <subj> <sid> [reply] <len>` |
//! | `SUB <subj> [queue] <sid>` | `PING` / `PONG` |
//! | `UNSUB <sid>` | `+OK` / `-ERR <msg>` |
//!
//! ## Reconnect
//!
//! Each connection is driven by one supervisor task that writes queued
//! frames, routes `MSG` frames to subscriptions and answers `PING`. When the
//! socket drops, the supervisor reconnects, replays a `SUB` for every live
//! subscription (same sid) and then flushes what was queued in between.
//! After `max_reconnects` failed attempts in a row the connection closes and
//! its subscriptions end.
//!
//! Payload sizes are checked against the `max_payload` the server announces
//! in `INFO`, in both directions.

use crate::connection::{BusConnection, BusConnector, BusSubscription, Delivery};
use crate::subject::{new_inbox, validate_subject};
use crate::BusError;
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const CRLF: &[u8] = b"\r\n";
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_MAX_RECONNECTS: usize = 60;
const DEFAULT_RECONNECT_WAIT: Duration = Duration::from_secs(2);
/// Used until the server announces its own limit.
const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;
/// Outgoing bytes allowed to queue up, mostly while reconnecting.
const PENDING_LIMIT: usize = 8 * 1024 * 1024;
/// Largest protocol line accepted from the server. `INFO` from a clustered
/// server lists every connect URL.
const MAX_CONTROL_LINE: usize = 64 * 1024;

#[derive(Serialize)]
struct ConnectOptions<'a> {
    verbose: bool,
    pedantic: bool,
    name: &'a str,
    lang: &'a str,
    version: &'a str,
    protocol: u8,
    headers: bool,
}

/// Fields of the server `INFO` we care about.
#[derive(Debug, Default, Deserialize)]
struct ServerInfo {
    #[serde(default)]
    server_id: String,
    #[serde(default)]
    max_payload: Option<usize>,
}

fn parse_info(line: &str) -> Result<ServerInfo, BusError> {
    let json = line
        .strip_prefix("INFO")
        .map(str::trim)
        .ok_or_else(|| BusError::Protocol(format!("expected INFO, got {line:?}")))?;
    serde_json::from_str(json).map_err(|e| BusError::Protocol(format!("bad INFO: {e}")))
}

/// Opens TCP connections to a NATS server.
#[derive(Debug, Clone)]
pub struct NatsConnector {
    host: String,
    port: u16,
    client_name: String,
    connect_timeout: Duration,
    max_reconnects: usize,
    reconnect_wait: Duration,
}

impl NatsConnector {
    /// Connector for `host:port`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            client_name: "cube".to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_reconnects: DEFAULT_MAX_RECONNECTS,
            reconnect_wait: DEFAULT_RECONNECT_WAIT,
        }
    }

    /// Parse a `nats://host:port` address.
    pub fn from_address(address: &str) -> Result<Self, BusError> {
        let invalid = |reason: &str| BusError::Connect {
            address: address.to_string(),
            reason: reason.to_string(),
        };

        let rest = address
            .strip_prefix("nats://")
            .ok_or_else(|| invalid("expected nats:// scheme"))?;
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| invalid("missing port"))?;
        let port = port.parse::<u16>().map_err(|_| invalid("invalid port"))?;
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        Ok(Self::new(host, port))
    }

    /// Name announced to the server in `CONNECT`.
    #[must_use]
    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = name.into();
        self
    }

    /// Bound on TCP connect plus handshake.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Reconnect attempts after a dropped socket, and the pause between them.
    /// Zero attempts closes the connection on the first drop.
    #[must_use]
    pub fn with_reconnect(mut self, max_reconnects: usize, wait: Duration) -> Self {
        self.max_reconnects = max_reconnects;
        self.reconnect_wait = wait;
        self
    }

    fn connect_error(&self, reason: impl ToString) -> BusError {
        BusError::Connect {
            address: self.address(),
            reason: reason.to_string(),
        }
    }

    async fn open_session(&self) -> Result<Session, BusError> {
        tokio::time::timeout(self.connect_timeout, self.handshake())
            .await
            .map_err(|_| self.connect_error("connect timed out"))?
    }

    async fn handshake(&self) -> Result<Session, BusError> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| self.connect_error(e))?;
        stream.set_nodelay(true)?;

        let (read_half, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let line = read_control_line(&mut reader)
            .await?
            .ok_or_else(|| self.connect_error("server closed connection before INFO"))?;
        let info = parse_info(&line)?;

        let options = ConnectOptions {
            verbose: false,
            pedantic: false,
            name: &self.client_name,
            lang: "rust",
            version: env!("CARGO_PKG_VERSION"),
            protocol: 1,
            headers: false,
        };
        let options = serde_json::to_string(&options)
            .map_err(|e| BusError::Protocol(format!("cannot encode CONNECT: {e}")))?;
        writer
            .write_all(format!("CONNECT {options}\r\nPING\r\n").as_bytes())
            .await?;
        writer.flush().await?;

        // The first PONG confirms the server accepted CONNECT.
        loop {
            let line = read_control_line(&mut reader)
                .await?
                .ok_or_else(|| self.connect_error("server closed connection during handshake"))?;
            match line.as_str() {
                "PONG" => break,
                "PING" => writer.write_all(b"PONG\r\n").await?,
                other if other.starts_with("-ERR") => {
                    return Err(self.connect_error(other.trim_start_matches("-ERR").trim()));
                }
                _ => {}
            }
        }

        Ok(Session {
            reader,
            writer,
            info,
        })
    }
}

#[async_trait]
impl BusConnector for NatsConnector {
    async fn connect(&self) -> Result<Arc<dyn BusConnection>, BusError> {
        let session = self.open_session().await?;
        info!(
            address = %self.address(),
            server_id = %session.info.server_id,
            "Connected to NATS"
        );

        let (writer, frames) = mpsc::unbounded_channel::<Bytes>();
        let shared = Arc::new(Shared::new(writer));
        let supervisor = tokio::spawn(supervise(
            self.clone(),
            Arc::clone(&shared),
            frames,
            session,
        ));

        Ok(Arc::new(NatsConnection {
            shared,
            tasks: Mutex::new(vec![supervisor]),
        }))
    }

    fn address(&self) -> String {
        format!("nats://{}:{}", self.host, self.port)
    }
}

/// One TCP connection that completed the handshake.
struct Session {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    info: ServerInfo,
}

struct SubscriptionEntry {
    subject: String,
    queue_group: Option<String>,
    sender: mpsc::UnboundedSender<Delivery>,
}

/// State shared by a connection handle and its supervisor; survives
/// reconnects.
struct Shared {
    writer: mpsc::UnboundedSender<Bytes>,
    subscriptions: DashMap<u64, SubscriptionEntry>,
    next_sid: AtomicU64,
    closed: AtomicBool,
    connected: AtomicBool,
    max_payload: AtomicUsize,
    pending: AtomicUsize,
}

impl Shared {
    fn new(writer: mpsc::UnboundedSender<Bytes>) -> Self {
        Self {
            writer,
            subscriptions: DashMap::new(),
            next_sid: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            max_payload: AtomicUsize::new(DEFAULT_MAX_PAYLOAD),
            pending: AtomicUsize::new(0),
        }
    }

    fn send(&self, frame: Bytes) -> Result<(), BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        let len = frame.len();
        if self.pending.fetch_add(len, Ordering::SeqCst) + len > PENDING_LIMIT {
            self.pending.fetch_sub(len, Ordering::SeqCst);
            return Err(BusError::BufferFull {
                limit: PENDING_LIMIT,
            });
        }
        self.writer.send(frame).map_err(|_| {
            self.pending.fetch_sub(len, Ordering::SeqCst);
            BusError::Closed
        })
    }

    fn check_payload(&self, size: usize) -> Result<(), BusError> {
        let max = self.max_payload.load(Ordering::SeqCst);
        if size > max {
            return Err(BusError::PayloadTooLarge { size, max });
        }
        Ok(())
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        // dropping the senders ends every subscription
        self.subscriptions.clear();
    }
}

/// Connection to a NATS server.
pub struct NatsConnection {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NatsConnection {
    /// True while a socket to the server is up. Stays `false` during
    /// reconnect attempts.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn add_subscription(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<BusSubscription, BusError> {
        validate_subject(subject)?;
        if let Some(group) = queue_group {
            validate_subject(group)?;
        }

        let sid = self.shared.next_sid.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        self.shared.subscriptions.insert(
            sid,
            SubscriptionEntry {
                subject: subject.to_string(),
                queue_group: queue_group.map(str::to_string),
                sender,
            },
        );

        if let Err(e) = self.shared.send(sub_frame(subject, queue_group, sid)) {
            self.shared.subscriptions.remove(&sid);
            return Err(e);
        }

        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        Ok(BusSubscription::new(
            subject,
            queue_group.map(str::to_string),
            receiver,
            move || {
                if let Some(shared) = shared.upgrade() {
                    shared.subscriptions.remove(&sid);
                    let _ = shared.send(Bytes::from(format!("UNSUB {sid}\r\n")));
                }
            },
        ))
    }
}

#[async_trait]
impl BusConnection for NatsConnection {
    async fn publish(
        &self,
        subject: &str,
        reply: Option<&str>,
        payload: Bytes,
    ) -> Result<(), BusError> {
        validate_subject(subject)?;
        self.shared.check_payload(payload.len())?;
        self.shared.send(encode_pub(subject, reply, &payload))
    }

    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<BusSubscription, BusError> {
        self.add_subscription(subject, queue_group)
    }

    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Delivery, BusError> {
        validate_subject(subject)?;
        self.shared.check_payload(payload.len())?;
        let inbox = new_inbox();
        let mut replies = self.add_subscription(&inbox, None)?;
        self.shared.send(encode_pub(subject, Some(&inbox), &payload))?;

        match tokio::time::timeout(timeout, replies.next_delivery()).await {
            Ok(Some(delivery)) => Ok(delivery),
            Ok(None) => Err(BusError::Closed),
            Err(_) => Err(BusError::Timeout),
        }
    }

    async fn close(&self) {
        self.shared.mark_closed();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        debug!("NATS connection closed");
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

impl Drop for NatsConnection {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

/// Drive sessions until the connection is closed or reconnecting gives up.
async fn supervise(
    connector: NatsConnector,
    shared: Arc<Shared>,
    mut frames: mpsc::UnboundedReceiver<Bytes>,
    mut session: Session,
) {
    loop {
        let reason = drive_session(&shared, &mut frames, session).await;
        shared.connected.store(false, Ordering::SeqCst);
        if shared.closed.load(Ordering::SeqCst) {
            break;
        }

        warn!(address = %connector.address(), reason = %reason, "NATS connection lost");
        match reconnect(&connector, &shared).await {
            Some(next) => session = next,
            None => break,
        }
    }
    shared.mark_closed();
    debug!("NATS supervisor stopped");
}

async fn reconnect(connector: &NatsConnector, shared: &Shared) -> Option<Session> {
    for attempt in 1..=connector.max_reconnects {
        if shared.closed.load(Ordering::SeqCst) {
            return None;
        }
        match connector.open_session().await {
            Ok(session) => {
                info!(address = %connector.address(), attempt, "Reconnected to NATS");
                return Some(session);
            }
            Err(e) => debug!(attempt, error = %e, "NATS reconnect attempt failed"),
        }
        tokio::time::sleep(connector.reconnect_wait).await;
    }
    warn!(
        address = %connector.address(),
        attempts = connector.max_reconnects,
        "Giving up on NATS reconnect"
    );
    None
}

/// Run one session; returns why it ended.
async fn drive_session(
    shared: &Shared,
    frames: &mut mpsc::UnboundedReceiver<Bytes>,
    session: Session,
) -> String {
    let Session {
        mut reader,
        mut writer,
        info,
    } = session;
    if let Some(max) = info.max_payload {
        shared.max_payload.store(max, Ordering::SeqCst);
    }

    if let Err(e) = replay_subscriptions(shared, &mut writer).await {
        return format!("replaying subscriptions failed: {e}");
    }
    shared.connected.store(true, Ordering::SeqCst);

    tokio::select! {
        reason = read_loop(&mut reader, shared) => reason,
        reason = write_loop(&mut writer, frames, shared) => reason,
    }
}

/// Re-issue `SUB` for every live subscription, keeping its sid.
async fn replay_subscriptions<W>(shared: &Shared, writer: &mut W) -> Result<(), BusError>
where
    W: AsyncWrite + Unpin,
{
    let frames: Vec<Bytes> = shared
        .subscriptions
        .iter()
        .map(|entry| sub_frame(&entry.subject, entry.queue_group.as_deref(), *entry.key()))
        .collect();
    for frame in &frames {
        writer.write_all(frame).await?;
    }
    writer.flush().await?;
    if !frames.is_empty() {
        debug!(count = frames.len(), "Replayed NATS subscriptions");
    }
    Ok(())
}

async fn write_loop<W>(
    writer: &mut W,
    frames: &mut mpsc::UnboundedReceiver<Bytes>,
    shared: &Shared,
) -> String
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = frames.recv().await {
        shared.pending.fetch_sub(frame.len(), Ordering::SeqCst);
        if let Err(e) = writer.write_all(&frame).await {
            return format!("write failed: {e}");
        }
        if frames.is_empty() {
            if let Err(e) = writer.flush().await {
                return format!("flush failed: {e}");
            }
        }
    }
    "outgoing queue closed".to_string()
}

async fn read_loop<R>(reader: &mut BufReader<R>, shared: &Shared) -> String
where
    R: AsyncRead + Unpin,
{
    loop {
        let line = match read_control_line(reader).await {
            Ok(Some(line)) => line,
            Ok(None) => return "server closed the connection".to_string(),
            Err(e) => return format!("read failed: {e}"),
        };

        if let Some(args) = line.strip_prefix("MSG ") {
            let header = match parse_msg_line(args) {
                Ok(header) => header,
                Err(e) => return e.to_string(),
            };
            let max = shared.max_payload.load(Ordering::SeqCst);
            if header.len > max {
                return BusError::PayloadTooLarge {
                    size: header.len,
                    max,
                }
                .to_string();
            }

            let mut payload = vec![0u8; header.len + CRLF.len()];
            if let Err(e) = reader.read_exact(&mut payload).await {
                return format!("payload read failed: {e}");
            }
            payload.truncate(header.len);

            if let Some(entry) = shared.subscriptions.get(&header.sid) {
                let _ = entry.sender.send(Delivery {
                    subject: header.subject,
                    reply: header.reply,
                    payload: Bytes::from(payload),
                });
            }
        } else if line == "PING" {
            let _ = shared.send(Bytes::from_static(b"PONG\r\n"));
        } else if line.starts_with("INFO") {
            match parse_info(&line) {
                Ok(ServerInfo {
                    max_payload: Some(max),
                    ..
                }) => shared.max_payload.store(max, Ordering::SeqCst),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Ignoring NATS INFO update"),
            }
        } else if let Some(message) = line.strip_prefix("-ERR") {
            warn!(error = message.trim(), "NATS server error");
        }
        // PONG and +OK need no action
    }
}

fn sub_frame(subject: &str, queue_group: Option<&str>, sid: u64) -> Bytes {
    match queue_group {
        Some(group) => Bytes::from(format!("SUB {subject} {group} {sid}\r\n")),
        None => Bytes::from(format!("SUB {subject} {sid}\r\n")),
    }
}

fn encode_pub(subject: &str, reply: Option<&str>, payload: &[u8]) -> Bytes {
    let header = match reply {
        Some(reply) => format!("PUB {subject} {reply} {}\r\n", payload.len()),
        None => format!("PUB {subject} {}\r\n", payload.len()),
    };
    let mut frame = BytesMut::with_capacity(header.len() + payload.len() + CRLF.len());
    frame.put_slice(header.as_bytes());
    frame.put_slice(payload);
    frame.put_slice(CRLF);
    frame.freeze()
}

/// Parsed `MSG` control line.
#[derive(Debug, PartialEq, Eq)]
struct MsgHeader {
    subject: String,
    sid: u64,
    reply: Option<String>,
    len: usize,
}

fn parse_msg_line(args: &str) -> Result<MsgHeader, BusError> {
    let parts: Vec<&str> = args.split_whitespace().collect();
    let (subject, sid, reply, len) = match parts.as_slice() {
        [subject, sid, len] => (*subject, *sid, None, *len),
        [subject, sid, reply, len] => (*subject, *sid, Some(*reply), *len),
        _ => return Err(BusError::Protocol(format!("malformed MSG: {args:?}"))),
    };
    Ok(MsgHeader {
        subject: subject.to_string(),
        sid: sid
            .parse()
            .map_err(|_| BusError::Protocol(format!("bad sid in MSG: {sid:?}")))?,
        reply: reply.map(str::to_string),
        len: len
            .parse()
            .map_err(|_| BusError::Protocol(format!("bad length in MSG: {len:?}")))?,
    })
}

async fn read_control_line<R>(reader: &mut BufReader<R>) -> Result<Option<String>, BusError>
where
    R: AsyncRead + Unpin,
{
    let mut line = String::new();
    let read = (&mut *reader)
        .take(MAX_CONTROL_LINE as u64)
        .read_line(&mut line)
        .await?;
    if read == 0 {
        return Ok(None);
    }
    if !line.ends_with('\n') {
        return Err(BusError::Protocol("control line too long".into()));
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}
