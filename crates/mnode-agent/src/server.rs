use futures_util::future::{BoxFuture, FutureExt};
use mnode_core::rpc::{
    encode_frame, Envelope, EventPayload, FrameError, LogsPayload, Method, NdjsonFrameDecoder,
    PingPayload, RequestPayload, ResponsePayload, WelcomePayload, WireMsg, CURRENT_PROTOCOL_VERSION,
    DEFAULT_MAX_FRAME_BYTES,
};
use mnode_core::subscription::LogSubscription;
use mnode_core::{Admission, AgentService, ControllerLink};
use serde_json::{json, Value};
use std::{
    collections::{HashMap, VecDeque},
    io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    sync::{mpsc, oneshot, watch},
};
use tracing::{debug, info, warn};

const READ_CHUNK_BYTES: usize = 8 * 1024;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// How long a new connection may stay silent before its hello.
    pub handshake_timeout: Duration,
    pub write_timeout: Duration,
    pub queue_capacity: usize,
    pub debug: bool,
}

type Service = AgentService<TcpLink>;

/// Accepts controller connections until `shutdown` flips, then tears down
/// the active session.
pub async fn run(
    listener: TcpListener,
    service: Arc<Service>,
    config: ServerConfig,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    let next_conn_id = Arc::new(AtomicU64::new(0));
    info!(event = "agent_listen", addr = %listener.local_addr()?);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accept = listener.accept() => {
                match accept {
                    Ok((stream, _addr)) => {
                        let conn_id = next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
                        let service = service.clone();
                        let config = config.clone();
                        tokio::spawn(async move {
                            handle_connection(service, config, stream, conn_id).await;
                        });
                    }
                    Err(err) => {
                        warn!(event = "accept_error", error = %err);
                    }
                }
            }
        }
    }

    service.shutdown().await;
    info!(event = "agent_stop");
    Ok(())
}

/// One controller connection as seen by the session guard.
pub struct TcpLink {
    conn_id: u64,
    peer: Option<String>,
    capabilities: Vec<String>,
    sender: mpsc::Sender<Envelope>,
    pending_pongs: Mutex<HashMap<u64, oneshot::Sender<()>>>,
    next_nonce: AtomicU64,
    closed: watch::Sender<bool>,
}

impl TcpLink {
    /// Queues a frame, waiting for room in the writer queue.
    async fn send(&self, envelope: Envelope) -> bool {
        self.sender.send(envelope).await.is_ok()
    }

    /// Queues a frame without waiting; fails when the queue is full.
    fn push(&self, envelope: Envelope) -> anyhow::Result<()> {
        self.sender
            .try_send(envelope)
            .map_err(|err| anyhow::anyhow!("conn {} queue: {err}", self.conn_id))
    }

    fn complete_pong(&self, nonce: u64) {
        let waiter = self
            .pending_pongs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&nonce);
        if let Some(waiter) = waiter {
            let _ = waiter.send(());
        }
    }

    fn forget_pong(&self, nonce: u64) {
        self.pending_pongs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&nonce);
    }
}

impl ControllerLink for TcpLink {
    fn id(&self) -> u64 {
        self.conn_id
    }

    fn peer(&self) -> Option<String> {
        self.peer.clone()
    }

    fn probe(&self, timeout: Duration) -> BoxFuture<'_, bool> {
        async move {
            if *self.closed.borrow() {
                return false;
            }
            let nonce = self.next_nonce.fetch_add(1, Ordering::Relaxed) + 1;
            let (tx, rx) = oneshot::channel();
            self.pending_pongs
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .insert(nonce, tx);

            let round_trip = async {
                if !self.send(Envelope::new(WireMsg::Ping(PingPayload { nonce }))).await {
                    return false;
                }
                rx.await.is_ok()
            };
            let alive = matches!(tokio::time::timeout(timeout, round_trip).await, Ok(true));
            self.forget_pong(nonce);
            debug!(event = "session_probe", conn_id = self.conn_id, alive);
            alive
        }
        .boxed()
    }

    fn close(&self) {
        self.closed.send_replace(true);
    }

    fn supports(&self, event: &str) -> bool {
        self.capabilities.iter().any(|capability| capability == event)
    }

    fn notify(&self, event: &str) -> anyhow::Result<()> {
        self.push(Envelope::new(WireMsg::Event(EventPayload {
            name: event.to_string(),
        })))
    }
}

async fn handle_connection(service: Arc<Service>, config: ServerConfig, stream: TcpStream, conn_id: u64) {
    let peer = stream.peer_addr().ok().map(|addr| addr.ip().to_string());
    let (reader_half, writer_half) = stream.into_split();
    let mut frames = FrameReader::new(reader_half, conn_id);

    let hello = match tokio::time::timeout(config.handshake_timeout, frames.next()).await {
        Ok(Some(hello)) => hello,
        Ok(None) => return,
        Err(_) => {
            warn!(event = "handshake_timeout", conn_id);
            return;
        }
    };
    if hello.version.0 > CURRENT_PROTOCOL_VERSION {
        warn!(event = "unsupported_version", conn_id, version = hello.version.0);
        return;
    }
    let WireMsg::Hello(payload) = hello.msg else {
        warn!(event = "expected_hello", conn_id);
        return;
    };

    let (tx, rx) = mpsc::channel::<Envelope>(config.queue_capacity);
    let (closed_tx, closed_rx) = watch::channel(false);
    let link = Arc::new(TcpLink {
        conn_id,
        peer,
        capabilities: payload.capabilities,
        sender: tx,
        pending_pongs: Mutex::new(HashMap::new()),
        next_nonce: AtomicU64::new(0),
        closed: closed_tx,
    });
    let writer_task = tokio::spawn(writer_loop(
        conn_id,
        writer_half,
        rx,
        closed_rx.clone(),
        config.write_timeout,
    ));

    info!(
        event = "handshake_ok",
        conn_id,
        client_id = %payload.client_id,
        peer = link.peer.as_deref().unwrap_or("unknown")
    );

    match service.connect(link.clone()).await {
        Admission::Admitted { peer } => {
            link.send(Envelope::new(WireMsg::Welcome(WelcomePayload { peer }))).await;
        }
        Admission::Rejected { .. } => {
            link.close();
            let _ = writer_task.await;
            return;
        }
    }

    let (request_tx, request_rx) = mpsc::channel::<(Option<String>, RequestPayload)>(config.queue_capacity);
    let dispatcher = tokio::spawn(dispatch_requests(service.clone(), link.clone(), request_rx));

    let mut closed = closed_rx;
    loop {
        let envelope = tokio::select! {
            _ = closed.changed() => break,
            frame = frames.next() => match frame {
                Some(envelope) => envelope,
                None => break,
            },
        };
        if envelope.version.0 > CURRENT_PROTOCOL_VERSION {
            warn!(event = "skip_version", conn_id, version = envelope.version.0);
            continue;
        }
        match envelope.msg {
            WireMsg::Request(request) => {
                if config.debug {
                    debug!(event = "request_received", conn_id, method = ?request.method, core = %request.core);
                }
                if request_tx.send((envelope.request_id, request)).await.is_err() {
                    break;
                }
            }
            WireMsg::Ping(PingPayload { nonce }) => {
                link.send(Envelope::reply(envelope.request_id, WireMsg::Pong(PingPayload { nonce })))
                    .await;
            }
            WireMsg::Pong(PingPayload { nonce }) => link.complete_pong(nonce),
            WireMsg::Hello(_) => warn!(event = "unexpected_hello", conn_id),
            _ => debug!(event = "ignored_message", conn_id),
        }
    }

    drop(request_tx);
    let _ = dispatcher.await;
    if service.disconnect(&link).await {
        info!(event = "controller_disconnected", conn_id);
    }
    link.close();
    let _ = writer_task.await;
}

/// Runs requests one at a time in arrival order and owns the
/// connection's log subscriptions.
async fn dispatch_requests(
    service: Arc<Service>,
    link: Arc<TcpLink>,
    mut requests: mpsc::Receiver<(Option<String>, RequestPayload)>,
) {
    let mut subscriptions: HashMap<u64, LogSubscription> = HashMap::new();
    let mut next_subscription = 0u64;

    while let Some((request_id, request)) = requests.recv().await {
        let response = match request.method {
            Method::FetchLogs => {
                next_subscription += 1;
                let id = next_subscription;
                let sink_link = link.clone();
                let sink = move |batch: &str| {
                    sink_link.push(Envelope::new(WireMsg::Logs(LogsPayload {
                        subscription: id,
                        text: batch.to_string(),
                    })))
                };
                match service.fetch_logs(&link, request.core, Arc::new(sink)).await {
                    Ok(subscription) => {
                        subscriptions.insert(id, subscription);
                        ResponsePayload::success(json!(id))
                    }
                    Err(err) => ResponsePayload::failure(&err),
                }
            }
            Method::StopLogs => match request.subscription {
                Some(id) => match subscriptions.remove(&id) {
                    Some(subscription) => {
                        subscription.stop().await;
                        ResponsePayload::success(json!(true))
                    }
                    None => ResponsePayload::success(json!(false)),
                },
                None => ResponsePayload::bad_request("stop_logs needs a subscription id"),
            },
            _ => core_call(&service, &link, request).await,
        };
        if !response.ok {
            debug!(event = "request_failed", conn_id = link.conn_id, error = ?response.error);
        }
        if !link.send(Envelope::reply(request_id, WireMsg::Response(response))).await {
            break;
        }
    }

    for (_, subscription) in subscriptions.drain() {
        subscription.stop().await;
    }
}

async fn core_call(service: &Service, link: &Arc<TcpLink>, request: RequestPayload) -> ResponsePayload {
    let core = request.core;
    let result = match request.method {
        Method::Start | Method::Restart => {
            let Some(config) = request.config else {
                return ResponsePayload::bad_request("missing config");
            };
            let outcome = if request.method == Method::Start {
                service.start(link, core, config.as_bytes()).await
            } else {
                service.restart(link, core, config.as_bytes()).await
            };
            outcome.map(|()| Value::Null)
        }
        Method::Stop => service.stop(link, core).await.map(|()| Value::Null),
        Method::Version => service.version(link, core).await.map(|version| json!(version)),
        Method::IsEnabled => Ok(json!(service.is_enabled(core))),
        Method::FetchLogs | Method::StopLogs => {
            return ResponsePayload::bad_request("log requests are handled by the dispatcher");
        }
    };
    match result {
        Ok(value) => ResponsePayload::success(value),
        Err(err) => ResponsePayload::failure(&err),
    }
}

async fn writer_loop(
    conn_id: u64,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Envelope>,
    mut closed: watch::Receiver<bool>,
    write_timeout: Duration,
) {
    loop {
        let envelope = tokio::select! {
            biased;
            next = rx.recv() => match next {
                Some(envelope) => envelope,
                None => break,
            },
            _ = closed.changed() => break,
        };
        let frame = match encode_frame(&envelope, DEFAULT_MAX_FRAME_BYTES) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "encode_error", conn_id, error = %err);
                continue;
            }
        };
        let send = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        };
        match tokio::time::timeout(write_timeout, send).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(event = "write_error", conn_id, error = %err);
                break;
            }
            Err(_) => {
                warn!(event = "write_timeout", conn_id);
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
}

/// Splits the read half into frames with a bounded buffer. A line that
/// outgrows the frame limit before its newline ends the connection.
struct FrameReader {
    reader: OwnedReadHalf,
    decoder: NdjsonFrameDecoder<Envelope>,
    ready: VecDeque<Envelope>,
    chunk: Vec<u8>,
    conn_id: u64,
    eof: bool,
}

impl FrameReader {
    fn new(reader: OwnedReadHalf, conn_id: u64) -> Self {
        Self {
            reader,
            decoder: NdjsonFrameDecoder::new(DEFAULT_MAX_FRAME_BYTES),
            ready: VecDeque::new(),
            chunk: vec![0; READ_CHUNK_BYTES],
            conn_id,
            eof: false,
        }
    }

    async fn next(&mut self) -> Option<Envelope> {
        let conn_id = self.conn_id;
        loop {
            if let Some(envelope) = self.ready.pop_front() {
                return Some(envelope);
            }
            if self.eof {
                return None;
            }
            let n = match self.reader.read(&mut self.chunk).await {
                Ok(value) => value,
                Err(err) => {
                    debug!(event = "read_error", conn_id, error = %err);
                    return None;
                }
            };
            let report = if n == 0 {
                self.eof = true;
                self.decoder.finish()
            } else {
                self.decoder.push_chunk(&self.chunk[..n])
            };
            self.ready.extend(report.frames);
            for err in report.errors {
                if let FrameError::OversizedBuffer { size, max } = err {
                    warn!(event = "frame_overflow", conn_id, size, max);
                    self.ready.clear();
                    self.eof = true;
                    return None;
                }
                warn!(event = "decode_error", conn_id, error = %err);
            }
        }
    }
}
