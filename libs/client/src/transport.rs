//! The transport client: one logical connection to the relay with offline
//! queuing, send batching, heartbeat liveness, and a pluggable reconnect
//! policy.
//!
//! [`RelayClient`] is a cheap cloneable handle; a background driver task owns
//! the socket, both buffers, and every timer. Handles talk to the driver over
//! an unbounded mpsc channel, so no caller ever blocks on the network.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use waypoint_common::wire::{Body, Envelope, MessageKind};

use crate::error::ClientError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

type MessageHandler = Arc<dyn Fn(&Envelope) + Send + Sync>;
type LifecycleHandler = Arc<dyn Fn() + Send + Sync>;

/// How the client behaves after the connection closes on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Log the close and stay down until the next explicit `connect()` or
    /// queued `send()` triggers a fresh dial.
    Disabled,
    /// Retry with exponentially growing delays, up to `max_attempts` in a
    /// row. The counter resets on every successful open.
    Backoff {
        max_attempts: u32,
        initial_delay: Duration,
    },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Backoff {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
        }
    }
}

/// Tunables for one [`RelayClient`].
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Full WebSocket URL, e.g. `ws://localhost:4000/ws`.
    pub url: String,
    /// How long outbound messages buffer before a flush.
    pub batch_window: Duration,
    /// Interval between application-level pings while connected.
    pub heartbeat_interval: Duration,
    /// How long to wait for the matching pong before declaring the
    /// connection half-open and closing it.
    pub heartbeat_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl RelayConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            batch_window: Duration::from_millis(100),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(5),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Handler registration key: one message type, or every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Interest {
    Kind(MessageKind),
    Any,
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Message(Interest),
    Connect,
    Disconnect,
}

#[derive(Default)]
struct HandlerRegistry {
    message: HashMap<Interest, Vec<(u64, MessageHandler)>>,
    connect: Vec<(u64, LifecycleHandler)>,
    disconnect: Vec<(u64, LifecycleHandler)>,
}

struct Shared {
    registry: Mutex<HandlerRegistry>,
    connected: AtomicBool,
    queued: AtomicUsize,
    next_token: AtomicU64,
}

enum Command {
    Connect(oneshot::Sender<Result<(), ClientError>>),
    Send(Envelope),
    Disconnect,
}

/// A registered handler. Call [`unsubscribe`](Subscription::unsubscribe) to
/// deregister; dropping the value leaves the handler in place.
#[must_use]
pub struct Subscription {
    shared: Weak<Shared>,
    slot: Slot,
    token: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let mut reg = shared.registry.lock();
        match self.slot {
            Slot::Message(interest) => {
                if let Some(handlers) = reg.message.get_mut(&interest) {
                    handlers.retain(|(token, _)| *token != self.token);
                    if handlers.is_empty() {
                        reg.message.remove(&interest);
                    }
                }
            }
            Slot::Connect => reg.connect.retain(|(token, _)| *token != self.token),
            Slot::Disconnect => reg.disconnect.retain(|(token, _)| *token != self.token),
        }
    }
}

/// Handle to the transport. Clone freely; all clones share one connection.
#[derive(Clone)]
pub struct RelayClient {
    shared: Arc<Shared>,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl RelayClient {
    /// Create a client and spawn its driver task on the current runtime.
    /// Nothing is dialed until `connect()` or the first `send()`.
    pub fn new(config: RelayConfig) -> Self {
        let shared = Arc::new(Shared {
            registry: Mutex::new(HandlerRegistry::default()),
            connected: AtomicBool::new(false),
            queued: AtomicUsize::new(0),
            next_token: AtomicU64::new(0),
        });
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            config,
            shared: shared.clone(),
            cmd_rx,
            queue: VecDeque::new(),
            waiters: Vec::new(),
            attempts: 0,
        };
        tokio::spawn(driver.run());

        Self { shared, cmd_tx }
    }

    /// Open the connection. Idempotent: while a dial is in flight every
    /// caller joins the same attempt, and all of them settle with its
    /// outcome. Resolves immediately when already open.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Connect(tx))
            .map_err(|_| ClientError::Closed)?;
        rx.await.map_err(|_| ClientError::Closed)?
    }

    /// Queue a message. Connected: buffered into the current batch window.
    /// Disconnected: held until the next successful connect, which is
    /// triggered opportunistically.
    pub fn send(&self, body: Body) {
        self.send_envelope(Envelope::now(body));
    }

    /// [`send`](Self::send) with a caller-supplied timestamp.
    pub fn send_envelope(&self, envelope: Envelope) {
        if self.cmd_tx.send(Command::Send(envelope)).is_err() {
            tracing::warn!("send after client shutdown; message dropped");
        }
    }

    /// Register a handler for one message type. All handlers for a type run
    /// on every delivery; a panicking handler never starves its peers.
    pub fn on(
        &self,
        kind: MessageKind,
        handler: impl Fn(&Envelope) + Send + Sync + 'static,
    ) -> Subscription {
        self.register_message(Interest::Kind(kind), Arc::new(handler))
    }

    /// Register a handler invoked for every message regardless of type.
    pub fn on_any(&self, handler: impl Fn(&Envelope) + Send + Sync + 'static) -> Subscription {
        self.register_message(Interest::Any, Arc::new(handler))
    }

    /// Observe connection establishment. When the client is already
    /// connected the handler fires synchronously during registration, so
    /// there is no missed-event window.
    pub fn on_connect(&self, handler: impl Fn() + Send + Sync + 'static) -> Subscription {
        let handler: LifecycleHandler = Arc::new(handler);
        let token = self.next_token();
        self.shared
            .registry
            .lock()
            .connect
            .push((token, handler.clone()));
        if self.is_connected() {
            invoke_guarded(|| handler(), "connect handler");
        }
        Subscription {
            shared: Arc::downgrade(&self.shared),
            slot: Slot::Connect,
            token,
        }
    }

    pub fn on_disconnect(&self, handler: impl Fn() + Send + Sync + 'static) -> Subscription {
        let token = self.next_token();
        self.shared
            .registry
            .lock()
            .disconnect
            .push((token, Arc::new(handler)));
        Subscription {
            shared: Arc::downgrade(&self.shared),
            slot: Slot::Disconnect,
            token,
        }
    }

    /// Hard reset: close the socket, drop unflushed data, clear every
    /// handler registration and both buffers. Not a graceful shutdown.
    pub fn disconnect(&self) {
        let _ = self.cmd_tx.send(Command::Disconnect);
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Number of messages waiting for the next successful connect.
    pub fn queued_messages(&self) -> usize {
        self.shared.queued.load(Ordering::SeqCst)
    }

    fn register_message(&self, interest: Interest, handler: MessageHandler) -> Subscription {
        let token = self.next_token();
        self.shared
            .registry
            .lock()
            .message
            .entry(interest)
            .or_default()
            .push((token, handler));
        Subscription {
            shared: Arc::downgrade(&self.shared),
            slot: Slot::Message(interest),
            token,
        }
    }

    fn next_token(&self) -> u64 {
        self.shared.next_token.fetch_add(1, Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

enum Step {
    /// Down, waiting for something to do.
    Idle,
    Dial,
    Backoff(Duration),
    Stop,
}

/// Why a live session ended.
enum Exit {
    /// `disconnect()`: hard reset, no notifications, no reconnect.
    User,
    /// Every handle dropped; shut the driver down.
    Dropped,
    /// The socket closed or failed; run the close path.
    Closed,
}

struct Driver {
    config: RelayConfig,
    shared: Arc<Shared>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    /// Messages sent while disconnected, flushed FIFO on the next open.
    queue: VecDeque<Envelope>,
    /// `connect()` callers waiting on the in-flight dial.
    waiters: Vec<oneshot::Sender<Result<(), ClientError>>>,
    /// Consecutive failed/closed connections since the last successful open.
    attempts: u32,
}

impl Driver {
    async fn run(mut self) {
        let mut step = Step::Idle;
        loop {
            step = match step {
                Step::Idle => self.idle().await,
                Step::Dial => self.dial().await,
                Step::Backoff(delay) => self.backoff(delay).await,
                Step::Stop => break,
            };
        }
        tracing::debug!("transport driver stopped");
    }

    async fn idle(&mut self) -> Step {
        match self.cmd_rx.recv().await {
            Some(Command::Connect(tx)) => {
                self.waiters.push(tx);
                Step::Dial
            }
            Some(Command::Send(envelope)) => {
                // Send-while-disconnected is not an error: queue it and try
                // to bring the connection up.
                self.enqueue(envelope);
                Step::Dial
            }
            Some(Command::Disconnect) => {
                self.hard_reset();
                Step::Idle
            }
            None => Step::Stop,
        }
    }

    async fn backoff(&mut self, delay: Duration) -> Step {
        tracing::info!(?delay, attempt = self.attempts, "reconnecting after backoff");
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                () = time::sleep_until(deadline) => return Step::Dial,
                cmd = self.cmd_rx.recv() => match cmd {
                    // An explicit connect() cuts the wait short.
                    Some(Command::Connect(tx)) => {
                        self.waiters.push(tx);
                        return Step::Dial;
                    }
                    Some(Command::Send(envelope)) => self.enqueue(envelope),
                    Some(Command::Disconnect) => {
                        self.hard_reset();
                        return Step::Idle;
                    }
                    None => return Step::Stop,
                },
            }
        }
    }

    async fn dial(&mut self) -> Step {
        tracing::debug!(url = %self.config.url, "dialing relay");
        let dial = tokio_tungstenite::connect_async(self.config.url.clone());
        tokio::pin!(dial);

        // Keep servicing the handle while the dial is in flight so that
        // overlapping connect() calls join this attempt instead of racing a
        // second socket.
        let outcome = loop {
            tokio::select! {
                result = &mut dial => break result,
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Connect(tx)) => self.waiters.push(tx),
                    Some(Command::Send(envelope)) => self.enqueue(envelope),
                    Some(Command::Disconnect) => {
                        self.hard_reset();
                        return Step::Idle;
                    }
                    None => return Step::Stop,
                },
            }
        };

        match outcome {
            Ok((ws, _response)) => {
                tracing::info!(url = %self.config.url, "connected");
                self.attempts = 0;
                for waiter in self.waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
                match self.run_session(ws).await {
                    Exit::User => {
                        self.hard_reset();
                        Step::Idle
                    }
                    Exit::Dropped => Step::Stop,
                    Exit::Closed => self.after_close(),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "connection failed");
                let err = ClientError::Connect(e.to_string());
                for waiter in self.waiters.drain(..) {
                    let _ = waiter.send(Err(err.clone()));
                }
                self.after_close()
            }
        }
    }

    /// The connected event loop. Owns the socket halves and all timers.
    async fn run_session(&mut self, ws: WsStream) -> Exit {
        let (mut tx, mut rx) = ws.split();

        self.shared.connected.store(true, Ordering::SeqCst);

        // Flush the offline queue ahead of anything sent from here on: it
        // seeds the first batch window in FIFO order.
        let mut batch: Vec<Envelope> = self.queue.drain(..).collect();
        self.shared.queued.store(0, Ordering::SeqCst);
        let mut batch_deadline = if batch.is_empty() {
            None
        } else {
            Some(Instant::now() + self.config.batch_window)
        };

        let mut heartbeat = time::interval_at(
            Instant::now() + self.config.heartbeat_interval,
            self.config.heartbeat_interval,
        );
        let mut pong_deadline: Option<Instant> = None;

        fire_lifecycle(&self.shared, Slot::Connect);

        let exit = loop {
            let batch_timer = sleep_opt(batch_deadline);
            let pong_timer = sleep_opt(pong_deadline);

            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Connect(waiter)) => {
                        // Already open.
                        let _ = waiter.send(Ok(()));
                    }
                    Some(Command::Send(envelope)) => {
                        // Each send restarts the batch window; the flush
                        // fires once sends go quiet for a full window.
                        batch.push(envelope);
                        batch_deadline = Some(Instant::now() + self.config.batch_window);
                    }
                    Some(Command::Disconnect) => {
                        let _ = tx.send(Message::Close(None)).await;
                        break Exit::User;
                    }
                    None => {
                        let _ = tx.send(Message::Close(None)).await;
                        break Exit::Dropped;
                    }
                },

                msg = rx.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<Envelope>(&text) {
                            Ok(envelope) => {
                                if matches!(envelope.body, Body::Pong(_)) {
                                    // Heartbeat answer; consumed here, never
                                    // dispatched.
                                    pong_deadline = None;
                                } else {
                                    dispatch(&self.shared, &envelope);
                                }
                            }
                            Err(e) => {
                                tracing::debug!(error = %e, "unparseable frame from relay");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        // Protocol-level liveness, answered by the socket layer.
                    }
                    Some(Ok(Message::Close(_))) | None => break Exit::Closed,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "ws read error");
                        break Exit::Closed;
                    }
                },

                _ = heartbeat.tick() => {
                    // Liveness probes bypass the batch buffer: a ping must
                    // not wait out the batching window.
                    if send_direct(&mut tx, &Envelope::now(Body::ping())).await.is_err() {
                        break Exit::Closed;
                    }
                    if pong_deadline.is_none() {
                        pong_deadline = Some(Instant::now() + self.config.heartbeat_timeout);
                    }
                }

                () = batch_timer => {
                    batch_deadline = None;
                    if !flush_batch(&mut tx, &mut batch, &mut self.queue).await {
                        break Exit::Closed;
                    }
                }

                () = pong_timer => {
                    tracing::warn!("heartbeat timeout, closing connection");
                    let _ = tx.send(Message::Close(None)).await;
                    break Exit::Closed;
                }
            }
        };

        self.shared.connected.store(false, Ordering::SeqCst);

        if matches!(exit, Exit::Closed) {
            // Whatever never reached the wire waits for the next connect.
            for envelope in batch.drain(..).rev() {
                self.queue.push_front(envelope);
            }
            self.sync_queued();
            fire_lifecycle(&self.shared, Slot::Disconnect);
        }

        exit
    }

    fn after_close(&mut self) -> Step {
        match self.config.reconnect {
            ReconnectPolicy::Disabled => {
                tracing::info!("connection closed, reconnection disabled");
                Step::Idle
            }
            ReconnectPolicy::Backoff {
                max_attempts,
                initial_delay,
            } => {
                if self.attempts >= max_attempts {
                    tracing::warn!(attempts = self.attempts, "reconnect attempts exhausted");
                    Step::Idle
                } else {
                    let delay = initial_delay * 2u32.saturating_pow(self.attempts.min(16));
                    self.attempts += 1;
                    Step::Backoff(delay)
                }
            }
        }
    }

    fn enqueue(&mut self, envelope: Envelope) {
        self.queue.push_back(envelope);
        self.sync_queued();
    }

    fn sync_queued(&self) {
        self.shared.queued.store(self.queue.len(), Ordering::SeqCst);
    }

    fn hard_reset(&mut self) {
        self.queue.clear();
        self.sync_queued();
        self.waiters.clear();
        self.attempts = 0;
        self.shared.connected.store(false, Ordering::SeqCst);
        let mut reg = self.shared.registry.lock();
        reg.message.clear();
        reg.connect.clear();
        reg.disconnect.clear();
    }
}

/// A sleep that never fires when there is no deadline.
async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Write every buffered message as its own frame, in order. On a send
/// failure the unsent tail goes back to the offline queue and the session
/// is considered dead.
async fn flush_batch(tx: &mut WsSink, batch: &mut Vec<Envelope>, queue: &mut VecDeque<Envelope>) -> bool {
    let pending: Vec<Envelope> = batch.drain(..).collect();
    for (i, envelope) in pending.iter().enumerate() {
        if send_direct(tx, envelope).await.is_err() {
            tracing::warn!(unsent = pending.len() - i, "send failed mid-batch, requeueing");
            for envelope in pending[i..].iter().rev() {
                queue.push_front(envelope.clone());
            }
            return false;
        }
    }
    true
}

async fn send_direct(tx: &mut WsSink, envelope: &Envelope) -> Result<(), ()> {
    let json = match serde_json::to_string(envelope) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize envelope");
            return Ok(());
        }
    };
    tx.send(Message::Text(json.into())).await.map_err(|e| {
        tracing::debug!(error = %e, "ws write error");
    })
}

/// Deliver to the type's handlers, then the wildcard handlers. Each handler
/// is isolated: a panic is caught and logged without aborting the rest.
fn dispatch(shared: &Shared, envelope: &Envelope) {
    let handlers: Vec<MessageHandler> = {
        let reg = shared.registry.lock();
        let typed = reg.message.get(&Interest::Kind(envelope.kind()));
        let any = reg.message.get(&Interest::Any);
        typed
            .into_iter()
            .flatten()
            .chain(any.into_iter().flatten())
            .map(|(_, handler)| handler.clone())
            .collect()
    };
    for handler in handlers {
        invoke_guarded(|| handler(envelope), "message handler");
    }
}

fn fire_lifecycle(shared: &Shared, slot: Slot) {
    let handlers: Vec<LifecycleHandler> = {
        let reg = shared.registry.lock();
        let list = match slot {
            Slot::Connect => &reg.connect,
            Slot::Disconnect => &reg.disconnect,
            Slot::Message(_) => return,
        };
        list.iter().map(|(_, handler)| handler.clone()).collect()
    };
    for handler in handlers {
        invoke_guarded(|| handler(), "lifecycle handler");
    }
}

fn invoke_guarded(f: impl FnOnce(), what: &str) {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f));
    if result.is_err() {
        tracing::error!("{what} panicked; continuing delivery");
    }
}
