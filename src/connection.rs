//! Connection management for ESL
//!
//! One reader task owns the read half of the stream and splits inbound
//! messages into two queues: command replies, consumed in order by whoever
//! holds the writer lock, and events, consumed by a single [`EslEventStream`].

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::{
    command::{EslCommand, EslResponse},
    constants::{DEFAULT_CONNECT_TIMEOUT, MAX_EVENT_QUEUE_SIZE, SOCKET_BUF_SIZE},
    error::{EslError, EslResult},
    event::{EslEvent, EventFormat},
    protocol::{EslMessage, EslParser, MessageType},
};

/// Connection status for ESL client
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionStatus {
    /// ESL session is active.
    Connected,
    /// ESL session ended.
    Disconnected(DisconnectReason),
}

/// Reason for disconnection
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DisconnectReason {
    /// Server sent a text/disconnect-notice with Content-Disposition: disconnect
    ServerNotice,
    /// Liveness timeout exceeded without any inbound traffic
    HeartbeatExpired,
    /// I/O error (io::Error is not Clone, so we store the message)
    IoError(String),
    /// Inbound bytes could not be framed or decoded
    ProtocolError(String),
    /// Clean EOF on the connection
    ConnectionClosed,
    /// Client called disconnect()
    ClientRequested,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::ServerNotice => write!(f, "server sent disconnect notice"),
            DisconnectReason::HeartbeatExpired => write!(f, "liveness timeout expired"),
            DisconnectReason::IoError(msg) => write!(f, "I/O error: {}", msg),
            DisconnectReason::ProtocolError(msg) => write!(f, "protocol error: {}", msg),
            DisconnectReason::ConnectionClosed => write!(f, "connection closed"),
            DisconnectReason::ClientRequested => write!(f, "client requested disconnect"),
        }
    }
}

/// Options for ESL connection configuration.
///
/// Use [`Default::default()`] for standard settings.
#[derive(Debug, Clone)]
pub struct EslConnectOptions {
    /// Capacity of the mpsc channel delivering events. Default: 1000.
    ///
    /// Events are never dropped. When the queue is full the reader waits for
    /// the consumer, so command replies behind those events wait too.
    pub event_queue_size: usize,
    /// TCP connect timeout used by [`EslConnection::connect`]. Default: 2s.
    pub connect_timeout: Duration,
    /// Close the connection after this long without inbound bytes.
    /// Default: disabled.
    pub liveness_timeout: Option<Duration>,
}

impl Default for EslConnectOptions {
    fn default() -> Self {
        Self {
            event_queue_size: MAX_EVENT_QUEUE_SIZE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            liveness_timeout: None,
        }
    }
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type ReplyQueue = mpsc::UnboundedReceiver<EslResult<EslMessage>>;
type EventItem = EslResult<EslEvent>;

/// Everything a command needs while it owns the connection.
struct WriterState {
    writer: BoxedWriter,
    replies: ReplyQueue,
    /// Replies owed to callers that stopped waiting.
    orphans: usize,
}

/// Shared state between EslConnection handles and the reader task
struct SharedState {
    /// Set by disconnect() so EOF is reported as ClientRequested
    closing: AtomicBool,
}

/// ESL connection handle (Clone + Send)
///
/// Commands are serialized through the writer mutex, which is held from the
/// write until the matching reply is read. Replies are matched by order.
#[derive(Clone)]
pub struct EslConnection {
    writer: Arc<Mutex<WriterState>>,
    shared: Arc<SharedState>,
    status_rx: watch::Receiver<ConnectionStatus>,
}

impl std::fmt::Debug for EslConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EslConnection")
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Event stream receiver (!Clone)
///
/// Receives events from the background reader task. After the connection
/// fails, the next read returns the connection error and every later read
/// returns [`EslError::Disconnected`].
pub struct EslEventStream {
    rx: mpsc::Receiver<EventItem>,
    status_rx: watch::Receiver<ConnectionStatus>,
}

impl std::fmt::Debug for EslEventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EslEventStream")
            .field("connected", &self.is_connected())
            .finish()
    }
}

fn disconnected_error(status_rx: &watch::Receiver<ConnectionStatus>) -> EslError {
    match &*status_rx.borrow() {
        ConnectionStatus::Disconnected(reason) => EslError::Disconnected(reason.clone()),
        ConnectionStatus::Connected => EslError::Disconnected(DisconnectReason::ConnectionClosed),
    }
}

/// Establish a TCP connection with a timeout.
async fn tcp_connect_with_timeout(
    host: &str,
    port: u16,
    connect_timeout: Duration,
) -> EslResult<TcpStream> {
    match timeout(connect_timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(s)) => {
            debug!("[CONNECT] TCP connection established");
            Ok(s)
        }
        Ok(Err(e)) => {
            warn!("[CONNECT] TCP connect failed: {}", e);
            Err(EslError::Io(e))
        }
        Err(_) => {
            warn!(
                "[CONNECT] TCP connect timed out after {}ms",
                connect_timeout.as_millis()
            );
            Err(EslError::Timeout {
                timeout_ms: connect_timeout.as_millis() as u64,
            })
        }
    }
}

/// Hand an event to the consumer, waiting while the queue is full.
///
/// Returns `false` once the consumer is gone.
async fn dispatch_event(event_tx: &mpsc::Sender<EventItem>, event: EslEvent) -> bool {
    if event_tx.capacity() == 0 {
        trace!("Event queue full, waiting for the consumer");
    }
    event_tx
        .send(Ok(event))
        .await
        .is_ok()
}

/// Sending side of both queues plus the status watch.
struct ReaderOutputs {
    reply_tx: mpsc::UnboundedSender<EslResult<EslMessage>>,
    event_tx: mpsc::Sender<EventItem>,
    status_tx: watch::Sender<ConnectionStatus>,
}

impl ReaderOutputs {
    /// Publish a terminal failure once to each queue.
    ///
    /// The senders drop when the reader task ends.
    fn fail(&self, reason: DisconnectReason) {
        let _ = self
            .status_tx
            .send(ConnectionStatus::Disconnected(reason.clone()));
        let error = EslError::Disconnected(reason);
        let _ = self
            .reply_tx
            .send(Err(error.duplicate()));
        if self
            .event_tx
            .try_send(Err(error))
            .is_err()
        {
            debug!("Event queue full or closed, consumer will observe the disconnect on drain");
        }
    }
}

/// Background reader loop
async fn reader_loop<R>(
    reader: R,
    shared: Arc<SharedState>,
    outputs: ReaderOutputs,
    liveness: Option<Duration>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let result = std::panic::AssertUnwindSafe(reader_loop_inner(reader, shared, &outputs, liveness));
    if futures_util::FutureExt::catch_unwind(result)
        .await
        .is_err()
    {
        tracing::error!("reader task panicked");
        // Queue senders are still alive here, so waiters see this reason.
        outputs.fail(DisconnectReason::IoError("reader task panicked".to_string()));
    }
}

async fn reader_loop_inner<R>(
    mut reader: R,
    shared: Arc<SharedState>,
    outputs: &ReaderOutputs,
    liveness: Option<Duration>,
) where
    R: AsyncRead + Unpin,
{
    let mut parser = EslParser::new();
    let mut read_buffer = vec![0u8; SOCKET_BUF_SIZE];

    loop {
        // Drain everything already buffered before touching the socket
        loop {
            let message = match parser.parse_message() {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(e) => {
                    warn!("Parser error: {}", e);
                    outputs.fail(DisconnectReason::ProtocolError(e.to_string()));
                    return;
                }
            };

            match message.message_type {
                MessageType::Event(_) => match message.into_event() {
                    Ok(event) => {
                        trace!("[RECV] event {:?}", event.event_name());
                        if !dispatch_event(&outputs.event_tx, event).await {
                            debug!("Event channel closed, reader keeps serving replies");
                        }
                    }
                    Err(e) => {
                        warn!("Undecodable event: {}", e);
                        outputs.fail(DisconnectReason::ProtocolError(e.to_string()));
                        return;
                    }
                },
                MessageType::Disconnect if message.is_linger_notice() => {
                    debug!("Received disconnect notice with linger disposition, ignoring");
                }
                MessageType::Disconnect => {
                    info!("Received disconnect notice from server");
                    outputs.fail(DisconnectReason::ServerNotice);
                    return;
                }
                MessageType::LogData => {
                    trace!("Ignoring log/data message");
                }
                _ => {
                    trace!("[RECV] reply {:?}", message.message_type);
                    if outputs
                        .reply_tx
                        .send(Ok(message))
                        .is_err()
                    {
                        debug!("All connection handles dropped, reader exiting");
                        return;
                    }
                }
            }
        }

        let read = match liveness {
            Some(limit) => match timeout(limit, reader.read(&mut read_buffer)).await {
                Ok(read) => read,
                Err(_) => {
                    warn!(
                        "Liveness timeout: no traffic for {}ms",
                        limit.as_millis()
                    );
                    outputs.fail(DisconnectReason::HeartbeatExpired);
                    return;
                }
            },
            None => {
                reader
                    .read(&mut read_buffer)
                    .await
            }
        };

        match read {
            Ok(0) => {
                let reason = if shared
                    .closing
                    .load(Ordering::Relaxed)
                {
                    DisconnectReason::ClientRequested
                } else {
                    DisconnectReason::ConnectionClosed
                };
                info!("Connection closed (EOF): {}", reason);
                outputs.fail(reason);
                return;
            }
            Ok(n) => {
                if let Err(e) = parser.add_data(&read_buffer[..n]) {
                    warn!("Buffer error: {}", e);
                    outputs.fail(DisconnectReason::ProtocolError(e.to_string()));
                    return;
                }
            }
            Err(e) => {
                warn!("Read error: {}", e);
                outputs.fail(DisconnectReason::IoError(e.to_string()));
                return;
            }
        }
    }
}

impl WriterState {
    async fn write_command(&mut self, wire: &[u8]) -> std::io::Result<()> {
        self.writer
            .write_all(wire)
            .await?;
        self.writer
            .flush()
            .await
    }

    async fn next_reply(&mut self, status_rx: &watch::Receiver<ConnectionStatus>) -> EslResult<EslMessage> {
        match self
            .replies
            .recv()
            .await
        {
            Some(reply) => reply,
            None => Err(disconnected_error(status_rx)),
        }
    }

    /// Read and discard replies owed to abandoned commands.
    async fn discard_orphans(&mut self, status_rx: &watch::Receiver<ConnectionStatus>) -> EslResult<()> {
        while self.orphans > 0 {
            let stale = self
                .next_reply(status_rx)
                .await?;
            self.orphans -= 1;
            debug!("Discarded orphaned reply: {:?}", stale.reply_text());
        }
        Ok(())
    }
}

fn owned_headers(headers: &[(&str, &str)]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

impl EslConnection {
    /// Connect to FreeSWITCH over TCP (inbound mode).
    ///
    /// Call [`auth`](Self::auth) next unless the server does not ask for it.
    pub async fn connect(
        host: &str,
        port: u16,
        options: EslConnectOptions,
    ) -> EslResult<(Self, EslEventStream)> {
        info!("Connecting to FreeSWITCH at {}:{}", host, port);
        let stream = tcp_connect_with_timeout(host, port, options.connect_timeout).await?;
        Ok(Self::from_stream(stream, options))
    }

    /// Wrap an already-established stream and spawn its reader task.
    pub fn from_stream<S>(stream: S, options: EslConnectOptions) -> (Self, EslEventStream)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let queue_size = options
            .event_queue_size
            .max(1);

        let (read_half, write_half) = tokio::io::split(stream);

        let shared = Arc::new(SharedState {
            closing: AtomicBool::new(false),
        });

        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connected);
        let (event_tx, event_rx) = mpsc::channel(queue_size);
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();

        tokio::spawn(reader_loop(
            read_half,
            shared.clone(),
            ReaderOutputs {
                reply_tx,
                event_tx,
                status_tx,
            },
            options.liveness_timeout,
        ));

        let connection = EslConnection {
            writer: Arc::new(Mutex::new(WriterState {
                writer: Box::new(write_half),
                replies: reply_rx,
                orphans: 0,
            })),
            shared,
            status_rx: status_rx.clone(),
        };

        let events = EslEventStream {
            rx: event_rx,
            status_rx,
        };

        (connection, events)
    }

    /// Send a command and wait for the reply.
    ///
    /// The writer lock is held through the entire send-and-receive cycle
    /// (ESL is a sequential request/response protocol). If this future is
    /// dropped after the write, the reply is discarded by the next command.
    pub async fn send_command(&self, command: EslCommand) -> EslResult<EslResponse> {
        let command_str = command.to_wire_format()?;
        if command.is_sensitive() {
            debug!("Sending command: {:?}", command);
        } else {
            debug!("Sending command: {}", command_str.trim_end());
        }

        let mut state = self
            .writer
            .lock()
            .await;

        if !self.is_connected() {
            return Err(disconnected_error(&self.status_rx));
        }

        state
            .discard_orphans(&self.status_rx)
            .await?;

        // Counted before the write so a caller dropped mid-write still owes
        // its reply. A failed write owes nothing.
        state.orphans += 1;
        if let Err(e) = state
            .write_command(command_str.as_bytes())
            .await
        {
            state.orphans -= 1;
            warn!("Command write failed: {}", e);
            return Err(e.into());
        }

        let message = state
            .next_reply(&self.status_rx)
            .await?;
        state.orphans -= 1;
        drop(state);

        let response = message.into_response();
        debug!("Received response: success={}", response.is_success());
        Ok(response)
    }

    /// Send a command and require a successful response, discarding the body.
    async fn send_command_ok(&self, command: EslCommand) -> EslResult<()> {
        self.send_command(command)
            .await?
            .into_result()
            .map(|_| ())
    }

    /// Send one raw command line and wait for its reply.
    ///
    /// Line breaks anywhere in `line` are rejected before anything is written.
    pub async fn send(&self, line: &str) -> EslResult<EslResponse> {
        self.send_command(EslCommand::Raw {
            line: line.to_string(),
        })
        .await
    }

    /// Send a `sendmsg` header block with an optional body.
    ///
    /// With `call_id` the message targets that call; without it, the call the
    /// socket is bound to. Headers with empty values are omitted.
    pub async fn send_with_headers(
        &self,
        call_id: Option<&str>,
        headers: &[(&str, &str)],
        body: Option<&str>,
    ) -> EslResult<EslResponse> {
        let cmd = EslCommand::SendMsg {
            uuid: call_id.map(str::to_string),
            headers: owned_headers(headers),
            body: body.map(str::to_string),
        };
        self.send_command(cmd)
            .await
    }

    /// Fire event `name` into the switch with `sendevent`.
    ///
    /// Headers with empty values are omitted.
    pub async fn send_event(
        &self,
        name: &str,
        headers: &[(&str, &str)],
        body: Option<&str>,
    ) -> EslResult<EslResponse> {
        let cmd = EslCommand::SendEvent {
            name: name.to_string(),
            headers: owned_headers(headers),
            body: body.map(str::to_string),
        };
        self.send_command(cmd)
            .await?
            .into_result()
    }

    /// Issue `bgapi <command>` tagged with `job_id`.
    ///
    /// Only the immediate acknowledgement is awaited. The result arrives
    /// later as a `BACKGROUND_JOB` event carrying the same `Job-UUID`.
    pub async fn submit_background_job(&self, command: &str, job_id: &str) -> EslResult<EslResponse> {
        let cmd = EslCommand::BgApi {
            command: command.to_string(),
            job_uuid: job_id.to_string(),
        };
        self.send_command(cmd)
            .await?
            .into_result()
    }

    /// Execute API command. Blocks until FreeSWITCH completes the command.
    ///
    /// FreeSWITCH blocks the ESL socket during `api`; no events are delivered
    /// until it returns.
    pub async fn api(&self, command: &str) -> EslResult<EslResponse> {
        let cmd = EslCommand::Api {
            command: command.to_string(),
        };
        self.send_command(cmd)
            .await
    }

    /// Subscribe to events using raw event name strings.
    pub async fn subscribe_events(&self, format: EventFormat, events: &str) -> EslResult<()> {
        let cmd = EslCommand::Events {
            format: format.to_string(),
            events: events.to_string(),
        };
        self.send_command_ok(cmd)
            .await?;
        info!("Subscribed to events '{}' with format {}", events, format);
        Ok(())
    }

    /// Answer the server's `auth/request` with a password.
    ///
    /// Must be the first command on an inbound connection that requires it.
    pub async fn auth(&self, password: &str) -> EslResult<()> {
        let mut state = self
            .writer
            .lock()
            .await;

        debug!("[AUTH] Waiting for auth request from FreeSWITCH");
        let request = state
            .next_reply(&self.status_rx)
            .await?;
        if request.message_type != MessageType::AuthRequest {
            return Err(EslError::protocol_error(format!(
                "Expected auth request, got {:?}",
                request.message_type
            )));
        }
        drop(state);

        let response = self
            .send_command(EslCommand::Auth {
                password: password.to_string(),
            })
            .await?;
        if !response.is_success() {
            return Err(EslError::auth_failed(
                response
                    .reply_text()
                    .unwrap_or("Authentication failed"),
            ));
        }
        debug!("Authentication successful");
        Ok(())
    }

    /// Send `exit`; the server replies and then closes the socket.
    pub async fn exit(&self) -> EslResult<EslResponse> {
        self.send_command(EslCommand::Exit)
            .await
    }

    /// Check if connected to FreeSWITCH
    pub fn is_connected(&self) -> bool {
        matches!(
            *self
                .status_rx
                .borrow(),
            ConnectionStatus::Connected
        )
    }

    /// Get current connection status
    pub fn status(&self) -> ConnectionStatus {
        self.status_rx
            .borrow()
            .clone()
    }

    /// Shut down the write half; the reader reports `ClientRequested` on EOF.
    pub async fn disconnect(&self) -> EslResult<()> {
        info!("Client requested disconnect");
        self.shared
            .closing
            .store(true, Ordering::Relaxed);
        let mut state = self
            .writer
            .lock()
            .await;
        state
            .writer
            .shutdown()
            .await?;
        Ok(())
    }
}

impl EslEventStream {
    /// Next event, or the error that ended the connection.
    pub async fn read_next_event(&mut self) -> EslResult<EslEvent> {
        match self
            .rx
            .recv()
            .await
        {
            Some(item) => item,
            None => Err(disconnected_error(&self.status_rx)),
        }
    }

    /// Check if connected
    pub fn is_connected(&self) -> bool {
        matches!(
            *self
                .status_rx
                .borrow(),
            ConnectionStatus::Connected
        )
    }

    /// Get current connection status
    pub fn status(&self) -> ConnectionStatus {
        self.status_rx
            .borrow()
            .clone()
    }
}

impl futures_util::Stream for EslEventStream {
    type Item = EslResult<EslEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx
            .poll_recv(cx)
    }
}
