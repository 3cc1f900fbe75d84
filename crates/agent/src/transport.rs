//! Controller connection
//!
//! Owns the websocket to the controller. Queued messages are drained on a
//! fixed interval and sent as a length header frame followed by a JSON
//! payload frame. Once a stop is requested and a drain finds the queue
//! empty, the channel closes and waits (bounded) for the controller to
//! confirm.

use std::sync::Arc;
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use kiln_common::{encode_frames, EncodedMessage, Message};
use tokio::net::TcpStream;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::batcher::MessageBatcher;
use crate::config::AgentConfig;
use crate::error::AgentResult;
use crate::state::RunState;

const INITIAL_BACKOFF: Duration = Duration::from_millis(250);

/// The concrete socket produced by [`connect`]
pub type ControllerSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Lifecycle of the controller connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Timing and retry knobs
#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub flush_interval: Duration,
    pub ping_interval: Duration,
    pub shutdown_timeout: Duration,
    pub send_retries: u32,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(1),
            ping_interval: Duration::from_secs(55),
            shutdown_timeout: Duration::from_secs(30),
            send_retries: 3,
        }
    }
}

impl From<&AgentConfig> for TransportSettings {
    fn from(config: &AgentConfig) -> Self {
        Self {
            flush_interval: config.flush_interval,
            ping_interval: config.ping_interval,
            shutdown_timeout: config.shutdown_timeout,
            send_retries: config.send_retries.max(1),
        }
    }
}

/// What happened over the lifetime of the connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub sent: usize,
    pub dropped: usize,
    pub closed_by_peer: bool,
    pub close_confirmed: bool,
}

/// Sends queued messages to the controller until shutdown
pub struct TransportChannel<S> {
    socket: S,
    queue: Arc<MessageBatcher>,
    state: Arc<RunState>,
    settings: TransportSettings,
}

/// Open a connection to the controller
pub async fn connect(url: &str) -> AgentResult<ControllerSocket> {
    debug!(state = ?ConnectionState::Connecting, "Connecting to {}", url);
    let (socket, response) = tokio_tungstenite::connect_async(url).await?;
    info!(status = %response.status(), "Connected to controller");
    Ok(socket)
}

impl<S> TransportChannel<S>
where
    S: Stream<Item = Result<WsMessage, WsError>> + Sink<WsMessage, Error = WsError> + Unpin,
{
    /// Wrap an already established socket
    pub fn new(
        socket: S,
        queue: Arc<MessageBatcher>,
        state: Arc<RunState>,
        settings: TransportSettings,
    ) -> Self {
        Self {
            socket,
            queue,
            state,
            settings,
        }
    }

    /// Run until the queue is drained after a stop request, or the connection ends
    pub async fn run(self) -> AgentResult<TransportStats> {
        let (sink, mut stream) = self.socket.split();
        let mut link = Link {
            sink,
            connection: ConnectionState::Open,
            retries: self.settings.send_retries.max(1),
            stats: TransportStats::default(),
        };

        let mut flush = interval(self.settings.flush_interval);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ping = interval_at(
            Instant::now() + self.settings.ping_interval,
            self.settings.ping_interval,
        );
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stop = self.state.subscribe_stop();
        let mut stop_seen = *stop.borrow();

        loop {
            tokio::select! {
                _ = flush.tick() => {
                    // Read the flag before draining: anything enqueued before
                    // the stop request is guaranteed to be in this batch.
                    let stopping = self.state.stop_requested();
                    let batch = self.queue.drain();
                    if batch.is_empty() {
                        if stopping {
                            debug!("Queue drained after stop request");
                            break;
                        }
                        continue;
                    }
                    if link.send_batch(batch).await.is_err() {
                        self.state.request_stop();
                        break;
                    }
                }
                _ = ping.tick() => {
                    if let Err(e) = link.sink.send(WsMessage::Ping(Default::default())).await {
                        warn!("Keep-alive ping failed: {}", e);
                    }
                }
                changed = stop.changed(), if !stop_seen => {
                    stop_seen = true;
                    if changed.is_ok() {
                        flush.reset_immediately();
                    }
                }
                incoming = stream.next() => match incoming {
                    Some(Ok(WsMessage::Close(frame))) => {
                        info!(?frame, "Controller closed the connection");
                        link.stats.closed_by_peer = true;
                        link.set_connection(ConnectionState::Closing);
                        self.state.request_stop();
                        break;
                    }
                    Some(Ok(WsMessage::Pong(_))) => debug!("Pong received"),
                    Some(Ok(other)) => debug!(len = other.len(), "Ignoring inbound message"),
                    Some(Err(e)) => {
                        error!("Connection to controller failed: {}", e);
                        link.set_connection(ConnectionState::Closed);
                        self.state.request_stop();
                        break;
                    }
                    None => {
                        warn!("Connection to controller ended without a close frame");
                        link.set_connection(ConnectionState::Closed);
                        self.state.request_stop();
                        break;
                    }
                },
            }
        }

        let leftover = self.queue.drain();
        if !leftover.is_empty() {
            warn!(count = leftover.len(), "Discarding messages queued after the connection ended");
            link.stats.dropped += leftover.len();
        }

        if link.connection == ConnectionState::Open {
            link.set_connection(ConnectionState::Closing);
            if let Err(e) = link.sink.send(WsMessage::Close(None)).await {
                warn!("Failed to send close frame: {}", e);
            }
        }

        if link.connection == ConnectionState::Closing {
            link.stats.close_confirmed =
                await_close(&mut stream, self.settings.shutdown_timeout).await;
            link.set_connection(ConnectionState::Closed);
        }

        info!(
            sent = link.stats.sent,
            dropped = link.stats.dropped,
            "Controller connection closed"
        );
        Ok(link.stats)
    }
}

struct Link<Si> {
    sink: Si,
    connection: ConnectionState,
    retries: u32,
    stats: TransportStats,
}

impl<Si> Link<Si>
where
    Si: Sink<WsMessage, Error = WsError> + Unpin,
{
    fn set_connection(&mut self, next: ConnectionState) {
        if self.connection != next {
            debug!("Connection {:?} -> {:?}", self.connection, next);
            self.connection = next;
        }
    }

    // A payload is only sent after its header went through, and once the
    // header is out any payload failure leaves the peer mid-message.
    async fn send_frames(&mut self, frames: EncodedMessage) -> Result<(), SendError> {
        let header = WsMessage::Binary(frames.header.to_vec().into());
        send_with_retry(&mut self.sink, header, self.retries)
            .await
            .map_err(|e| {
                if is_fatal(&e) {
                    SendError::Broken(e)
                } else {
                    SendError::Skipped(e)
                }
            })?;
        let payload = WsMessage::Binary(frames.payload.into());
        send_with_retry(&mut self.sink, payload, self.retries)
            .await
            .map_err(SendError::Broken)
    }

    /// Send a drained batch in order. Errors only when the connection is unusable.
    async fn send_batch(&mut self, batch: Vec<Message>) -> Result<(), WsError> {
        let total = batch.len();
        for (index, message) in batch.into_iter().enumerate() {
            let frames = match encode_frames(&message) {
                Ok(frames) => frames,
                Err(e) => {
                    error!(kind = message.kind(), "Dropping message that cannot be encoded: {}", e);
                    self.stats.dropped += 1;
                    continue;
                }
            };

            match self.send_frames(frames).await {
                Ok(()) => self.stats.sent += 1,
                Err(SendError::Skipped(e)) => {
                    error!(kind = message.kind(), "Dropping message after failed sends: {}", e);
                    self.stats.dropped += 1;
                }
                Err(SendError::Broken(e)) => {
                    error!("Connection lost while sending: {}", e);
                    self.stats.dropped += total - index;
                    self.set_connection(ConnectionState::Closed);
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

enum SendError {
    /// Nothing reached the socket; the stream is still aligned
    Skipped(WsError),
    /// The socket holds or has sent part of the message
    Broken(WsError),
}

/// Send one frame, retrying transient failures with exponential backoff
///
/// An I/O error leaves the frame in the socket's write buffer, so later
/// attempts only flush. The frame is offered again only when the socket
/// handed it back.
pub(crate) async fn send_with_retry<Si>(
    sink: &mut Si,
    frame: WsMessage,
    attempts: u32,
) -> Result<(), WsError>
where
    Si: Sink<WsMessage, Error = WsError> + Unpin,
{
    let mut pending = Some(frame);
    let mut delay = INITIAL_BACKOFF;
    let mut attempt = 1;
    loop {
        let result = match pending.take() {
            Some(frame) => sink.send(frame).await,
            None => sink.flush().await,
        };
        let retry = match result {
            Ok(()) => return Ok(()),
            Err(WsError::WriteBufferFull(frame)) if attempt < attempts => {
                pending = Some(frame);
                "write buffer full".to_string()
            }
            Err(WsError::Io(e)) if attempt < attempts => e.to_string(),
            Err(e) => return Err(e),
        };
        warn!(attempt, "Send failed, retrying in {:?}: {}", delay, retry);
        tokio::time::sleep(delay).await;
        delay *= 2;
        attempt += 1;
    }
}

// Anything other than a refused frame leaves the link unusable
fn is_fatal(e: &WsError) -> bool {
    !matches!(e, WsError::WriteBufferFull(_) | WsError::Capacity(_))
}

// Waits for the peer's close frame; the stream ends once the handshake completes.
async fn await_close<St>(stream: &mut St, limit: Duration) -> bool
where
    St: Stream<Item = Result<WsMessage, WsError>> + Unpin,
{
    let wait = async {
        while let Some(incoming) = stream.next().await {
            match incoming {
                Ok(WsMessage::Close(_)) => debug!("Close confirmed by controller"),
                Ok(_) => {}
                Err(WsError::ConnectionClosed) => break,
                Err(e) => {
                    debug!("Error while awaiting close confirmation: {}", e);
                    break;
                }
            }
        }
    };

    match tokio::time::timeout(limit, wait).await {
        Ok(()) => true,
        Err(_) => {
            warn!(timeout = ?limit, "Controller did not confirm close in time");
            false
        }
    }
}
