use crate::service::{stopped, DashboardEvent, PushStatus};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use taskdeck_core::{
    parse_task_bytes, parse_task_error,
    stomp::{FrameError, StompCommand, StompFrame, StompFrameDecoder},
    UpdateSource, WireError,
};
use taskdeck_engine::{AuthContext, Update};
use thiserror::Error;
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

pub const TASKS_TOPIC: &str = "/topic/tasks";
pub const TASK_ERRORS_TOPIC: &str = "/topic/tasks/error";
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PushChannel {
    /// STOMP overlay carrying the task and error topics.
    Stomp,
    /// Plain websocket where every text message is one task record.
    Raw,
}

impl PushChannel {
    pub const ALL: [PushChannel; 2] = [PushChannel::Stomp, PushChannel::Raw];

    pub fn as_str(&self) -> &'static str {
        match self {
            PushChannel::Stomp => "stomp",
            PushChannel::Raw => "raw",
        }
    }

    fn path(&self) -> &'static [&'static str] {
        match self {
            PushChannel::Stomp => &["ws"],
            PushChannel::Raw => &["ws", "tasks"],
        }
    }
}

#[derive(Debug, Clone)]
pub struct PushConfig {
    pub base_url: Url,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_frame_bytes: usize,
}

impl PushConfig {
    pub fn endpoint(&self, channel: PushChannel) -> Result<Url, PushError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| PushError::BaseUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(channel.path());
        Ok(url)
    }
}

#[derive(Debug, Error)]
pub enum PushError {
    #[error("base url {0} cannot carry a path")]
    BaseUrl(String),
    #[error("websocket error: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("stomp handshake failed: {0}")]
    Handshake(String),
    #[error("server sent ERROR: {0}")]
    Remote(String),
    #[error("stomp frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("connection closed")]
    Closed,
}

pub fn next_backoff(current: Duration, max: Duration) -> Duration {
    let next = current.saturating_add(current);
    if next > max {
        max
    } else {
        next
    }
}

/// Maps a STOMP MESSAGE onto an update by destination. Unknown destinations
/// and progress topics yield `None`.
pub fn route_frame(frame: &StompFrame, observed_at: DateTime<Utc>) -> Result<Option<Update>, WireError> {
    let Some(destination) = frame.destination() else {
        return Ok(None);
    };
    if destination == TASKS_TOPIC {
        let record = parse_task_bytes(frame.body.as_bytes(), UpdateSource::Push)?;
        return Ok(Some(Update::Delta {
            record,
            source: UpdateSource::Push,
            observed_at,
        }));
    }
    if destination == TASK_ERRORS_TOPIC {
        return Ok(Some(Update::TaskError(parse_task_error(frame.body.as_bytes())?)));
    }
    debug!(event = "push_unrouted", destination);
    Ok(None)
}

pub fn route_raw(text: &str, observed_at: DateTime<Utc>) -> Result<Update, WireError> {
    let record = parse_task_bytes(text.as_bytes(), UpdateSource::Push)?;
    Ok(Update::Delta {
        record,
        source: UpdateSource::Push,
        observed_at,
    })
}

/// Persistent push connections with reconnect. Each channel runs its own loop.
#[derive(Clone)]
pub struct PushClient {
    config: PushConfig,
    auth: AuthContext,
}

impl PushClient {
    pub fn new(config: PushConfig, auth: AuthContext) -> Self {
        Self { config, auth }
    }

    pub fn config(&self) -> &PushConfig {
        &self.config
    }

    pub fn spawn(
        &self,
        channel: PushChannel,
        tx: mpsc::Sender<DashboardEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            client.run(channel, tx, shutdown).await;
        })
    }

    async fn run(
        &self,
        channel: PushChannel,
        tx: mpsc::Sender<DashboardEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let url = match self.config.endpoint(channel) {
            Ok(url) => url,
            Err(err) => {
                warn!(event = "push_url_invalid", channel = channel.as_str(), error = %err);
                return;
            }
        };
        let mut backoff = self.config.initial_backoff;

        loop {
            let attempt = tokio::select! {
                attempt = self.establish(channel, &url) => attempt,
                _ = stopped(&mut shutdown) => break,
            };
            let mut ws = match attempt {
                Ok(ws) => ws,
                Err(err) => {
                    warn!(
                        event = "push_connect_failed",
                        channel = channel.as_str(),
                        error = %err,
                        retry_ms = backoff.as_millis() as u64,
                    );
                    if sleep_or_stop(backoff, &mut shutdown).await {
                        break;
                    }
                    backoff = next_backoff(backoff, self.config.max_backoff);
                    continue;
                }
            };
            backoff = self.config.initial_backoff;
            info!(event = "push_connected", channel = channel.as_str(), url = %url);
            if tx
                .send(DashboardEvent::Push(PushStatus::Connected(channel)))
                .await
                .is_err()
            {
                let _ = ws.close(None).await;
                break;
            }

            let stop = tokio::select! {
                result = self.pump(channel, &mut ws, &tx) => {
                    match result {
                        Ok(()) => info!(event = "push_closed", channel = channel.as_str()),
                        Err(err) => warn!(event = "push_disconnected", channel = channel.as_str(), error = %err),
                    }
                    false
                }
                _ = stopped(&mut shutdown) => true,
            };
            if stop && channel == PushChannel::Stomp {
                let _ = ws
                    .send(Message::Text(StompFrame::disconnect().encode()))
                    .await;
            }
            let _ = ws.close(None).await;
            if stop {
                break;
            }
            if tx
                .send(DashboardEvent::Push(PushStatus::Disconnected(channel)))
                .await
                .is_err()
            {
                break;
            }
            if sleep_or_stop(backoff, &mut shutdown).await {
                break;
            }
            backoff = next_backoff(backoff, self.config.max_backoff);
        }
        debug!(event = "push_stopped", channel = channel.as_str());
    }

    async fn establish(&self, channel: PushChannel, url: &Url) -> Result<WsStream, PushError> {
        let (mut ws, _) = connect_async(url.as_str()).await?;
        if channel == PushChannel::Stomp {
            let handshake = tokio::time::timeout(HANDSHAKE_TIMEOUT, self.stomp_handshake(&mut ws, url)).await;
            let failure = match handshake {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(err),
                Err(_) => Some(PushError::Handshake("timed out waiting for CONNECTED".to_string())),
            };
            if let Some(err) = failure {
                let _ = ws.close(None).await;
                return Err(err);
            }
        }
        Ok(ws)
    }

    /// CONNECT, wait for CONNECTED, then (re)subscribe to both topics.
    async fn stomp_handshake(&self, ws: &mut WsStream, url: &Url) -> Result<(), PushError> {
        let host = url.host_str().unwrap_or("localhost");
        let bearer = self.auth.bearer_header();
        let connect = StompFrame::connect(host, bearer.as_deref());
        ws.send(Message::Text(connect.encode())).await?;

        let mut decoder = StompFrameDecoder::new(self.config.max_frame_bytes);
        'handshake: loop {
            let message = ws.next().await.ok_or(PushError::Closed)??;
            let text = match message {
                Message::Text(text) => text,
                Message::Close(_) => return Err(PushError::Closed),
                _ => continue,
            };
            let report = decoder.push_text(&text);
            for err in report.errors {
                warn!(event = "push_frame_malformed", channel = "stomp", error = %err);
            }
            for frame in report.frames {
                match frame.command {
                    StompCommand::Connected => break 'handshake,
                    StompCommand::Error => return Err(PushError::Remote(error_message(&frame))),
                    other => {
                        return Err(PushError::Handshake(format!(
                            "unexpected {other} before CONNECTED"
                        )))
                    }
                }
            }
        }

        for (idx, topic) in [TASKS_TOPIC, TASK_ERRORS_TOPIC].into_iter().enumerate() {
            let subscribe = StompFrame::subscribe(&format!("sub-{idx}"), topic);
            ws.send(Message::Text(subscribe.encode())).await?;
        }
        Ok(())
    }

    /// Forwards inbound messages until the socket closes. Malformed payloads
    /// are dropped; only transport errors and server ERROR frames end the session.
    async fn pump(
        &self,
        channel: PushChannel,
        ws: &mut WsStream,
        tx: &mpsc::Sender<DashboardEvent>,
    ) -> Result<(), PushError> {
        let mut decoder = StompFrameDecoder::new(self.config.max_frame_bytes);
        while let Some(message) = ws.next().await {
            let text = match message? {
                Message::Text(text) => text,
                Message::Binary(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(_) => {
                        warn!(event = "push_binary_dropped", channel = channel.as_str());
                        continue;
                    }
                },
                Message::Close(_) => return Ok(()),
                _ => continue,
            };
            let observed_at = Utc::now();
            let updates = match channel {
                PushChannel::Raw => match route_raw(&text, observed_at) {
                    Ok(update) => vec![update],
                    Err(err) => {
                        warn!(event = "push_message_malformed", channel = "raw", error = %err);
                        Vec::new()
                    }
                },
                PushChannel::Stomp => stomp_updates(&mut decoder, &text, observed_at)?,
            };
            for update in updates {
                if tx.send(DashboardEvent::Update(update)).await.is_err() {
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

fn stomp_updates(
    decoder: &mut StompFrameDecoder,
    text: &str,
    observed_at: DateTime<Utc>,
) -> Result<Vec<Update>, PushError> {
    let report = decoder.push_text(text);
    for err in report.errors {
        warn!(event = "push_frame_malformed", channel = "stomp", error = %err);
    }
    let mut updates = Vec::new();
    for frame in report.frames {
        match frame.command {
            StompCommand::Message => match route_frame(&frame, observed_at) {
                Ok(Some(update)) => updates.push(update),
                Ok(None) => {}
                Err(err) => {
                    warn!(
                        event = "push_message_malformed",
                        channel = "stomp",
                        destination = frame.destination().unwrap_or_default(),
                        error = %err,
                    );
                }
            },
            StompCommand::Error => return Err(PushError::Remote(error_message(&frame))),
            other => debug!(event = "push_frame_ignored", command = other.as_str()),
        }
    }
    Ok(updates)
}

fn error_message(frame: &StompFrame) -> String {
    frame
        .header("message")
        .map(str::to_string)
        .unwrap_or_else(|| frame.body.trim().to_string())
}

async fn sleep_or_stop(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = stopped(shutdown) => true,
    }
}
