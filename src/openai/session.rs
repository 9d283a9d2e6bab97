//! # Per-Call Realtime Session Task
//!
//! One tokio task per active call. The task exclusively owns the WebSocket
//! to the speech service; everything else talks to it through an mpsc
//! command channel and hears back through the notification bus.
//!
//! ## Lifecycle:
//! Initializing → Connecting → Connected → (handshake: `session.created`,
//! `session.update`, `session.updated`) → session-ready. Abnormal socket
//! loss or an invalidated remote session moves to Reconnecting and re-runs
//! the handshake; a normal close, a `Disconnect` command or an exhausted
//! retry budget ends in Closed/Error and the task returns.
//!
//! ## Audio path:
//! Caller frames arrive already in mu-law @ 8 kHz, are transcoded up to
//! base64 PCM16 @ 24 kHz, and are either queued (handshake in flight) or
//! appended immediately. Commits are batched and debounced with at most one
//! in flight; the pending queue is flushed as appends-then-commit the moment
//! the session becomes ready.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, trace, warn};

use crate::audio::queue::{AudioQueueConfig, CommitTracker, PendingAudioQueue};
use crate::audio::transcode::{mulaw_to_service_b64, service_b64_to_mulaw};
use crate::conversation::ConversationStore;
use crate::error::{AppError, AppResult};
use crate::events::{NotificationBus, SessionEvent};
use crate::openai::messages::{ClientEvent, ConversationItem, ServerEvent, SessionConfig};
use crate::openai::reconnect::ReconnectPolicy;
use crate::openai::timers::ScheduledTask;
use crate::state::AppState;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Where a call session currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Initializing,
    Connecting,
    Connected,
    Reconnecting,
    Timeout,
    Error,
    Closed,
}

/// Commands accepted by a session task.
#[derive(Debug)]
pub enum SessionCommand {
    /// A caller audio frame, mu-law @ 8 kHz.
    SendAudio(Vec<u8>),

    /// Inject a text message into the conversation and request a response.
    SendText(String),

    /// Tear the session down. Idempotent.
    Disconnect,
}

/// Everything a session needs to connect and run, resolved from `AppConfig`
/// by the manager.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Full WebSocket URL including the model query parameter.
    pub url: String,
    pub api_key: String,
    pub session_config: SessionConfig,
    pub queue: AudioQueueConfig,
    pub commit_debounce: Duration,
    pub commit_ack_timeout: Duration,
    pub response_fallback: Duration,
    pub ready_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

/// Shared context handed to the session task on spawn.
pub(crate) struct SessionContext {
    pub call_id: String,
    pub conversation_id: Option<String>,
    pub settings: SessionSettings,
    pub bus: NotificationBus,
    pub store: Arc<dyn ConversationStore>,
    pub state: AppState,
    pub status: Arc<Mutex<SessionStatus>>,
    pub last_activity: Arc<Mutex<Instant>>,
}

/// What happened to one submitted caller frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AudioOutcome {
    /// Buffered until the handshake completes.
    Queued,

    /// Discarded (queue full or nothing to transcode).
    Dropped,

    /// Appended on the socket; `committed` when a batch commit went with it.
    Sent { committed: bool },
}

/// Socket-independent session state: readiness, the pending queue and the
/// commit ledger. Kept separate from the task loop so the scheduling rules
/// stay unit-testable.
pub(crate) struct SessionCore {
    queue: PendingAudioQueue,
    commits: CommitTracker,
    config: AudioQueueConfig,
    pub ready: bool,
    config_sent: bool,
    pub remote_session_id: Option<String>,
}

impl SessionCore {
    pub fn new(config: AudioQueueConfig) -> Self {
        Self {
            queue: PendingAudioQueue::new(config.max_pending_chunks),
            commits: CommitTracker::new(),
            config,
            ready: false,
            config_sent: false,
            remote_session_id: None,
        }
    }

    /// Reset per-attempt state. The pending queue survives so frames
    /// captured during an outage still reach the next connection.
    pub fn begin_attempt(&mut self) {
        self.ready = false;
        self.config_sent = false;
        self.commits.reset();
    }

    /// The remote session announced itself; the configuration is declared
    /// exactly once per connection attempt.
    pub fn on_session_created(&mut self, remote_id: String) -> bool {
        self.remote_session_id = Some(remote_id);
        if self.config_sent {
            return false;
        }
        self.config_sent = true;
        true
    }

    /// Accept one mu-law frame from the telephony side. Returns the events
    /// to put on the wire (possibly none) and what became of the frame.
    pub fn accept_audio(&mut self, mulaw: &[u8]) -> (Vec<ClientEvent>, AudioOutcome) {
        let Some(b64) = mulaw_to_service_b64(mulaw) else {
            return (Vec::new(), AudioOutcome::Dropped);
        };

        if !self.ready {
            let outcome = if self.queue.push(b64) {
                AudioOutcome::Queued
            } else {
                AudioOutcome::Dropped
            };
            return (Vec::new(), outcome);
        }

        let mut events = vec![ClientEvent::InputAudioBufferAppend { audio: b64 }];
        self.commits.record_append();

        let committed =
            self.commits.batch_ready(self.config.commit_batch_size) && self.commits.begin_commit();
        if committed {
            events.push(ClientEvent::InputAudioBufferCommit);
        }

        (events, AudioOutcome::Sent { committed })
    }

    /// Session became ready: flush the backlog as ordered appends followed
    /// by a single commit. Repeated `session.updated` frames are no-ops.
    pub fn mark_ready(&mut self) -> Vec<ClientEvent> {
        if self.ready {
            return Vec::new();
        }
        self.ready = true;

        let mut events = Vec::new();
        for b64 in self.queue.drain() {
            self.commits.record_append();
            events.push(ClientEvent::InputAudioBufferAppend { audio: b64 });
        }
        if !events.is_empty() && self.commits.begin_commit() {
            events.push(ClientEvent::InputAudioBufferCommit);
        }
        events
    }

    /// Debounce expired: commit whatever has accumulated, if anything.
    pub fn commit_due(&mut self) -> Option<ClientEvent> {
        if self.ready && self.commits.begin_commit() {
            Some(ClientEvent::InputAudioBufferCommit)
        } else {
            None
        }
    }

    pub fn commit_acked(&mut self) {
        self.commits.ack_commit();
    }

    /// Ack never arrived; release the guard so audio keeps flowing. The
    /// append counter is kept so the next commit covers those frames.
    pub fn commit_timed_out(&mut self) {
        self.commits.abort_commit();
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }
}

/// Internal wakeups produced by the session's timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerEvent {
    ConnectTimeout,
    CommitDebounce,
    CommitAckTimeout,
    ResponseFallback,
}

/// All four per-call timers. Dropping the set cancels everything, so none
/// survive a reconnect or teardown.
#[derive(Default)]
struct SessionTimers {
    connect: ScheduledTask,
    debounce: ScheduledTask,
    commit_ack: ScheduledTask,
    response_fallback: ScheduledTask,
}

impl SessionTimers {
    fn arm(
        task: &mut ScheduledTask,
        delay: Duration,
        event: TimerEvent,
        tx: &mpsc::UnboundedSender<TimerEvent>,
    ) {
        let tx = tx.clone();
        task.arm(delay, move || {
            let _ = tx.send(event);
        });
    }

    /// Every sent commit gets the same pair of followups: the ack safety
    /// timeout and the response fallback.
    fn arm_commit_followups(
        &mut self,
        ack_timeout: Duration,
        fallback: Duration,
        tx: &mpsc::UnboundedSender<TimerEvent>,
    ) {
        Self::arm(
            &mut self.commit_ack,
            ack_timeout,
            TimerEvent::CommitAckTimeout,
            tx,
        );
        Self::arm(
            &mut self.response_fallback,
            fallback,
            TimerEvent::ResponseFallback,
            tx,
        );
    }
}

/// How the inner socket loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Reconnect,
    Closed,
}

fn is_abnormal_close(code: Option<CloseCode>) -> bool {
    match code {
        None => true,
        Some(CloseCode::Normal) => false,
        Some(code) => {
            let raw: u16 = code.into();
            !(4000..=4999).contains(&raw)
        }
    }
}

async fn connect(settings: &SessionSettings) -> AppResult<(WsSink, WsStream)> {
    let mut request = settings
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| AppError::Transport(format!("invalid realtime URL: {}", e)))?;

    let auth = HeaderValue::from_str(&format!("Bearer {}", settings.api_key))
        .map_err(|e| AppError::Transport(format!("invalid API key header: {}", e)))?;
    request.headers_mut().insert(AUTHORIZATION, auth);
    request
        .headers_mut()
        .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

    let (ws, _) = connect_async(request).await?;
    Ok(ws.split())
}

async fn send_event(sink: &mut WsSink, event: &ClientEvent) -> AppResult<()> {
    let json = serde_json::to_string(event)?;
    sink.send(Message::Text(json)).await?;
    Ok(())
}

async fn send_all(sink: &mut WsSink, events: &[ClientEvent]) -> AppResult<()> {
    for event in events {
        send_event(sink, event).await?;
    }
    Ok(())
}

fn set_status(status: &Arc<Mutex<SessionStatus>>, value: SessionStatus) {
    *status.lock().unwrap() = value;
}

fn touch(last_activity: &Arc<Mutex<Instant>>) {
    *last_activity.lock().unwrap() = Instant::now();
}

/// The session task body. Returns when the call is over, one way or another;
/// the manager removes the registry entry afterwards.
pub(crate) async fn run_session(
    ctx: SessionContext,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
) {
    let mut core = SessionCore::new(ctx.settings.queue.clone());
    let policy = ctx.settings.reconnect.clone();
    let mut attempts: u32 = 0;
    let mut greeted = false;

    loop {
        set_status(
            &ctx.status,
            if attempts == 0 {
                SessionStatus::Connecting
            } else {
                SessionStatus::Reconnecting
            },
        );

        let connected = match tokio::time::timeout(ctx.settings.ready_timeout, connect(&ctx.settings))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(AppError::Transport("connect timed out".to_string())),
        };
        let (mut sink, mut stream) = match connected {
            Ok(pair) => pair,
            Err(e) => {
                warn!(call_id = %ctx.call_id, error = %e, "realtime connect failed");
                attempts += 1;
                ctx.state.record_reconnect_attempt();
                if !policy.should_retry(attempts) {
                    abandon(&ctx, &mut core);
                    return;
                }
                set_status(&ctx.status, SessionStatus::Reconnecting);
                // Readiness is per-socket: frames arriving during the wait
                // must land in the pending queue.
                core.begin_attempt();
                if !backoff_wait(&ctx, &mut core, &mut commands, policy.next_delay(attempts - 1))
                    .await
                {
                    set_status(&ctx.status, SessionStatus::Closed);
                    ctx.bus.publish(&ctx.call_id, SessionEvent::SessionClosed);
                    return;
                }
                continue;
            }
        };

        if attempts > 0 {
            info!(call_id = %ctx.call_id, attempt = attempts, "realtime session reconnected");
            ctx.bus
                .publish(&ctx.call_id, SessionEvent::Reconnected { attempt: attempts });
        } else {
            info!(call_id = %ctx.call_id, "realtime session connected");
        }
        set_status(&ctx.status, SessionStatus::Connected);
        attempts = 0;
        core.begin_attempt();

        let (timer_tx, mut timer_rx) = mpsc::unbounded_channel();
        let mut timers = SessionTimers::default();
        SessionTimers::arm(
            &mut timers.connect,
            ctx.settings.ready_timeout,
            TimerEvent::ConnectTimeout,
            &timer_tx,
        );

        let flow = 'socket: loop {
            tokio::select! {
                cmd = commands.recv() => {
                    match cmd {
                        None | Some(SessionCommand::Disconnect) => {
                            debug!(call_id = %ctx.call_id, "disconnect requested");
                            let _ = sink.send(Message::Close(None)).await;
                            break 'socket Flow::Closed;
                        }
                        Some(SessionCommand::SendAudio(frame)) => {
                            touch(&ctx.last_activity);
                            let (events, outcome) = core.accept_audio(&frame);
                            match outcome {
                                AudioOutcome::Dropped => {
                                    ctx.state.record_frames_dropped(1);
                                }
                                AudioOutcome::Queued => {}
                                AudioOutcome::Sent { committed } => {
                                    ctx.state.record_frames_forwarded(1);
                                    if let Err(e) = send_all(&mut sink, &events).await {
                                        warn!(call_id = %ctx.call_id, error = %e, "audio send failed");
                                        break 'socket Flow::Reconnect;
                                    }
                                    if committed {
                                        timers.debounce.cancel();
                                        timers.arm_commit_followups(
                                            ctx.settings.commit_ack_timeout,
                                            ctx.settings.response_fallback,
                                            &timer_tx,
                                        );
                                    } else {
                                        SessionTimers::arm(&mut timers.debounce,
                                            ctx.settings.commit_debounce,
                                            TimerEvent::CommitDebounce, &timer_tx);
                                    }
                                }
                            }
                        }
                        Some(SessionCommand::SendText(text)) => {
                            touch(&ctx.last_activity);
                            let events = [
                                ClientEvent::ConversationItemCreate {
                                    item: ConversationItem::text_message("user", &text),
                                },
                                ClientEvent::ResponseCreate,
                            ];
                            if let Err(e) = send_all(&mut sink, &events).await {
                                warn!(call_id = %ctx.call_id, error = %e, "text send failed");
                                break 'socket Flow::Reconnect;
                            }
                        }
                    }
                }
                timer = timer_rx.recv() => {
                    // The sender lives in this scope, so recv can't yield None.
                    let Some(timer) = timer else { break 'socket Flow::Closed };
                    match timer {
                        TimerEvent::ConnectTimeout => {
                            warn!(call_id = %ctx.call_id, "session not ready before timeout");
                            set_status(&ctx.status, SessionStatus::Timeout);
                            let _ = sink.send(Message::Close(None)).await;
                            break 'socket Flow::Reconnect;
                        }
                        TimerEvent::CommitDebounce => {
                            if let Some(event) = core.commit_due() {
                                if let Err(e) = send_event(&mut sink, &event).await {
                                    warn!(call_id = %ctx.call_id, error = %e, "commit send failed");
                                    break 'socket Flow::Reconnect;
                                }
                                timers.arm_commit_followups(
                                    ctx.settings.commit_ack_timeout,
                                    ctx.settings.response_fallback,
                                    &timer_tx,
                                );
                            }
                        }
                        TimerEvent::CommitAckTimeout => {
                            warn!(call_id = %ctx.call_id, "commit ack overdue, releasing guard");
                            core.commit_timed_out();
                        }
                        TimerEvent::ResponseFallback => {
                            if core.ready {
                                debug!(call_id = %ctx.call_id, "no response observed, requesting one");
                                if send_event(&mut sink, &ClientEvent::ResponseCreate).await.is_err() {
                                    break 'socket Flow::Reconnect;
                                }
                            }
                        }
                    }
                }
                frame = stream.next() => {
                    match frame {
                        None => {
                            warn!(call_id = %ctx.call_id, "realtime socket ended without close frame");
                            break 'socket Flow::Reconnect;
                        }
                        Some(Err(e)) => {
                            warn!(call_id = %ctx.call_id, error = %e, "realtime socket error");
                            break 'socket Flow::Reconnect;
                        }
                        Some(Ok(Message::Text(text))) => {
                            touch(&ctx.last_activity);
                            match handle_server_event(&ctx, &mut core, &mut sink, &mut timers, &timer_tx, &text, &mut greeted).await {
                                Ok(Flow::Continue) => {}
                                Ok(flow) => break 'socket flow,
                                Err(e) => {
                                    warn!(call_id = %ctx.call_id, error = %e, "handshake send failed");
                                    break 'socket Flow::Reconnect;
                                }
                            }
                        }
                        Some(Ok(Message::Close(close))) => {
                            let code = close.as_ref().map(|f| f.code);
                            if is_abnormal_close(code) {
                                warn!(call_id = %ctx.call_id, ?code, "abnormal close, will reconnect");
                                break 'socket Flow::Reconnect;
                            }
                            info!(call_id = %ctx.call_id, ?code, "realtime session closed by server");
                            break 'socket Flow::Closed;
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = sink.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(_)) => {}
                    }
                }
            }
        };

        drop(timers);

        match flow {
            Flow::Reconnect => {
                attempts += 1;
                ctx.state.record_reconnect_attempt();
                if !policy.should_retry(attempts) {
                    abandon(&ctx, &mut core);
                    return;
                }
                let delay = policy.next_delay(attempts - 1);
                debug!(call_id = %ctx.call_id, attempt = attempts, ?delay, "reconnecting after delay");
                set_status(&ctx.status, SessionStatus::Reconnecting);
                // Readiness is per-socket: frames arriving during the wait
                // must land in the pending queue.
                core.begin_attempt();
                if !backoff_wait(&ctx, &mut core, &mut commands, delay).await {
                    set_status(&ctx.status, SessionStatus::Closed);
                    ctx.bus.publish(&ctx.call_id, SessionEvent::SessionClosed);
                    return;
                }
            }
            Flow::Closed | Flow::Continue => {
                set_status(&ctx.status, SessionStatus::Closed);
                ctx.bus.publish(&ctx.call_id, SessionEvent::SessionClosed);
                return;
            }
        }
    }
}

/// Wait out a reconnect delay without going deaf: caller audio keeps landing
/// in the pending queue and a disconnect request ends the wait. Returns false
/// when the session should shut down instead of retrying.
async fn backoff_wait(
    ctx: &SessionContext,
    core: &mut SessionCore,
    commands: &mut mpsc::UnboundedReceiver<SessionCommand>,
    delay: Duration,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            cmd = commands.recv() => match cmd {
                None | Some(SessionCommand::Disconnect) => return false,
                Some(SessionCommand::SendAudio(frame)) => {
                    touch(&ctx.last_activity);
                    let (_, outcome) = core.accept_audio(&frame);
                    if outcome == AudioOutcome::Dropped {
                        ctx.state.record_frames_dropped(1);
                    }
                }
                Some(SessionCommand::SendText(_)) => {
                    debug!(call_id = %ctx.call_id, "text message dropped while reconnecting");
                }
            }
        }
    }
}

/// Retry budget exhausted: announce the failure exactly once and end the
/// task. Fatal for this call only.
fn abandon(ctx: &SessionContext, core: &mut SessionCore) {
    error!(
        call_id = %ctx.call_id,
        dropped = core.dropped(),
        "reconnect budget exhausted, abandoning session"
    );
    set_status(&ctx.status, SessionStatus::Error);
    ctx.bus
        .publish(&ctx.call_id, SessionEvent::MaxReconnectFailed);
}

#[allow(clippy::too_many_arguments)]
async fn handle_server_event(
    ctx: &SessionContext,
    core: &mut SessionCore,
    sink: &mut WsSink,
    timers: &mut SessionTimers,
    timer_tx: &mpsc::UnboundedSender<TimerEvent>,
    text: &str,
    greeted: &mut bool,
) -> AppResult<Flow> {
    let event: ServerEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(e) => {
            trace!(call_id = %ctx.call_id, error = %e, "unparseable server frame ignored");
            return Ok(Flow::Continue);
        }
    };

    match event {
        ServerEvent::SessionCreated { session } => {
            debug!(call_id = %ctx.call_id, remote = %session.id, "remote session created");
            if core.on_session_created(session.id) {
                send_event(
                    sink,
                    &ClientEvent::SessionUpdate {
                        session: ctx.settings.session_config.clone(),
                    },
                )
                .await?;
            }
        }

        ServerEvent::SessionUpdated { .. } => {
            let backlog = core.queued();
            let events = core.mark_ready();
            if !events.is_empty() {
                info!(
                    call_id = %ctx.call_id,
                    flushed = backlog,
                    "session ready, flushing pending audio"
                );
                let committed = matches!(events.last(), Some(ClientEvent::InputAudioBufferCommit));
                send_all(sink, &events).await?;
                ctx.state.record_frames_forwarded(backlog as u64);
                if committed {
                    timers.arm_commit_followups(
                        ctx.settings.commit_ack_timeout,
                        ctx.settings.response_fallback,
                        timer_tx,
                    );
                }
            }
            timers.connect.cancel();
            if !*greeted {
                *greeted = true;
                ctx.bus.publish(&ctx.call_id, SessionEvent::SessionReady);
                // The agent opens the call rather than waiting in silence.
                send_event(sink, &ClientEvent::ResponseCreate).await?;
            }
        }

        ServerEvent::ResponseAudioDelta { delta } => {
            timers.response_fallback.cancel();
            if let Some(audio) = service_b64_to_mulaw(&delta) {
                ctx.bus
                    .publish(&ctx.call_id, SessionEvent::AudioChunk { audio });
            }
        }

        ServerEvent::ResponseContentPartAdded { part } => {
            if let Some(b64) = part.audio.as_deref() {
                if let Some(audio) = service_b64_to_mulaw(b64) {
                    ctx.bus
                        .publish(&ctx.call_id, SessionEvent::AudioChunk { audio });
                }
            }
        }

        ServerEvent::ConversationItemCreated { item } => {
            persist_conversation_item(ctx, &item).await;
        }

        ServerEvent::SpeechStarted => {
            ctx.bus.publish(&ctx.call_id, SessionEvent::SpeechStarted);
        }

        ServerEvent::SpeechStopped => {
            ctx.bus.publish(&ctx.call_id, SessionEvent::SpeechStopped);
            timers.response_fallback.cancel();
            if core.ready {
                send_event(sink, &ClientEvent::ResponseCreate).await?;
            }
        }

        ServerEvent::InputAudioBufferCommitted => {
            core.commit_acked();
            timers.commit_ack.cancel();
        }

        ServerEvent::InputAudioBufferCleared => {
            core.commit_acked();
            timers.commit_ack.cancel();
        }

        ServerEvent::ResponseDone => {
            timers.response_fallback.cancel();
        }

        ServerEvent::Error { error } => {
            if error.is_benign() {
                debug!(call_id = %ctx.call_id, message = %error.message, "benign service error");
            } else if error.is_session_invalid() {
                warn!(call_id = %ctx.call_id, code = ?error.code, "remote session invalidated");
                set_status(&ctx.status, SessionStatus::Reconnecting);
                let _ = sink.send(Message::Close(None)).await;
                return Ok(Flow::Reconnect);
            } else {
                warn!(call_id = %ctx.call_id, code = ?error.code, message = %error.message, "service error");
                ctx.bus.publish(
                    &ctx.call_id,
                    SessionEvent::SessionError {
                        message: error.message,
                    },
                );
            }
        }

        ServerEvent::SessionExpired => {
            warn!(call_id = %ctx.call_id, "remote session expired");
            set_status(&ctx.status, SessionStatus::Reconnecting);
            let _ = sink.send(Message::Close(None)).await;
            return Ok(Flow::Reconnect);
        }

        ServerEvent::Unknown => {
            trace!(call_id = %ctx.call_id, "unhandled server event ignored");
        }
    }

    Ok(Flow::Continue)
}

/// Persist a finished utterance through the collaborator and mirror it on
/// the bus. A function-call item becomes a `FunctionCall` event instead.
async fn persist_conversation_item(ctx: &SessionContext, item: &ConversationItem) {
    if item.item_type == "function_call" {
        if let Some(name) = item.name.clone() {
            ctx.bus.publish(
                &ctx.call_id,
                SessionEvent::FunctionCall {
                    name,
                    arguments: item.arguments.clone().unwrap_or_default(),
                },
            );
        }
        return;
    }

    let Some(role) = item.role.as_deref() else {
        return;
    };

    let text: String = item
        .content
        .iter()
        .filter_map(|part| part.text.as_deref().or(part.transcript.as_deref()))
        .collect::<Vec<_>>()
        .join(" ");
    if text.trim().is_empty() {
        return;
    }

    if let Some(conversation_id) = ctx.conversation_id.as_deref() {
        if let Err(e) = ctx.store.append_message(conversation_id, role, &text).await {
            warn!(call_id = %ctx.call_id, error = %e, "failed to persist utterance");
        }
    }

    ctx.bus.publish(
        &ctx.call_id,
        SessionEvent::TextMessage {
            role: role.to_string(),
            content: text,
        },
    );
}
