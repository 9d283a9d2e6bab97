//! # Realtime Session Registry
//!
//! Owns the `call_id → session` map and the lifecycle around the per-call
//! session tasks. The telephony side talks only to this manager: initialize
//! on call setup, fire-and-forget audio/text while the call runs, disconnect
//! on teardown. An idle sweeper reaps sessions nobody has touched within the
//! configured timeout.
//!
//! ## Thread Safety:
//! The registry is a `tokio::sync::RwLock<HashMap>` touched only for
//! insert, lookup and remove; all per-call state lives inside the session
//! task itself.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audio::queue::AudioQueueConfig;
use crate::config::AppConfig;
use crate::conversation::ConversationStore;
use crate::error::{AppError, AppResult};
use crate::events::NotificationBus;
use crate::openai::messages::{InputAudioTranscription, SessionConfig, TurnDetection};
use crate::openai::reconnect::ReconnectPolicy;
use crate::openai::session::{
    run_session, SessionCommand, SessionContext, SessionSettings, SessionStatus,
};
use crate::state::AppState;

struct SessionHandle {
    /// Distinguishes this spawn from a later one reusing the same call id,
    /// so a finishing task only removes its own registry entry.
    instance: Uuid,
    commands: mpsc::UnboundedSender<SessionCommand>,
    status: Arc<Mutex<SessionStatus>>,
    last_activity: Arc<Mutex<Instant>>,
    started_at: DateTime<Utc>,
    conversation_id: Option<String>,
    task: JoinHandle<()>,
}

/// Read-only view of one live session for the operational API.
#[derive(Debug, Clone, Serialize)]
pub struct CallSessionSnapshot {
    pub call_id: String,
    pub status: SessionStatus,
    pub conversation_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub idle_secs: u64,
}

pub struct RealtimeSessionManager {
    sessions: Arc<RwLock<HashMap<String, SessionHandle>>>,
    bus: NotificationBus,
    store: Arc<dyn ConversationStore>,
    state: AppState,
}

impl RealtimeSessionManager {
    pub fn new(bus: NotificationBus, store: Arc<dyn ConversationStore>, state: AppState) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            bus,
            store,
            state,
        }
    }

    /// Start a session for a call. Rejects a `call_id` that already has a
    /// live session; a finished leftover under the same id is replaced.
    pub async fn initialize(
        &self,
        call_id: &str,
        conversation_id: Option<String>,
        initial_prompt: Option<String>,
    ) -> AppResult<()> {
        let mut sessions = self.sessions.write().await;

        if let Some(existing) = sessions.get(call_id) {
            if !existing.task.is_finished() {
                return Err(AppError::BadRequest(format!(
                    "call {} already has an active session",
                    call_id
                )));
            }
            sessions.remove(call_id);
        }

        let config = self.state.get_config();
        let settings = Self::settings_from(&config, initial_prompt);
        let status = Arc::new(Mutex::new(SessionStatus::Initializing));
        let last_activity = Arc::new(Mutex::new(Instant::now()));
        let (tx, rx) = mpsc::unbounded_channel();
        let instance = Uuid::new_v4();

        let ctx = SessionContext {
            call_id: call_id.to_string(),
            conversation_id: conversation_id.clone(),
            settings,
            bus: self.bus.clone(),
            store: self.store.clone(),
            state: self.state.clone(),
            status: status.clone(),
            last_activity: last_activity.clone(),
        };

        let registry = self.sessions.clone();
        let owned_id = call_id.to_string();
        let task = tokio::spawn(async move {
            run_session(ctx, rx).await;
            let mut map = registry.write().await;
            if map.get(&owned_id).map(|h| h.instance) == Some(instance) {
                map.remove(&owned_id);
                debug!(call_id = %owned_id, "session removed from registry");
            }
        });

        sessions.insert(
            call_id.to_string(),
            SessionHandle {
                instance,
                commands: tx,
                status,
                last_activity,
                started_at: Utc::now(),
                conversation_id,
                task,
            },
        );

        info!(call_id = %call_id, "realtime session initialized");
        Ok(())
    }

    /// Forward one mu-law caller frame. Fire-and-forget: delivery into the
    /// session's mailbox never waits on the remote service.
    pub async fn send_audio_chunk(&self, call_id: &str, frame: Vec<u8>) -> AppResult<()> {
        let sessions = self.sessions.read().await;
        let handle = sessions
            .get(call_id)
            .ok_or_else(|| AppError::NotFound(format!("no session for call {}", call_id)))?;
        handle
            .commands
            .send(SessionCommand::SendAudio(frame))
            .map_err(|_| AppError::Internal(format!("session task for call {} is gone", call_id)))
    }

    /// Inject a text message into the conversation (operator or system).
    pub async fn send_text_message(&self, call_id: &str, text: String) -> AppResult<()> {
        let sessions = self.sessions.read().await;
        let handle = sessions
            .get(call_id)
            .ok_or_else(|| AppError::NotFound(format!("no session for call {}", call_id)))?;
        handle
            .commands
            .send(SessionCommand::SendText(text))
            .map_err(|_| AppError::Internal(format!("session task for call {} is gone", call_id)))
    }

    /// Tear a session down. Idempotent; an unknown id is a no-op.
    pub async fn disconnect(&self, call_id: &str) {
        let removed = self.sessions.write().await.remove(call_id);
        match removed {
            Some(handle) => {
                if handle.commands.send(SessionCommand::Disconnect).is_err() {
                    // Task already finished on its own.
                    debug!(call_id = %call_id, "session already ended");
                }
                info!(call_id = %call_id, "realtime session disconnected");
            }
            None => {
                debug!(call_id = %call_id, "disconnect for unknown call ignored");
            }
        }
    }

    /// Disconnect everything (graceful shutdown path).
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for call_id in ids {
            self.disconnect(&call_id).await;
        }
    }

    /// Snapshots of all registered sessions for `GET /api/v1/calls`.
    pub async fn snapshots(&self) -> Vec<CallSessionSnapshot> {
        let sessions = self.sessions.read().await;
        sessions
            .iter()
            .map(|(call_id, handle)| CallSessionSnapshot {
                call_id: call_id.clone(),
                status: *handle.status.lock().unwrap(),
                conversation_id: handle.conversation_id.clone(),
                started_at: handle.started_at,
                idle_secs: handle.last_activity.lock().unwrap().elapsed().as_secs(),
            })
            .collect()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Disconnect sessions idle longer than `idle_timeout` and prune
    /// finished tasks. Returns how many sessions were reaped.
    pub async fn sweep_idle(&self, idle_timeout: Duration) -> usize {
        let stale: Vec<String> = {
            let sessions = self.sessions.read().await;
            sessions
                .iter()
                .filter(|(_, handle)| {
                    handle.task.is_finished()
                        || handle.last_activity.lock().unwrap().elapsed() >= idle_timeout
                })
                .map(|(call_id, _)| call_id.clone())
                .collect()
        };

        for call_id in &stale {
            warn!(call_id = %call_id, "reaping idle session");
            self.disconnect(call_id).await;
        }
        stale.len()
    }

    /// Background task running the idle sweep on a fixed cadence, reading
    /// the timeout from the live configuration each round.
    pub fn spawn_idle_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let idle_timeout =
                    Duration::from_secs(manager.state.get_config().session.idle_timeout_secs);
                let reaped = manager.sweep_idle(idle_timeout).await;
                if reaped > 0 {
                    info!(reaped, "idle sweep reaped sessions");
                }
            }
        })
    }

    fn settings_from(config: &AppConfig, initial_prompt: Option<String>) -> SessionSettings {
        let instructions =
            initial_prompt.unwrap_or_else(|| config.openai.instructions.clone());

        SessionSettings {
            url: format!("{}?model={}", config.openai.realtime_url, config.openai.model),
            api_key: config.openai.api_key.clone(),
            session_config: SessionConfig {
                modalities: vec!["text".to_string(), "audio".to_string()],
                instructions,
                voice: config.openai.voice.clone(),
                input_audio_format: "pcm16".to_string(),
                output_audio_format: "pcm16".to_string(),
                turn_detection: TurnDetection::server_vad(
                    config.openai.vad_threshold,
                    config.openai.vad_prefix_padding_ms,
                    config.openai.vad_silence_duration_ms,
                ),
                input_audio_transcription: InputAudioTranscription {
                    model: config.openai.transcription_model.clone(),
                },
            },
            queue: AudioQueueConfig {
                max_pending_chunks: config.audio.max_pending_chunks,
                commit_batch_size: config.audio.commit_batch_size as u32,
            },
            commit_debounce: Duration::from_millis(config.audio.commit_debounce_ms),
            commit_ack_timeout: Duration::from_millis(config.audio.commit_ack_timeout_ms),
            response_fallback: Duration::from_millis(config.session.response_fallback_ms),
            ready_timeout: Duration::from_millis(config.session.session_ready_timeout_ms),
            reconnect: ReconnectPolicy {
                base_delay_ms: config.session.reconnect_base_delay_ms,
                max_delay_ms: config.session.reconnect_max_delay_ms,
                max_attempts: config.session.reconnect_max_attempts,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::InMemoryConversationStore;
    use crate::events::SessionEvent;

    /// Config pointing at a port nothing listens on, with a tiny retry
    /// budget so tests finish quickly.
    fn unreachable_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.openai.realtime_url = "ws://127.0.0.1:9".to_string();
        config.session.reconnect_base_delay_ms = 5;
        config.session.reconnect_max_delay_ms = 20;
        config.session.reconnect_max_attempts = 3;
        config.session.session_ready_timeout_ms = 500;
        config
    }

    fn manager_with(config: AppConfig) -> (Arc<RealtimeSessionManager>, NotificationBus) {
        let bus = NotificationBus::new();
        let store = Arc::new(InMemoryConversationStore::new());
        let state = AppState::new(config);
        (
            Arc::new(RealtimeSessionManager::new(bus.clone(), store, state)),
            bus,
        )
    }

    #[tokio::test]
    async fn test_duplicate_call_id_rejected() {
        let (manager, _bus) = manager_with(unreachable_config());

        manager.initialize("call-1", None, None).await.unwrap();
        let err = manager.initialize("call-1", None, None).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));

        manager.disconnect("call-1").await;
    }

    #[tokio::test]
    async fn test_exhausted_retries_fire_single_failure_event_and_remove_session() {
        let (manager, bus) = manager_with(unreachable_config());
        let mut events = bus.subscribe();

        manager.initialize("call-2", None, None).await.unwrap();

        let deadline = Duration::from_secs(5);
        let event = tokio::time::timeout(deadline, async {
            loop {
                let ev = events.recv().await.unwrap();
                if matches!(ev.event, SessionEvent::MaxReconnectFailed) {
                    break ev;
                }
            }
        })
        .await
        .expect("expected MaxReconnectFailed");
        assert_eq!(event.call_id, "call-2");

        // Exactly once: nothing further arrives.
        tokio::time::sleep(Duration::from_millis(100)).await;
        while let Ok(ev) = events.try_recv() {
            assert!(!matches!(ev.event, SessionEvent::MaxReconnectFailed));
        }

        // The finished task removes its own registry entry.
        let removed = tokio::time::timeout(deadline, async {
            loop {
                if manager.session_count().await == 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(removed.is_ok());
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent_and_unknown_is_noop() {
        let (manager, _bus) = manager_with(unreachable_config());

        manager.disconnect("never-existed").await;

        manager.initialize("call-3", None, None).await.unwrap();
        manager.disconnect("call-3").await;
        manager.disconnect("call-3").await;
        assert_eq!(manager.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_audio_to_unknown_call_is_not_found() {
        let (manager, _bus) = manager_with(unreachable_config());
        let err = manager
            .send_audio_chunk("ghost", vec![0xFF; 160])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_status_reports_reconnecting_during_backoff_wait() {
        let mut config = unreachable_config();
        config.session.reconnect_base_delay_ms = 500;
        config.session.reconnect_max_delay_ms = 1_000;
        config.session.reconnect_max_attempts = 5;
        let (manager, _bus) = manager_with(config);

        manager.initialize("call-6", None, None).await.unwrap();

        // Connect refusal is near-instant, so the session spends almost all
        // of its time inside the backoff wait; the snapshot must say so.
        let observed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let snapshots = manager.snapshots().await;
                if snapshots
                    .iter()
                    .any(|s| s.status == SessionStatus::Reconnecting)
                {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(observed.is_ok());

        manager.disconnect("call-6").await;
    }

    #[tokio::test]
    async fn test_idle_sweep_reaps_stale_sessions() {
        let (manager, _bus) = manager_with(unreachable_config());
        manager.initialize("call-4", None, None).await.unwrap();

        let reaped = manager.sweep_idle(Duration::ZERO).await;
        assert_eq!(reaped, 1);
        assert_eq!(manager.session_count().await, 0);
    }

    #[test]
    fn test_settings_resolution() {
        let mut config = AppConfig::default();
        config.openai.model = "gpt-4o-realtime-preview".to_string();
        let settings =
            RealtimeSessionManager::settings_from(&config, Some("say hello".to_string()));

        assert!(settings.url.ends_with("?model=gpt-4o-realtime-preview"));
        assert_eq!(settings.session_config.instructions, "say hello");
        assert_eq!(settings.queue.max_pending_chunks, 50);
        assert_eq!(settings.reconnect.max_attempts, 5);
    }
}
