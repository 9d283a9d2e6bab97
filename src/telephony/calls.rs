//! # Telephony Channel Session Manager
//!
//! Owns the lifecycle of each inbound call on the Asterisk side: answer the
//! channel, build the mixing bridge and recording, link the call to a
//! conversation record and a realtime AI session, feed AI audio back as
//! playbacks, and tear everything down when the channel goes away.
//!
//! ## Cleanup discipline:
//! Every teardown step is independently best-effort. A failed bridge destroy
//! must not stop the hangup, and vice versa; the worst case is a leaked
//! bridge that Asterisk reaps on its own.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::conversation::{ConversationFields, ConversationStore};
use crate::error::AppResult;
use crate::events::{CallEvent, NotificationBus, SessionEvent};
use crate::openai::RealtimeSessionManager;
use crate::state::AppState;
use crate::telephony::ari::{AriClient, AriEvent, Channel};

/// Whether a channel record still refers to a live call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Active,
    Destroyed,
}

/// Bookkeeping for one bridged call, keyed by the Asterisk channel id.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelRecord {
    pub channel_id: String,
    pub bridge_id: String,
    pub conversation_id: Option<String>,
    pub start_time: DateTime<Utc>,
    pub state: ChannelState,
    pub snoop_channel_id: Option<String>,
}

/// A caller id that is itself a patient record id: 24 hex characters.
fn is_patient_id(s: &str) -> bool {
    s.len() == 24 && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Parse `key=value&key=value` metadata, URL-decoding both sides. Malformed
/// pairs are skipped.
fn parse_call_metadata(raw: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for pair in raw.split('&') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        let key = urlencoding::decode(key).map(|c| c.into_owned());
        let value = urlencoding::decode(value).map(|c| c.into_owned());
        if let (Ok(key), Ok(value)) = (key, value) {
            if !key.is_empty() {
                out.insert(key, value);
            }
        }
    }
    out
}

/// Resolve a patient id from what arrived with the channel: a hex caller id
/// wins, otherwise the Stasis app arguments are searched for a `patientId`
/// pair.
fn patient_id_from_channel(caller_number: &str, args: &[String]) -> Option<String> {
    if is_patient_id(caller_number) {
        return Some(caller_number.to_string());
    }
    for arg in args {
        if let Some(id) = parse_call_metadata(arg).remove("patientId") {
            if !id.is_empty() {
                return Some(id);
            }
        }
    }
    None
}

pub struct CallSessionManager {
    ari: Arc<AriClient>,
    realtime: Arc<RealtimeSessionManager>,
    store: Arc<dyn ConversationStore>,
    bus: NotificationBus,
    state: AppState,
    channels: Arc<RwLock<HashMap<String, ChannelRecord>>>,
}

impl CallSessionManager {
    pub fn new(
        ari: Arc<AriClient>,
        realtime: Arc<RealtimeSessionManager>,
        store: Arc<dyn ConversationStore>,
        bus: NotificationBus,
        state: AppState,
    ) -> Self {
        Self {
            ari,
            realtime,
            store,
            bus,
            state,
            channels: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn active_channels(&self) -> Vec<ChannelRecord> {
        self.channels.read().await.values().cloned().collect()
    }

    /// Consume ARI events until the socket drops; reconnects with a fixed
    /// delay. Runs for the life of the process.
    pub fn spawn_ari_event_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match manager.ari.connect_events().await {
                    Ok(mut stream) => {
                        info!(app = manager.ari.app_name(), "ARI event socket connected");
                        while let Some(event) = AriClient::next_event(&mut stream).await {
                            manager.dispatch(event).await;
                        }
                        warn!("ARI event socket closed, reconnecting");
                    }
                    Err(e) => {
                        warn!(error = %e, "ARI event socket connect failed");
                    }
                }
                tokio::time::sleep(Duration::from_secs(3)).await;
            }
        })
    }

    /// Forward bus traffic back into telephony: AI audio becomes playback,
    /// an abandoned session tears its call down.
    pub fn spawn_event_forwarder(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let mut events = manager.bus.subscribe();
        tokio::spawn(async move {
            while let Some(CallEvent { call_id, event }) = events.recv().await {
                match event {
                    SessionEvent::AudioChunk { audio } => {
                        manager.play_audio_chunk(&call_id, audio).await;
                    }
                    SessionEvent::MaxReconnectFailed => {
                        warn!(call_id = %call_id, "AI session abandoned, ending call");
                        manager.cleanup_call(&call_id).await;
                    }
                    SessionEvent::SessionError { message } => {
                        warn!(call_id = %call_id, message = %message, "AI session error");
                    }
                    other => {
                        trace!(call_id = %call_id, event = ?other, "bus event");
                    }
                }
            }
        })
    }

    async fn dispatch(&self, event: AriEvent) {
        match event {
            AriEvent::StasisStart { channel, args } => {
                self.handle_stasis_start(channel, args).await;
            }
            AriEvent::StasisEnd { channel }
            | AriEvent::ChannelDestroyed { channel }
            | AriEvent::ChannelHangupRequest { channel } => {
                self.cleanup_call(&channel.id).await;
            }
            AriEvent::ChannelDtmfReceived { channel, digit } => {
                self.handle_dtmf(&channel.id, &digit).await;
            }
            AriEvent::Unknown => {}
        }
    }

    pub async fn handle_stasis_start(&self, channel: Channel, args: Vec<String>) {
        info!(
            channel_id = %channel.id,
            caller = %channel.caller.number,
            "inbound channel entered application"
        );
        if let Err(e) = self.setup_call(&channel, &args).await {
            error!(channel_id = %channel.id, error = %e, "call setup failed, hanging up");
            if let Err(e) = self.ari.hangup(&channel.id).await {
                warn!(channel_id = %channel.id, error = %e, "hangup after failed setup also failed");
            }
        }
    }

    async fn setup_call(&self, channel: &Channel, args: &[String]) -> AppResult<()> {
        self.ari.answer(&channel.id).await?;

        let bridge = self
            .ari
            .create_mixing_bridge(&format!("wellness-{}", channel.id))
            .await?;

        let result = self.finish_setup(channel, args, &bridge.id).await;
        if result.is_err() {
            if let Err(e) = self.ari.destroy_bridge(&bridge.id).await {
                warn!(bridge_id = %bridge.id, error = %e, "bridge teardown after failed setup");
            }
        }
        result
    }

    async fn finish_setup(
        &self,
        channel: &Channel,
        args: &[String],
        bridge_id: &str,
    ) -> AppResult<()> {
        let config = self.state.get_config();

        self.ari
            .record_bridge(
                bridge_id,
                &format!("wellness-{}", channel.id),
                config.session.recording_max_duration_secs,
            )
            .await?;
        self.ari.add_channel_to_bridge(bridge_id, &channel.id).await?;

        let mut patient_id = patient_id_from_channel(&channel.caller.number, args);
        if patient_id.is_none() {
            // Dialplan can also pass metadata through a channel variable.
            if let Ok(Some(raw)) = self
                .ari
                .get_channel_variable(&channel.id, "WELLNESS_METADATA")
                .await
            {
                patient_id = parse_call_metadata(&raw).remove("patientId");
            }
        }

        let conversation_id = match self
            .store
            .create_or_update_conversation(ConversationFields {
                channel_id: channel.id.clone(),
                patient_id: patient_id.clone(),
                started_at: Some(Utc::now()),
            })
            .await
        {
            Ok(conversation) => Some(conversation.id),
            Err(e) => {
                // The call proceeds unlinked rather than failing.
                warn!(channel_id = %channel.id, error = %e, "conversation record save failed");
                None
            }
        };

        let prompt = self.build_prompt(&config.openai.instructions, patient_id.as_deref()).await;
        self.realtime
            .initialize(&channel.id, conversation_id.clone(), prompt)
            .await?;

        self.channels.write().await.insert(
            channel.id.clone(),
            ChannelRecord {
                channel_id: channel.id.clone(),
                bridge_id: bridge_id.to_string(),
                conversation_id,
                start_time: Utc::now(),
                state: ChannelState::Active,
                snoop_channel_id: None,
            },
        );
        self.state.call_started();
        info!(channel_id = %channel.id, bridge_id, "call bridged to AI session");
        Ok(())
    }

    /// Personalize the agent instructions when the patient is known.
    async fn build_prompt(&self, base: &str, patient_id: Option<&str>) -> Option<String> {
        let patient_id = patient_id?;
        match self.store.find_patient_by_id(patient_id).await {
            Ok(Some(patient)) => Some(format!(
                "{} You are speaking with {}; greet them by name.",
                base, patient.name
            )),
            Ok(None) => None,
            Err(e) => {
                warn!(patient_id, error = %e, "patient lookup failed");
                None
            }
        }
    }

    /// Tear a call down. Safe to call multiple times and for unknown ids;
    /// each step proceeds regardless of earlier failures.
    pub async fn cleanup_call(&self, channel_id: &str) {
        let record = self.channels.write().await.remove(channel_id);
        let Some(mut record) = record else {
            // No channel bookkeeping, but a session may still exist.
            self.realtime.disconnect(channel_id).await;
            return;
        };
        record.state = ChannelState::Destroyed;

        if let Some(snoop_id) = &record.snoop_channel_id {
            if let Err(e) = self.ari.hangup(snoop_id).await {
                debug!(snoop_id = %snoop_id, error = %e, "snoop hangup failed");
            }
        }

        if let Some(conversation_id) = &record.conversation_id {
            if let Err(e) = self
                .store
                .mark_conversation_completed(conversation_id, Utc::now())
                .await
            {
                warn!(conversation_id = %conversation_id, error = %e, "failed to complete conversation");
            }
        }

        if let Err(e) = self.ari.destroy_bridge(&record.bridge_id).await {
            debug!(bridge_id = %record.bridge_id, error = %e, "bridge destroy failed");
        }

        if let Err(e) = self.ari.hangup(channel_id).await {
            debug!(channel_id, error = %e, "channel hangup failed");
        }

        self.realtime.disconnect(channel_id).await;
        self.state.call_ended();
        info!(
            channel_id,
            state = ?record.state,
            duration_secs = (Utc::now() - record.start_time).num_seconds(),
            "call cleaned up"
        );
    }

    async fn handle_dtmf(&self, channel_id: &str, digit: &str) {
        info!(channel_id, digit, "DTMF received");
        let conversation_id = self
            .channels
            .read()
            .await
            .get(channel_id)
            .and_then(|record| record.conversation_id.clone());
        if let Some(conversation_id) = conversation_id {
            if let Err(e) = self
                .store
                .append_message(
                    &conversation_id,
                    "system",
                    &format!("DTMF digit received: {}", digit),
                )
                .await
            {
                warn!(channel_id, error = %e, "failed to record DTMF");
            }
        }
    }

    /// Play one AI audio chunk (already mu-law @ 8 kHz) on the channel via a
    /// transient sound file. Failures drop the chunk silently; the next one
    /// gets its own attempt.
    async fn play_audio_chunk(&self, channel_id: &str, audio: Vec<u8>) {
        if audio.is_empty() {
            return;
        }
        if !self.channels.read().await.contains_key(channel_id) {
            trace!(channel_id, "audio chunk for unknown channel dropped");
            return;
        }

        let config = self.state.get_config();
        let dir = PathBuf::from(&config.asterisk.sounds_dir);
        let name = format!("chunk-{}", Uuid::new_v4());
        let path = dir.join(format!("{}.ulaw", name));

        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            warn!(error = %e, "cannot create sounds directory, dropping chunk");
            return;
        }
        if let Err(e) = tokio::fs::write(&path, &audio).await {
            warn!(error = %e, "cannot write playback file, dropping chunk");
            return;
        }

        // `sound:` media resolves relative to the Asterisk sounds root; the
        // configured directory's last component is the sub-path.
        let relative = dir
            .file_name()
            .map(|sub| format!("sound:{}/{}", sub.to_string_lossy(), name));
        let direct = format!("sound:{}", dir.join(&name).display());

        let played = match &relative {
            Some(media) => self.ari.play_media(channel_id, media).await.is_ok(),
            None => false,
        };
        if !played {
            if let Err(e) = self.ari.play_media(channel_id, &direct).await {
                debug!(channel_id, error = %e, "playback failed, dropping chunk");
                let _ = tokio::fs::remove_file(&path).await;
                return;
            }
        }

        // Remove the file once playback has plausibly finished: mu-law is
        // 8000 bytes per second, plus slack for queuing.
        let linger = Duration::from_millis(audio.len() as u64 * 1000 / 8_000 + 500);
        tokio::spawn(async move {
            tokio::time::sleep(linger).await;
            let _ = tokio::fs::remove_file(&path).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::conversation::InMemoryConversationStore;

    fn manager() -> CallSessionManager {
        let config = AppConfig::default();
        let state = AppState::new(config.clone());
        let bus = NotificationBus::new();
        let store: Arc<dyn ConversationStore> = Arc::new(InMemoryConversationStore::new());
        let ari = Arc::new(AriClient::new(config.asterisk));
        let realtime = Arc::new(RealtimeSessionManager::new(
            bus.clone(),
            store.clone(),
            state.clone(),
        ));
        CallSessionManager::new(ari, realtime, store, bus, state)
    }

    #[tokio::test]
    async fn test_active_channels_snapshot_serializes() {
        let manager = manager();
        manager.channels.write().await.insert(
            "chan-1".to_string(),
            ChannelRecord {
                channel_id: "chan-1".to_string(),
                bridge_id: "bridge-1".to_string(),
                conversation_id: None,
                start_time: Utc::now(),
                state: ChannelState::Active,
                snoop_channel_id: None,
            },
        );

        let channels = manager.active_channels().await;
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].bridge_id, "bridge-1");

        let json = serde_json::to_value(&channels[0]).unwrap();
        assert_eq!(json["state"], "active");
        assert_eq!(json["channel_id"], "chan-1");
    }

    #[test]
    fn test_patient_id_shape() {
        assert!(is_patient_id("507f1f77bcf86cd799439011"));
        assert!(is_patient_id("507F1F77BCF86CD799439011"));
        assert!(!is_patient_id("507f1f77bcf86cd79943901"));
        assert!(!is_patient_id("507f1f77bcf86cd7994390111"));
        assert!(!is_patient_id("507f1f77bcf86cd79943901z"));
        assert!(!is_patient_id("+15551234567"));
        assert!(!is_patient_id(""));
    }

    #[test]
    fn test_metadata_parsing() {
        let parsed = parse_call_metadata("patientId=507f1f77bcf86cd799439011&callId=call%2042");
        assert_eq!(
            parsed.get("patientId").map(String::as_str),
            Some("507f1f77bcf86cd799439011")
        );
        assert_eq!(parsed.get("callId").map(String::as_str), Some("call 42"));

        // Malformed pairs are skipped, not fatal.
        let parsed = parse_call_metadata("justakey&=novalue&ok=1");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed.get("ok").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_patient_resolution_prefers_hex_caller_id() {
        let id = patient_id_from_channel(
            "507f1f77bcf86cd799439011",
            &["patientId=aaaaaaaaaaaaaaaaaaaaaaaa".to_string()],
        );
        assert_eq!(id.as_deref(), Some("507f1f77bcf86cd799439011"));
    }

    #[test]
    fn test_patient_resolution_falls_back_to_args() {
        let id = patient_id_from_channel(
            "+15551234567",
            &["patientId=507f1f77bcf86cd799439011&callId=7".to_string()],
        );
        assert_eq!(id.as_deref(), Some("507f1f77bcf86cd799439011"));

        assert_eq!(patient_id_from_channel("+15551234567", &[]), None);
    }
}
