//! # Asterisk REST Interface Client
//!
//! Minimal ARI client covering what a wellness call needs: answering and
//! hanging up channels, mixing bridges, bridge recordings, media playback,
//! channel variables, and the event WebSocket delivering Stasis events.
//!
//! Credentials go out as HTTP basic auth on REST calls and as the `api_key`
//! query parameter on the event socket, matching Asterisk's expectations.

use futures_util::StreamExt;
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};

use crate::config::AsteriskConfig;
use crate::error::{AppError, AppResult};

/// Caller identification attached to a channel.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct CallerId {
    #[serde(default)]
    pub number: String,
    #[serde(default)]
    pub name: String,
}

/// The subset of an ARI channel object this service reads.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Channel {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub caller: CallerId,
}

/// A created bridge.
#[derive(Debug, Clone, Deserialize)]
pub struct Bridge {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChannelVariable {
    value: String,
}

/// Events from the ARI WebSocket this service reacts to.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum AriEvent {
    StasisStart {
        channel: Channel,
        #[serde(default)]
        args: Vec<String>,
    },
    StasisEnd {
        channel: Channel,
    },
    ChannelDestroyed {
        channel: Channel,
    },
    ChannelHangupRequest {
        channel: Channel,
    },
    ChannelDtmfReceived {
        channel: Channel,
        digit: String,
    },
    #[serde(other)]
    Unknown,
}

pub type AriEventStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct AriClient {
    http: reqwest::Client,
    config: AsteriskConfig,
}

impl AriClient {
    pub fn new(config: AsteriskConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    pub fn app_name(&self) -> &str {
        &self.config.app_name
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn post(&self, path: &str, query: &[(&str, &str)]) -> AppResult<reqwest::Response> {
        let response = self
            .http
            .post(self.url(path))
            .basic_auth(&self.config.username, Some(&self.config.password))
            .query(query)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Setup(format!(
                "ARI {} returned {}: {}",
                path, status, body
            )));
        }
        Ok(response)
    }

    pub async fn answer(&self, channel_id: &str) -> AppResult<()> {
        self.post(&format!("/channels/{}/answer", channel_id), &[])
            .await?;
        debug!(channel_id, "channel answered");
        Ok(())
    }

    pub async fn create_mixing_bridge(&self, name: &str) -> AppResult<Bridge> {
        let response = self
            .post("/bridges", &[("type", "mixing"), ("name", name)])
            .await?;
        let bridge: Bridge = response.json().await?;
        debug!(bridge_id = %bridge.id, name, "mixing bridge created");
        Ok(bridge)
    }

    pub async fn add_channel_to_bridge(&self, bridge_id: &str, channel_id: &str) -> AppResult<()> {
        self.post(
            &format!("/bridges/{}/addChannel", bridge_id),
            &[("channel", channel_id)],
        )
        .await?;
        Ok(())
    }

    /// Start a bridge-level recording: fixed wav format, no beep, duplicate
    /// names overwritten, capped at `max_duration_secs`.
    pub async fn record_bridge(
        &self,
        bridge_id: &str,
        name: &str,
        max_duration_secs: u32,
    ) -> AppResult<()> {
        let max = max_duration_secs.to_string();
        self.post(
            &format!("/bridges/{}/record", bridge_id),
            &[
                ("name", name),
                ("format", "wav"),
                ("beep", "false"),
                ("ifExists", "overwrite"),
                ("maxDurationSeconds", max.as_str()),
            ],
        )
        .await?;
        debug!(bridge_id, name, "bridge recording started");
        Ok(())
    }

    pub async fn destroy_bridge(&self, bridge_id: &str) -> AppResult<()> {
        let response = self
            .http
            .delete(self.url(&format!("/bridges/{}", bridge_id)))
            .basic_auth(&self.config.username, Some(&self.config.password))
            .send()
            .await?;
        if !response.status().is_success() && response.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(AppError::Setup(format!(
                "bridge {} destroy returned {}",
                bridge_id,
                response.status()
            )));
        }
        Ok(())
    }

    /// Play a media URI (`sound:...`) on a channel.
    pub async fn play_media(&self, channel_id: &str, media: &str) -> AppResult<()> {
        self.post(&format!("/channels/{}/play", channel_id), &[("media", media)])
            .await?;
        trace!(channel_id, media, "playback requested");
        Ok(())
    }

    pub async fn hangup(&self, channel_id: &str) -> AppResult<()> {
        let response = self
            .http
            .delete(self.url(&format!("/channels/{}", channel_id)))
            .basic_auth(&self.config.username, Some(&self.config.password))
            .send()
            .await?;
        // A channel that is already gone is the desired outcome.
        if !response.status().is_success() && response.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(AppError::Setup(format!(
                "channel {} hangup returned {}",
                channel_id,
                response.status()
            )));
        }
        Ok(())
    }

    pub async fn get_channel_variable(
        &self,
        channel_id: &str,
        variable: &str,
    ) -> AppResult<Option<String>> {
        let response = self
            .http
            .get(self.url(&format!("/channels/{}/variable", channel_id)))
            .basic_auth(&self.config.username, Some(&self.config.password))
            .query(&[("variable", variable)])
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Ok(None);
        }
        let var: ChannelVariable = response.json().await?;
        if var.value.is_empty() {
            Ok(None)
        } else {
            Ok(Some(var.value))
        }
    }

    /// URL of the event WebSocket, derived from the REST base URL.
    pub fn events_url(&self) -> String {
        let ws_base = self
            .config
            .base_url
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        format!(
            "{}/events?app={}&api_key={}:{}&subscribeAll=false",
            ws_base.trim_end_matches('/'),
            urlencoding::encode(&self.config.app_name),
            urlencoding::encode(&self.config.username),
            urlencoding::encode(&self.config.password),
        )
    }

    pub async fn connect_events(&self) -> AppResult<AriEventStream> {
        let (ws, _) = connect_async(self.events_url()).await?;
        Ok(ws)
    }

    /// Read the next event from the socket. `None` means the socket ended
    /// and the caller should reconnect.
    pub async fn next_event(stream: &mut AriEventStream) -> Option<AriEvent> {
        loop {
            match stream.next().await? {
                Ok(Message::Text(text)) => match serde_json::from_str::<AriEvent>(&text) {
                    Ok(event) => return Some(event),
                    Err(e) => {
                        warn!(error = %e, "unparseable ARI event skipped");
                    }
                },
                Ok(Message::Close(_)) => return None,
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "ARI event socket error");
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> AriClient {
        AriClient::new(AsteriskConfig {
            base_url: "http://pbx.example.com:8088/ari".to_string(),
            app_name: "wellness-check".to_string(),
            username: "ari-user".to_string(),
            password: "s3cret".to_string(),
            sounds_dir: "/tmp/sounds".to_string(),
        })
    }

    #[test]
    fn test_events_url_swaps_scheme_and_carries_credentials() {
        let url = client().events_url();
        assert!(url.starts_with("ws://pbx.example.com:8088/ari/events?"));
        assert!(url.contains("app=wellness-check"));
        assert!(url.contains("api_key=ari-user:s3cret"));
    }

    #[test]
    fn test_rest_url_joining() {
        let c = client();
        assert_eq!(
            c.url("/channels/abc/answer"),
            "http://pbx.example.com:8088/ari/channels/abc/answer"
        );
    }

    #[test]
    fn test_stasis_start_parsing() {
        let json = r#"{
            "type": "StasisStart",
            "args": ["patientId=507f1f77bcf86cd799439011"],
            "channel": {
                "id": "1724567890.42",
                "name": "PJSIP/patient-00000001",
                "caller": {"number": "507f1f77bcf86cd799439011", "name": ""}
            }
        }"#;
        let event: AriEvent = serde_json::from_str(json).unwrap();
        match event {
            AriEvent::StasisStart { channel, args } => {
                assert_eq!(channel.id, "1724567890.42");
                assert_eq!(channel.caller.number, "507f1f77bcf86cd799439011");
                assert_eq!(args.len(), 1);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_dtmf_and_unknown_events() {
        let event: AriEvent = serde_json::from_str(
            r#"{"type":"ChannelDtmfReceived","digit":"5","channel":{"id":"c1"}}"#,
        )
        .unwrap();
        assert!(matches!(event, AriEvent::ChannelDtmfReceived { digit, .. } if digit == "5"));

        let event: AriEvent =
            serde_json::from_str(r#"{"type":"BridgeCreated","bridge":{"id":"b1"}}"#).unwrap();
        assert!(matches!(event, AriEvent::Unknown));
    }
}
