use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use super::codec::{
    finish_connection, finish_session, start_connection, start_session, EventType, Message,
    MsgType,
};
use super::{SpeechSynthesizer, SynthesisError, QUOTA_EXCEEDED_CODE};
use crate::domain::dialogue::DialogueTurn;

pub const DEFAULT_ENDPOINT: &str = "wss://openspeech.bytedance.com/api/v3/sami/podcasttts";

// Service-mandated constants for the podcast resource.
const FIXED_APP_KEY: &str = "aGjiRDfUWi";
const RESOURCE_ID: &str = "volc.service_type.10029";

const HANDSHAKE_WAIT: Duration = Duration::from_secs(10);
const CLOSE_WAIT: Duration = Duration::from_secs(5);
const PING_WAIT: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Serialize)]
struct DialoguePayload<'a> {
    input_id: String,
    action: u32,
    use_head_music: bool,
    use_tail_music: bool,
    nlp_texts: &'a [DialogueTurn],
    speaker_info: SpeakerInfo,
    input_info: InputInfo,
    audio_config: AudioConfig,
}

#[derive(Debug, Serialize)]
struct SpeakerInfo {
    random_order: bool,
}

#[derive(Debug, Serialize)]
struct InputInfo {
    return_audio_url: bool,
    only_nlp_text: bool,
}

#[derive(Debug, Serialize)]
struct AudioConfig {
    format: &'static str,
    sample_rate: u32,
    speech_rate: i32,
}

/// Multi-voice podcast request body. `action: 3` selects dialogue
/// synthesis; voices are taken verbatim from `nlp_texts`, in order.
fn dialogue_payload(turns: &[DialogueTurn]) -> Result<Vec<u8>, SynthesisError> {
    let payload = DialoguePayload {
        input_id: format!("tts_{}", &Uuid::new_v4().simple().to_string()[..8]),
        action: 3,
        use_head_music: false,
        use_tail_music: false,
        nlp_texts: turns,
        speaker_info: SpeakerInfo {
            random_order: false,
        },
        input_info: InputInfo {
            return_audio_url: false,
            only_nlp_text: false,
        },
        audio_config: AudioConfig {
            format: "mp3",
            sample_rate: 24000,
            speech_rate: 0,
        },
    };
    serde_json::to_vec(&payload).map_err(|e| SynthesisError::Protocol(e.to_string()))
}

/// Result of a credential diagnostic handshake.
#[derive(Debug, Serialize)]
pub struct AuthCheck {
    pub success: bool,
    pub endpoint: String,
    pub app_id_present: bool,
    pub token_present: bool,
    pub connection_started: bool,
    pub error: Option<String>,
}

/// Speech synthesizer over the podcast WebSocket protocol.
pub struct PodcastTtsClient {
    app_id: String,
    access_token: String,
    endpoint: String,
}

impl PodcastTtsClient {
    pub fn new(app_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            access_token: access_token.into(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn client_request(
        &self,
    ) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, SynthesisError> {
        let mut request = self
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| SynthesisError::Transport(e.to_string()))?;

        let headers = request.headers_mut();
        let pairs = [
            ("X-Api-App-Id", self.app_id.as_str()),
            ("X-Api-App-Key", FIXED_APP_KEY),
            ("X-Api-Access-Key", self.access_token.as_str()),
            ("X-Api-Resource-Id", RESOURCE_ID),
        ];
        for (name, value) in pairs {
            headers.insert(
                name,
                HeaderValue::from_str(value)
                    .map_err(|e| SynthesisError::Transport(e.to_string()))?,
            );
        }
        headers.insert(
            "X-Api-Connect-Id",
            HeaderValue::from_str(&Uuid::new_v4().to_string())
                .map_err(|e| SynthesisError::Transport(e.to_string()))?,
        );
        Ok(request)
    }

    async fn run_session(
        &self,
        ws: &mut WsStream,
        turns: &[DialogueTurn],
    ) -> Result<Vec<u8>, SynthesisError> {
        send(ws, start_connection()).await?;
        wait_for_event_within(ws, EventType::ConnectionStarted, HANDSHAKE_WAIT).await?;

        let session_id = Uuid::new_v4().to_string();
        send(ws, start_session(&session_id, dialogue_payload(turns)?)).await?;
        wait_for_event_within(ws, EventType::SessionStarted, HANDSHAKE_WAIT).await?;

        // The service starts processing once the session is closed on the
        // client side; audio then streams back round by round.
        send(ws, finish_session(&session_id)).await?;

        let mut round_audio: Vec<u8> = Vec::new();
        let mut podcast_audio: Vec<u8> = Vec::new();

        loop {
            let msg = recv_frame(ws).await?;
            match msg.msg_type {
                MsgType::AudioOnlyServer
                    if msg.event == Some(EventType::PodcastRoundResponse) =>
                {
                    round_audio.extend_from_slice(&msg.payload);
                    tracing::debug!(
                        chunk = msg.payload.len(),
                        total = round_audio.len(),
                        "audio chunk received"
                    );
                }
                MsgType::Error => {
                    return Err(classify_error(msg.error_code.unwrap_or(0), &msg.payload));
                }
                MsgType::FullServerResponse => match msg.event {
                    Some(EventType::PodcastRoundEnd) => {
                        let data: serde_json::Value =
                            serde_json::from_slice(&msg.payload).unwrap_or_default();
                        if data.get("is_error").and_then(|v| v.as_bool()) == Some(true) {
                            return Err(SynthesisError::Server {
                                code: data
                                    .get("error_code")
                                    .and_then(|v| v.as_i64())
                                    .unwrap_or(0) as i32,
                                payload: String::from_utf8_lossy(&msg.payload).into_owned(),
                            });
                        }
                        if !round_audio.is_empty() {
                            tracing::info!(bytes = round_audio.len(), "round complete");
                            podcast_audio.append(&mut round_audio);
                        }
                    }
                    Some(EventType::PodcastEnd) => {
                        tracing::info!("podcast generation complete");
                    }
                    Some(EventType::SessionFailed) => {
                        return Err(SynthesisError::Server {
                            code: 0,
                            payload: String::from_utf8_lossy(&msg.payload).into_owned(),
                        });
                    }
                    Some(EventType::SessionFinished) => break,
                    _ => {}
                },
                _ => {}
            }
        }

        close_connection(ws).await;

        if podcast_audio.is_empty() {
            return Err(SynthesisError::NoAudio);
        }
        Ok(podcast_audio)
    }

    /// Minimal handshake to verify credentials without synthesizing.
    pub async fn ping_auth(&self) -> AuthCheck {
        let mut check = AuthCheck {
            success: false,
            endpoint: self.endpoint.clone(),
            app_id_present: !self.app_id.is_empty(),
            token_present: !self.access_token.is_empty(),
            connection_started: false,
            error: None,
        };
        if !check.app_id_present || !check.token_present {
            check.error = Some("missing app_id or access_token".to_string());
            return check;
        }

        let request = match self.client_request() {
            Ok(request) => request,
            Err(err) => {
                check.error = Some(err.to_string());
                return check;
            }
        };
        let mut ws = match connect_async(request).await {
            Ok((ws, _)) => ws,
            Err(err) => {
                check.error = Some(err.to_string());
                return check;
            }
        };

        let outcome = async {
            send(&mut ws, start_connection()).await?;
            wait_for_event(&mut ws, EventType::ConnectionStarted).await
        };
        match tokio::time::timeout(PING_WAIT, outcome).await {
            Ok(Ok(())) => {
                check.success = true;
                check.connection_started = true;
                close_connection(&mut ws).await;
            }
            Ok(Err(err)) => check.error = Some(err.to_string()),
            Err(_) => {
                check.error = Some("timeout waiting for connection handshake".to_string())
            }
        }
        let _ = ws.close(None).await;
        check
    }
}

#[async_trait]
impl SpeechSynthesizer for PodcastTtsClient {
    async fn synthesize(&self, turns: &[DialogueTurn]) -> Result<Vec<u8>, SynthesisError> {
        if self.access_token.is_empty() {
            return Err(SynthesisError::Transport(
                "speech service access token is not configured".to_string(),
            ));
        }

        tracing::info!(rounds = turns.len(), endpoint = %self.endpoint, "starting synthesis");
        let request = self.client_request()?;
        let (mut ws, _) = connect_async(request)
            .await
            .map_err(|e| SynthesisError::Transport(e.to_string()))?;

        let result = self.run_session(&mut ws, turns).await;
        // The socket is closed no matter how the session ended.
        let _ = ws.close(None).await;

        match &result {
            Ok(audio) => tracing::info!(bytes = audio.len(), "synthesis complete"),
            Err(err) => tracing::error!(error = %err, "synthesis failed"),
        }
        result
    }
}

async fn send(ws: &mut WsStream, msg: Message) -> Result<(), SynthesisError> {
    ws.send(WsMessage::Binary(msg.marshal()))
        .await
        .map_err(|e| SynthesisError::Transport(e.to_string()))
}

/// Next binary protocol frame, skipping transport-level chatter.
async fn recv_frame(ws: &mut WsStream) -> Result<Message, SynthesisError> {
    loop {
        let raw = ws
            .next()
            .await
            .ok_or_else(|| SynthesisError::Transport("connection closed".to_string()))?
            .map_err(|e| SynthesisError::Transport(e.to_string()))?;
        match raw {
            WsMessage::Binary(data) => return Message::unmarshal(&data),
            WsMessage::Close(_) => {
                return Err(SynthesisError::Transport(
                    "server closed the connection".to_string(),
                ))
            }
            _ => continue,
        }
    }
}

async fn wait_for_event_within(
    ws: &mut WsStream,
    expected: EventType,
    wait: Duration,
) -> Result<(), SynthesisError> {
    tokio::time::timeout(wait, wait_for_event(ws, expected))
        .await
        .map_err(|_| SynthesisError::Transport(format!("timed out waiting for {:?}", expected)))?
}

async fn wait_for_event(ws: &mut WsStream, expected: EventType) -> Result<(), SynthesisError> {
    let msg = recv_frame(ws).await?;
    if msg.msg_type == MsgType::Error {
        return Err(classify_error(msg.error_code.unwrap_or(0), &msg.payload));
    }
    match msg.event {
        Some(event) if event == expected => Ok(()),
        Some(EventType::ConnectionFailed) | Some(EventType::SessionFailed) => {
            Err(SynthesisError::Server {
                code: 0,
                payload: String::from_utf8_lossy(&msg.payload).into_owned(),
            })
        }
        other => Err(SynthesisError::Protocol(format!(
            "expected {:?}, got {:?}",
            expected, other
        ))),
    }
}

/// Best-effort graceful teardown: ask the server to finish and give it a
/// bounded window to confirm. Failures here never mask the session result.
async fn close_connection(ws: &mut WsStream) {
    if send(ws, finish_connection()).await.is_err() {
        return;
    }
    let confirmed = tokio::time::timeout(CLOSE_WAIT, async {
        loop {
            match recv_frame(ws).await {
                Ok(msg) if msg.event == Some(EventType::ConnectionFinished) => break true,
                Ok(_) => continue,
                Err(_) => break false,
            }
        }
    })
    .await
    .unwrap_or(false);
    if !confirmed {
        tracing::debug!("connection finished without server confirmation");
    }
}

fn classify_error(code: u32, payload: &[u8]) -> SynthesisError {
    let text = String::from_utf8_lossy(payload).into_owned();
    let message = serde_json::from_str::<serde_json::Value>(&text)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or_else(|| text.clone());
    if code == QUOTA_EXCEEDED_CODE {
        SynthesisError::QuotaExceeded(message)
    } else {
        SynthesisError::Server {
            code: code as i32,
            payload: text,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_dialogue_payload_shape() {
        let turns = vec![
            DialogueTurn {
                speaker: "zh_female_mizai_v2_saturn_bigtts".to_string(),
                text: "你好".to_string(),
            },
            DialogueTurn {
                speaker: "zh_male_dayi_v2_saturn_bigtts".to_string(),
                text: "Hi".to_string(),
            },
        ];
        let raw = dialogue_payload(&turns).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&raw).unwrap();

        assert_eq!(value["action"], 3);
        assert_eq!(value["use_head_music"], false);
        assert_eq!(value["nlp_texts"].as_array().unwrap().len(), 2);
        assert_eq!(value["nlp_texts"][1]["speaker"], "zh_male_dayi_v2_saturn_bigtts");
        assert_eq!(value["speaker_info"]["random_order"], false);
        assert_eq!(value["input_info"]["return_audio_url"], false);
        assert_eq!(value["audio_config"]["format"], "mp3");
        assert_eq!(value["audio_config"]["sample_rate"], 24000);
        assert!(value["input_id"].as_str().unwrap().starts_with("tts_"));
    }

    #[test]
    fn test_classify_error_quota() {
        let err = classify_error(QUOTA_EXCEEDED_CODE, br#"{"error":"too many sessions"}"#);
        assert!(matches!(
            err,
            SynthesisError::QuotaExceeded(msg) if msg == "too many sessions"
        ));
    }

    #[test]
    fn test_classify_error_other_codes() {
        let err = classify_error(55000001, b"internal");
        match err {
            SynthesisError::Server { code, payload } => {
                assert_eq!(code, 55000001);
                assert_eq!(payload, "internal");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
