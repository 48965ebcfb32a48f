//! Protocol engine tests against an in-process WebSocket server speaking
//! the binary framing.

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message as RawWsMessage;
use tokio_tungstenite::{accept_async, WebSocketStream};

use scriptcast_backend::domain::dialogue::DialogueTurn;
use scriptcast_backend::infrastructure::synthesizer::codec::{EventType, Message, MsgType};
use scriptcast_backend::infrastructure::synthesizer::{
    PodcastTtsClient, SpeechSynthesizer, SynthesisError, QUOTA_EXCEEDED_CODE,
};

type ServerWs = WebSocketStream<TcpStream>;

async fn server_recv(ws: &mut ServerWs) -> Option<Message> {
    loop {
        match ws.next().await?.ok()? {
            RawWsMessage::Binary(data) => {
                return Some(Message::unmarshal(&data).expect("client sent a valid frame"))
            }
            RawWsMessage::Close(_) => return None,
            _ => continue,
        }
    }
}

async fn server_send(ws: &mut ServerWs, msg: Message) {
    ws.send(RawWsMessage::Binary(msg.marshal())).await.unwrap();
}

fn response(event: EventType, payload: &[u8]) -> Message {
    Message::event(MsgType::FullServerResponse, event, payload.to_vec())
}

/// Handshake up to and including `FinishSession`; returns the session id.
async fn accept_session(ws: &mut ServerWs) -> String {
    let msg = server_recv(ws).await.unwrap();
    assert_eq!(msg.event, Some(EventType::StartConnection));
    server_send(ws, response(EventType::ConnectionStarted, b"{}")).await;

    let msg = server_recv(ws).await.unwrap();
    assert_eq!(msg.event, Some(EventType::StartSession));
    let session_id = msg.session_id.clone().unwrap();
    let payload: serde_json::Value = serde_json::from_slice(&msg.payload).unwrap();
    assert_eq!(payload["action"], 3);
    assert!(payload["nlp_texts"].as_array().unwrap().len() > 0);
    server_send(
        ws,
        Message::session_event(
            MsgType::FullServerResponse,
            EventType::SessionStarted,
            &session_id,
            b"{}".to_vec(),
        ),
    )
    .await;

    let msg = server_recv(ws).await.unwrap();
    assert_eq!(msg.event, Some(EventType::FinishSession));
    session_id
}

/// Answer the client's graceful teardown if it arrives.
async fn accept_teardown(ws: &mut ServerWs) {
    if let Some(msg) = server_recv(ws).await {
        assert_eq!(msg.event, Some(EventType::FinishConnection));
        server_send(ws, response(EventType::ConnectionFinished, b"{}")).await;
    }
}

async fn spawn_server<F, Fut>(script: F) -> String
where
    F: FnOnce(ServerWs) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = accept_async(stream).await.unwrap();
        script(ws).await;
    });
    format!("ws://{}", addr)
}

fn turns() -> Vec<DialogueTurn> {
    vec![
        DialogueTurn {
            speaker: "zh_female_mizai_v2_saturn_bigtts".to_string(),
            text: "欢迎收听。".to_string(),
        },
        DialogueTurn {
            speaker: "zh_male_dayi_v2_saturn_bigtts".to_string(),
            text: "大家好。".to_string(),
        },
    ]
}

#[tokio::test]
async fn collects_audio_across_rounds() {
    let endpoint = spawn_server(|mut ws| async move {
        let session = accept_session(&mut ws).await;

        for round in 0u8..2 {
            server_send(&mut ws, response(EventType::PodcastRoundStart, b"{}")).await;
            server_send(
                &mut ws,
                Message::session_event(
                    MsgType::AudioOnlyServer,
                    EventType::PodcastRoundResponse,
                    &session,
                    vec![round; 64],
                ),
            )
            .await;
            server_send(
                &mut ws,
                response(EventType::PodcastRoundEnd, br#"{"is_error":false}"#),
            )
            .await;
        }
        server_send(&mut ws, response(EventType::PodcastEnd, b"{}")).await;
        server_send(
            &mut ws,
            Message::session_event(
                MsgType::FullServerResponse,
                EventType::SessionFinished,
                &session,
                b"{}".to_vec(),
            ),
        )
        .await;
        accept_teardown(&mut ws).await;
    })
    .await;

    let client = PodcastTtsClient::new("app", "token").with_endpoint(endpoint);
    let audio = client.synthesize(&turns()).await.unwrap();

    assert_eq!(audio.len(), 128);
    assert_eq!(&audio[..64], &[0u8; 64]);
    assert_eq!(&audio[64..], &[1u8; 64]);
}

#[tokio::test(start_paused = true)]
async fn silent_server_times_out_the_handshake() {
    let endpoint = spawn_server(|mut ws| async move {
        // Accept the opening frame, then go quiet.
        let _ = server_recv(&mut ws).await;
        std::future::pending::<()>().await;
    })
    .await;

    let client = PodcastTtsClient::new("app", "token").with_endpoint(endpoint);
    let err = client.synthesize(&turns()).await.unwrap_err();
    match err {
        SynthesisError::Transport(msg) => assert!(msg.contains("timed out"), "{}", msg),
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn unrecognized_events_do_not_abort_the_session() {
    let endpoint = spawn_server(|mut ws| async move {
        let session = accept_session(&mut ws).await;
        server_send(
            &mut ws,
            Message::session_event(
                MsgType::AudioOnlyServer,
                EventType::PodcastRoundResponse,
                &session,
                vec![9; 64],
            ),
        )
        .await;
        // An informational event this client has no handler for.
        server_send(
            &mut ws,
            Message::session_event(
                MsgType::FullServerResponse,
                EventType::Unknown(350),
                &session,
                b"{}".to_vec(),
            ),
        )
        .await;
        server_send(
            &mut ws,
            response(EventType::PodcastRoundEnd, br#"{"is_error":false}"#),
        )
        .await;
        server_send(&mut ws, response(EventType::PodcastEnd, b"{}")).await;
        server_send(
            &mut ws,
            Message::session_event(
                MsgType::FullServerResponse,
                EventType::SessionFinished,
                &session,
                b"{}".to_vec(),
            ),
        )
        .await;
        accept_teardown(&mut ws).await;
    })
    .await;

    let client = PodcastTtsClient::new("app", "token").with_endpoint(endpoint);
    let audio = client.synthesize(&turns()).await.unwrap();
    assert_eq!(audio, vec![9; 64]);
}

#[tokio::test]
async fn quota_error_code_maps_to_quota_exceeded() {
    let endpoint = spawn_server(|mut ws| async move {
        accept_session(&mut ws).await;
        server_send(
            &mut ws,
            Message {
                msg_type: MsgType::Error,
                flags: 0,
                sequence: None,
                event: None,
                session_id: None,
                error_code: Some(QUOTA_EXCEEDED_CODE),
                payload: br#"{"error":"too many concurrent sessions"}"#.to_vec(),
            },
        )
        .await;
    })
    .await;

    let client = PodcastTtsClient::new("app", "token").with_endpoint(endpoint);
    let err = client.synthesize(&turns()).await.unwrap_err();
    assert!(matches!(
        err,
        SynthesisError::QuotaExceeded(msg) if msg == "too many concurrent sessions"
    ));
}

#[tokio::test]
async fn erroneous_round_end_fails_the_session() {
    let endpoint = spawn_server(|mut ws| async move {
        let session = accept_session(&mut ws).await;
        server_send(
            &mut ws,
            Message::session_event(
                MsgType::AudioOnlyServer,
                EventType::PodcastRoundResponse,
                &session,
                vec![7; 32],
            ),
        )
        .await;
        server_send(
            &mut ws,
            response(
                EventType::PodcastRoundEnd,
                br#"{"is_error":true,"error_code":123}"#,
            ),
        )
        .await;
    })
    .await;

    let client = PodcastTtsClient::new("app", "token").with_endpoint(endpoint);
    let err = client.synthesize(&turns()).await.unwrap_err();
    match err {
        SynthesisError::Server { code, .. } => assert_eq!(code, 123),
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn empty_session_reports_no_audio() {
    let endpoint = spawn_server(|mut ws| async move {
        let session = accept_session(&mut ws).await;
        server_send(
            &mut ws,
            Message::session_event(
                MsgType::FullServerResponse,
                EventType::SessionFinished,
                &session,
                b"{}".to_vec(),
            ),
        )
        .await;
        accept_teardown(&mut ws).await;
    })
    .await;

    let client = PodcastTtsClient::new("app", "token").with_endpoint(endpoint);
    let err = client.synthesize(&turns()).await.unwrap_err();
    assert!(matches!(err, SynthesisError::NoAudio));
}

#[tokio::test]
async fn connection_failure_surfaces_server_payload() {
    let endpoint = spawn_server(|mut ws| async move {
        let msg = server_recv(&mut ws).await.unwrap();
        assert_eq!(msg.event, Some(EventType::StartConnection));
        server_send(
            &mut ws,
            response(EventType::ConnectionFailed, b"bad credentials"),
        )
        .await;
    })
    .await;

    let client = PodcastTtsClient::new("app", "token").with_endpoint(endpoint);
    let err = client.synthesize(&turns()).await.unwrap_err();
    match err {
        SynthesisError::Server { payload, .. } => assert!(payload.contains("bad credentials")),
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn missing_token_is_rejected_before_connecting() {
    let client = PodcastTtsClient::new("app", "");
    let err = client.synthesize(&turns()).await.unwrap_err();
    assert!(matches!(err, SynthesisError::Transport(_)));
}
