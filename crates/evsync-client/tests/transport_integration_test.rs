//! Integration tests for the websocket hub runtime.
//!
//! A minimal hub speaks the JSON hub protocol over a real local websocket,
//! so these tests cover dialing, the handshake, invocation completions and
//! the session's degraded paths end to end.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use evsync_client::{
    ClientError, ConnectionStatus, Identity,
    transport::{
        Collaborators, ConversationStore, DegradedPoller, HistoryPage, NotificationStore,
        RestError, Session, SessionConfig, SystemEnv, WsConnector,
    },
};
use chrono::{TimeZone, Utc};
use evsync_proto::{
    ConversationId, Credential, HandshakeResponse, HubFrame, Message, MessageId, MessageStatus,
    Notification, NotificationId, NotificationStatus, ReadMarker, UserId,
};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc,
    time::timeout,
};
use tokio_tungstenite::tungstenite::Message as WsMessage;

const WAIT: Duration = Duration::from_secs(5);

/// One accepted hub connection, seen from the server side.
struct FakeHub {
    url: String,
    calls: mpsc::UnboundedReceiver<(String, Vec<Value>)>,
    push: mpsc::UnboundedSender<HubFrame>,
}

impl FakeHub {
    /// Next invocation the client made.
    async fn next_call(&mut self) -> (String, Vec<Value>) {
        timeout(WAIT, self.calls.recv()).await.unwrap().unwrap()
    }
}

/// Start a hub that accepts a single websocket connection and completes
/// every invocation successfully.
async fn start_hub() -> FakeHub {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/hubs/chat", listener.local_addr().unwrap());
    let (calls_tx, calls) = mpsc::unbounded_channel();
    let (push, push_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        serve(stream, calls_tx, push_rx).await;
    });

    FakeHub { url, calls, push }
}

async fn serve(
    stream: TcpStream,
    calls: mpsc::UnboundedSender<(String, Vec<Value>)>,
    mut push: mpsc::UnboundedReceiver<HubFrame>,
) {
    let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

    // Handshake request, then an empty response
    let Some(Ok(WsMessage::Text(_))) = ws.next().await else { return };
    let accepted = HandshakeResponse::default().encode().unwrap();
    ws.send(WsMessage::text(accepted)).await.unwrap();

    loop {
        tokio::select! {
            message = ws.next() => {
                let Some(Ok(message)) = message else { return };
                let WsMessage::Text(text) = message else { continue };
                for frame in HubFrame::decode_batch(text.as_str()) {
                    let Ok(HubFrame::Invocation { invocation_id, target, arguments }) = frame
                    else {
                        continue;
                    };
                    if let Some(invocation_id) = invocation_id {
                        let done = HubFrame::Completion { invocation_id, result: None, error: None }
                            .encode()
                            .unwrap();
                        if ws.send(WsMessage::text(done)).await.is_err() {
                            return;
                        }
                    }
                    let _ = calls.send((target, arguments));
                }
            },
            Some(frame) = push.recv() => {
                if ws.send(WsMessage::text(frame.encode().unwrap())).await.is_err() {
                    return;
                }
            },
        }
    }
}

/// Start an HTTP endpoint that refuses every upgrade with `status`.
async fn start_refusing(status: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/hubs/notifications", listener.local_addr().unwrap());

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let mut request = [0u8; 2048];
            let _ = stream.read(&mut request).await;
            let response = format!("HTTP/1.1 {status}\r\ncontent-length: 0\r\n\r\n");
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        }
    });

    url
}

/// In-memory REST backend.
#[derive(Default)]
struct MemoryBackend {
    history: Vec<Message>,
    listing: Vec<Notification>,
    markers: Mutex<Vec<ReadMarker>>,
    read: Mutex<Vec<NotificationId>>,
}

#[async_trait]
impl ConversationStore for MemoryBackend {
    async fn history(
        &self,
        conversation: ConversationId,
        _page: HistoryPage,
    ) -> Result<Vec<Message>, RestError> {
        let page = self.history.iter().filter(|m| m.conversation == conversation);
        Ok(page.cloned().collect())
    }

    async fn mark_read(&self, marker: &ReadMarker) -> Result<(), RestError> {
        self.markers.lock().push(marker.clone());
        Ok(())
    }
}

#[async_trait]
impl NotificationStore for MemoryBackend {
    async fn list(&self) -> Result<Vec<Notification>, RestError> {
        Ok(self.listing.clone())
    }

    async fn mark_read(&self, ids: &[NotificationId]) -> Result<(), RestError> {
        self.read.lock().extend_from_slice(ids);
        Ok(())
    }
}

fn pending_notification(id: &str) -> Notification {
    Notification {
        id: NotificationId::new(id),
        user: Some(UserId::from("tech")),
        title: "Service complete".into(),
        message: "Your vehicle is ready".into(),
        status: NotificationStatus::New,
        kind: None,
        created_at: None,
    }
}

async fn start_session(
    chat_url: &str,
    notification_url: &str,
    backend: Arc<MemoryBackend>,
) -> Session<SystemEnv> {
    let mut config = SessionConfig::new(chat_url, notification_url, "http://127.0.0.1:9/api");
    config.connect_timeout = Duration::from_secs(2);

    let collaborators = Collaborators {
        chat: WsConnector::new(chat_url).unwrap(),
        notifications: WsConnector::new(notification_url).unwrap(),
        conversation_store: backend.clone(),
        notification_store: backend,
    };
    let credential = Arc::new(RwLock::new(Credential::bearer("token-1")));

    Session::init_with(SystemEnv::new(), Identity::user("tech"), credential, config, collaborators)
        .await
        .unwrap()
}

#[tokio::test]
async fn session_joins_and_receives_messages() {
    let mut hub = start_hub().await;
    let refusing = start_refusing("404 Not Found").await;
    let backend = Arc::new(MemoryBackend::default());
    let session = start_session(&hub.url, &refusing, backend.clone()).await;
    let chat = session.chat();

    assert_eq!(chat.status(), ConnectionStatus::Connected);
    assert_eq!(hub.next_call().await, ("JoinUserGroup".to_string(), vec![json!("tech")]));

    let conversation = chat.join("5").await.unwrap();
    assert_eq!(hub.next_call().await, ("JoinConversation".to_string(), vec![json!(5)]));

    let (received_tx, mut received) = mpsc::unbounded_channel();
    chat.on_message(move |message| {
        let _ = received_tx.send(message.clone());
    });

    let payload = json!({
        "messageId": 41,
        "conversationId": 5,
        "senderId": "customer",
        "content": "Is my car ready?",
        "sentAt": "2025-03-01T10:00:00Z",
    });
    hub.push.send(HubFrame::invocation("ReceiveMessage", vec![payload])).unwrap();

    let message = timeout(WAIT, received.recv()).await.unwrap().unwrap();
    assert_eq!(message.content, "Is my car ready?");
    assert_eq!(chat.unread(conversation).await.unwrap(), 1);

    chat.mark_read(conversation).await.unwrap();
    assert_eq!(chat.unread(conversation).await.unwrap(), 0);
    let markers = backend.markers.lock().clone();
    assert_eq!(markers.len(), 1);
    assert_eq!(markers[0].reader, UserId::from("tech"));

    session.dispose().await;
}

#[tokio::test]
async fn outgoing_message_reaches_hub() {
    let mut hub = start_hub().await;
    let refusing = start_refusing("404 Not Found").await;
    let session = start_session(&hub.url, &refusing, Arc::default()).await;
    let chat = session.chat();
    hub.next_call().await;

    let conversation = chat.join("12").await.unwrap();
    hub.next_call().await;
    chat.send_message(conversation, "Brakes replaced").await.unwrap();

    assert_eq!(
        hub.next_call().await,
        ("SendMessage".to_string(), vec![json!(12), json!("Brakes replaced")])
    );

    session.dispose().await;
}

#[tokio::test]
async fn missing_notification_hub_degrades_to_polling() {
    let hub = start_hub().await;
    let refusing = start_refusing("404 Not Found").await;
    let backend = Arc::new(MemoryBackend {
        listing: vec![pending_notification("n-1"), pending_notification("n-2")],
        ..MemoryBackend::default()
    });
    let session = start_session(&hub.url, &refusing, backend.clone()).await;
    let notifications = session.notifications();

    assert_eq!(notifications.status(), ConnectionStatus::Disconnected);
    assert!(notifications.is_degraded().await.unwrap());
    assert_eq!(notifications.unread_count().await.unwrap(), 2);

    notifications.mark_read(NotificationId::new("n-1")).await.unwrap();
    assert_eq!(notifications.unread_count().await.unwrap(), 1);
    assert_eq!(*backend.read.lock(), vec![NotificationId::new("n-1")]);

    session.dispose().await;
}

#[tokio::test]
async fn missing_chat_hub_polls_history_of_joined_conversations() {
    let chat_url = start_refusing("404 Not Found").await;
    let notification_url = start_refusing("404 Not Found").await;
    let bay = ConversationId::new(7);
    let backend = Arc::new(MemoryBackend {
        history: vec![Message {
            id: MessageId::remote("m-1"),
            conversation: bay,
            sender: UserId::from("advisor"),
            content: "Your car is ready".into(),
            sent_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            status: MessageStatus::Sent,
        }],
        ..MemoryBackend::default()
    });
    let session = start_session(&chat_url, &notification_url, backend).await;
    let chat = session.chat();
    assert!(chat.is_degraded().await.unwrap());

    assert_eq!(chat.join("7").await.unwrap(), bay);
    assert_eq!(chat.conversations().await.unwrap(), vec![bay]);

    let poller = DegradedPoller::new(
        SystemEnv::new(),
        chat.clone(),
        session.notifications().clone(),
        Duration::from_secs(3600),
    );
    poller.poll_once().await;

    let messages = chat.messages(bay).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "Your car is ready");

    session.dispose().await;
}

#[tokio::test]
async fn rejected_credential_keeps_retrying() {
    let hub = start_hub().await;
    let refusing = start_refusing("401 Unauthorized").await;
    let session = start_session(&hub.url, &refusing, Arc::default()).await;
    let notifications = session.notifications();

    // A renewed credential may be accepted, so the hub is not given up on
    assert_eq!(notifications.status(), ConnectionStatus::Reconnecting);
    assert!(!notifications.is_degraded().await.unwrap());

    session.dispose().await;
}

#[tokio::test]
async fn dropped_session_stops_hub_actors() {
    let hub = start_hub().await;
    let refusing = start_refusing("404 Not Found").await;
    let session = start_session(&hub.url, &refusing, Arc::default()).await;
    let chat = session.chat().clone();
    let notifications = session.notifications().clone();

    drop(session);

    timeout(WAIT, async {
        while chat.conversations().await.is_ok() || notifications.unread_count().await.is_ok() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(matches!(chat.conversations().await, Err(ClientError::Closed { .. })));
}

#[tokio::test]
async fn malformed_conversation_id_never_reaches_hub() {
    let mut hub = start_hub().await;
    let refusing = start_refusing("404 Not Found").await;
    let session = start_session(&hub.url, &refusing, Arc::default()).await;
    hub.next_call().await;

    let err = session.chat().join("not-a-number").await.unwrap_err();
    assert!(matches!(err, ClientError::InvalidConversation(_)));
    assert!(session.chat().conversations().await.unwrap().is_empty());

    session.dispose().await;
}
