//! Scripted in-process relay for client integration tests.
//!
//! The mock relay answers EVENT with OK and REQ with EOSE (or CLOSED when
//! told to refuse subscriptions), records every
//! frame it receives, and can push arbitrary frames to all connected clients.

#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use nostr::{Event, EventTemplate, KIND_SHORT_TEXT_NOTE, Keys};
use nostr_client::{ClientConfig, Delivery};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Once;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, sleep, timeout};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

pub const WAIT: Duration = Duration::from_secs(2);

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    });
}

pub fn test_config() -> ClientConfig {
    ClientConfig::default()
        .with_handshake_timeout(WAIT)
        .with_ready_timeout(WAIT)
        .with_close_drain_timeout(Duration::from_millis(100))
}

#[derive(Default)]
struct Shared {
    frames: Mutex<Vec<String>>,
    subscriptions: Mutex<BTreeSet<String>>,
    connections: AtomicUsize,
    reject_events: AtomicBool,
    refuse_subscriptions: AtomicBool,
}

impl Shared {
    fn respond(&self, text: &str) -> Vec<String> {
        let Ok(Value::Array(frame)) = serde_json::from_str::<Value>(text) else {
            return Vec::new();
        };
        let field = |i: usize| frame.get(i).and_then(Value::as_str).unwrap_or_default().to_string();

        match frame.first().and_then(Value::as_str) {
            Some("EVENT") => {
                let id = frame
                    .get(1)
                    .and_then(|event| event.get("id"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let rejected = self.reject_events.load(Ordering::SeqCst);
                let message = if rejected { "blocked: test relay rejects events" } else { "" };
                vec![json!(["OK", id, !rejected, message]).to_string()]
            }
            Some("REQ") => {
                let sub_id = field(1);
                if self.refuse_subscriptions.load(Ordering::SeqCst) {
                    return vec![json!(["CLOSED", sub_id, "auth-required: test relay"]).to_string()];
                }
                self.subscriptions.lock().insert(sub_id.clone());
                vec![json!(["EOSE", sub_id]).to_string()]
            }
            Some("CLOSE") => {
                self.subscriptions.lock().remove(&field(1));
                Vec::new()
            }
            _ => Vec::new(),
        }
    }
}

pub struct MockRelay {
    pub url: String,
    shared: Arc<Shared>,
    push: broadcast::Sender<Message>,
    task: JoinHandle<()>,
}

impl MockRelay {
    pub async fn start() -> Self {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shared = Arc::new(Shared::default());
        let (push, _) = broadcast::channel(64);

        let task = {
            let shared = Arc::clone(&shared);
            let push = push.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    tokio::spawn(serve(stream, Arc::clone(&shared), push.subscribe()));
                }
            })
        };

        Self {
            url: format!("ws://127.0.0.1:{}", addr.port()),
            shared,
            push,
            task,
        }
    }

    /// Relay identity the client derives from this relay's URL.
    pub fn identity(&self) -> String {
        self.url.trim_start_matches("ws://").to_string()
    }

    pub fn push(&self, message: Message) {
        let _ = self.push.send(message);
    }

    pub fn push_text(&self, text: impl Into<String>) {
        let text: String = text.into();
        self.push(Message::Text(text.into()));
    }

    pub fn push_event(&self, sub_id: &str, event: &Event) {
        self.push_text(json!(["EVENT", sub_id, event]).to_string());
    }

    /// Send a close frame on every open connection.
    pub fn close_all(&self) {
        self.push(Message::Close(None));
    }

    pub fn reject_events(&self) {
        self.shared.reject_events.store(true, Ordering::SeqCst);
    }

    /// Answer every REQ with CLOSED instead of EOSE.
    pub fn refuse_subscriptions(&self) {
        self.shared.refuse_subscriptions.store(true, Ordering::SeqCst);
    }

    /// Text frames received from clients, plus `pong:<payload>` entries.
    pub fn received(&self) -> Vec<String> {
        self.shared.frames.lock().clone()
    }

    pub fn received_kind(&self, kind: &str) -> Vec<Value> {
        self.received()
            .iter()
            .filter_map(|text| serde_json::from_str::<Value>(text).ok())
            .filter(|frame| frame[0] == kind)
            .collect()
    }

    pub fn open_subscriptions(&self) -> BTreeSet<String> {
        self.shared.subscriptions.lock().clone()
    }

    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }
}

impl Drop for MockRelay {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(stream: TcpStream, shared: Arc<Shared>, mut pushes: broadcast::Receiver<Message>) {
    let Ok(ws) = accept_async(stream).await else {
        return;
    };
    shared.connections.fetch_add(1, Ordering::SeqCst);
    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    shared.frames.lock().push(text.to_string());
                    for reply in shared.respond(text.as_str()) {
                        if write.send(Message::Text(reply.into())).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Pong(payload))) => {
                    shared.frames.lock().push(format!("pong:{}", String::from_utf8_lossy(&payload)));
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            pushed = pushes.recv() => match pushed {
                Ok(message) => {
                    if write.send(message).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            },
        }
    }

    shared.connections.fetch_sub(1, Ordering::SeqCst);
}

pub fn signed_note(content: &str) -> Event {
    Keys::generate()
        .sign(&EventTemplate::new(KIND_SHORT_TEXT_NOTE, content))
        .unwrap()
}

/// Poll `check` until it holds, panicking after [`WAIT`].
pub async fn wait_until(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !check() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        sleep(Duration::from_millis(10)).await;
    }
}

pub async fn next_delivery(rx: &mut mpsc::UnboundedReceiver<Delivery>) -> Delivery {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for a delivery")
        .expect("listener channel closed")
}
