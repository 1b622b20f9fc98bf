//! Common utilities for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use http::{HeaderMap, HeaderValue};
use parking_lot::Mutex;
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use ws_link::proxy::{PeerCallback, ReconnectCallback};
use ws_link::tls::{self, TlsMaterial};
use ws_link::transport::{connect_upgrade, BoxedTransport, TlsDialer, WsStream};
use ws_link::{MessageHandler, MsgPeerInfo, PeerInfo, ProxyConfig, ReconnectPolicy, TlsInfo};

pub const LOCALHOST: &str = "127.0.0.1";

/// Find an available port
pub fn get_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to random port")
        .local_addr()
        .expect("Failed to get local addr")
        .port()
}

/// Self-signed certificate used as CA, server identity and client identity.
/// Files are removed on drop.
pub struct TestCerts {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl TestCerts {
    pub fn generate() -> Self {
        let id = uuid::Uuid::new_v4();
        let temp_dir = std::env::temp_dir();
        let cert_path = temp_dir.join(format!("ws-link-test-cert-{}.pem", id));
        let key_path = temp_dir.join(format!("ws-link-test-key-{}.pem", id));

        tls::generate_self_signed_cert(
            "localhost",
            &["127.0.0.1".to_string(), "localhost".to_string()],
            &cert_path,
            &key_path,
        )
        .expect("Failed to generate test certificates");

        Self {
            cert_path,
            key_path,
        }
    }

    pub fn tls_info(&self) -> TlsInfo {
        TlsInfo::new(&self.cert_path, &self.cert_path, &self.key_path)
    }

    pub fn material(&self) -> Arc<TlsMaterial> {
        Arc::new(TlsMaterial::load(&self.tls_info()).expect("Failed to load test TLS material"))
    }
}

impl Drop for TestCerts {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.cert_path);
        let _ = std::fs::remove_file(&self.key_path);
    }
}

/// Reconnect policy shortened so scenarios finish in seconds
pub fn fast_policy() -> ReconnectPolicy {
    ReconnectPolicy {
        startup_delay: Duration::from_millis(50),
        reconnect_interval: Duration::from_millis(200),
        initial_backoff: Duration::from_millis(100),
        max_backoff: Duration::from_millis(400),
    }
}

/// Proxy config on 127.0.0.1 with fast heartbeat and reconnect timing
pub fn proxy_config(
    name: &str,
    port: u16,
    certs: &TestCerts,
    handler: Arc<dyn MessageHandler>,
) -> ProxyConfig {
    let mut config = ProxyConfig::initialize(name, LOCALHOST, port, &certs.tls_info())
        .expect("Failed to initialize proxy config");
    config
        .set_heartbeat(Duration::from_millis(200), Duration::from_secs(2))
        .unwrap();
    config.set_reconnect_policy(fast_policy()).unwrap();
    config.set_handler(handler);
    config
}

/// Handler that records every message and optionally echoes it
#[derive(Default)]
pub struct RecordingHandler {
    echo: bool,
    messages: Mutex<Vec<(Bytes, MsgPeerInfo)>>,
}

impl RecordingHandler {
    pub fn echo() -> Arc<Self> {
        Arc::new(Self {
            echo: true,
            ..Default::default()
        })
    }

    pub fn silent() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn payloads(&self) -> Vec<Bytes> {
        self.messages.lock().iter().map(|(p, _)| p.clone()).collect()
    }

    pub fn peers(&self) -> Vec<MsgPeerInfo> {
        self.messages.lock().iter().map(|(_, p)| p.clone()).collect()
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle_msg(&self, payload: Bytes, peer: MsgPeerInfo) -> Vec<u8> {
        self.messages.lock().push((payload.clone(), peer));
        if self.echo {
            payload.to_vec()
        } else {
            Vec::new()
        }
    }
}

/// Counts callback invocations and remembers the peers passed in
#[derive(Clone, Default)]
pub struct CallbackCounter {
    count: Arc<AtomicUsize>,
    peers: Arc<Mutex<Vec<PeerInfo>>>,
}

impl CallbackCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.peers.lock().clone()
    }

    pub fn peer_callback(&self) -> PeerCallback {
        let counter = self.clone();
        Arc::new(move |peer: &PeerInfo| {
            counter.peers.lock().push(peer.clone());
            counter.count.fetch_add(1, Ordering::SeqCst);
        })
    }

    pub fn reconnect_callback(&self) -> ReconnectCallback {
        let counter = self.clone();
        Arc::new(move || {
            counter.count.fetch_add(1, Ordering::SeqCst);
        })
    }
}

/// Poll `condition` until it holds or `max` elapses
pub async fn wait_until<F: Fn() -> bool>(condition: F, max: Duration) -> bool {
    let deadline = Instant::now() + max;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(20)).await;
    }
}

/// Mutually authenticated TLS connection to a local server
pub async fn tls_connect(port: u16, certs: &TestCerts) -> BoxedTransport {
    TlsDialer::new(LOCALHOST, port, certs.material())
        .connect(Duration::from_secs(5))
        .await
        .expect("TLS connect failed")
}

/// Raw WebSocket client, for scenarios the client proxy would hide
pub async fn raw_ws_connect(
    port: u16,
    certs: &TestCerts,
    client_name: &str,
) -> ws_link::Result<WsStream> {
    let stream = TlsDialer::new(LOCALHOST, port, certs.material())
        .connect(Duration::from_secs(5))
        .await?;
    let mut headers = HeaderMap::new();
    headers.insert("clientname", HeaderValue::from_str(client_name).unwrap());
    connect_upgrade(
        stream,
        &format!("wss://{}:{}/", LOCALHOST, port),
        headers,
        Duration::from_secs(5),
    )
    .await
}

/// Send a raw HTTP request over TLS and return the whole response
pub async fn http_request(port: u16, certs: &TestCerts, request: &str) -> String {
    let mut stream = tls_connect(port, certs).await;
    stream.write_all(request.as_bytes()).await.unwrap();
    stream.flush().await.unwrap();

    let mut response = Vec::new();
    let _ = timeout(Duration::from_secs(5), stream.read_to_end(&mut response)).await;
    String::from_utf8_lossy(&response).into_owned()
}

/// Whether the server closes the stream within `max`; pings are skipped
pub async fn closed_within(ws: &mut WsStream, max: Duration) -> bool {
    let deadline = Instant::now() + max;
    loop {
        match tokio::time::timeout_at(deadline, ws.next()).await {
            Err(_) => return false,
            Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(WsMessage::Close(_)))) => return true,
            Ok(Some(Ok(_))) => continue,
        }
    }
}

/// Read until a frame matching `pred` arrives, skipping the rest
pub async fn next_matching<F>(ws: &mut WsStream, max: Duration, pred: F) -> Option<WsMessage>
where
    F: Fn(&WsMessage) -> bool,
{
    let deadline = Instant::now() + max;
    loop {
        match tokio::time::timeout_at(deadline, ws.next()).await {
            Ok(Some(Ok(message))) if pred(&message) => return Some(message),
            Ok(Some(Ok(_))) => continue,
            _ => return None,
        }
    }
}
