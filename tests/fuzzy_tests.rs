/// Fuzzy tests for server robustness
///
/// Garbage on the TLS stream, malformed HTTP heads and random text frames
/// must never take the listener or other peers down.
mod common;

use common::*;
use futures::SinkExt;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use ws_link::handler::EchoHandler;
use ws_link::ServerProxy;

async fn start_server(port: u16, certs: &TestCerts) -> ServerProxy {
    let server = ServerProxy::new(proxy_config(
        "UT_Fuzzy_Server",
        port,
        certs,
        Arc::new(EchoHandler),
    ));
    server.start().await.expect("server start failed");
    server
}

fn random_chunks(count: usize, max_len: usize) -> Vec<Vec<u8>> {
    let mut rng = rand::rng();
    (0..count)
        .map(|_| {
            let len = rng.random_range(1..max_len);
            (0..len).map(|_| rng.random::<u8>()).collect()
        })
        .collect()
}

/// 测试随机数据注入
#[tokio::test]
async fn test_random_data_injection() {
    let certs = TestCerts::generate();
    let port = get_available_port();
    let server = start_server(port, &certs).await;

    for chunk in random_chunks(20, 1000) {
        let mut stream = tls_connect(port, &certs).await;
        let _ = stream.write_all(&chunk).await;
        let _ = stream.flush().await;
        sleep(Duration::from_millis(10)).await;
    }

    // 服务器应该保持运行
    let ws = raw_ws_connect(port, &certs, "edge_after_noise").await;
    assert!(ws.is_ok());
    let registered = || server.get_peer("edge_after_noise").is_some();
    assert!(wait_until(registered, Duration::from_secs(2)).await);

    server.stop().await;
}

/// 测试畸形请求头
#[tokio::test]
async fn test_malformed_request_heads() {
    let certs = TestCerts::generate();
    let port = get_available_port();
    let server = start_server(port, &certs).await;

    let heads = [
        "\r\n\r\n",
        "GET\r\n\r\n",
        "GET / HTTP/2.0\r\n\r\n",
        "GET / HTTP/1.1\r\nno-colon-header\r\n\r\n",
        "GET / HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
    ];
    for head in heads {
        let response = http_request(port, &certs, head).await;
        assert!(response.starts_with("HTTP/1.1 400"), "{:?} -> {}", head, response);
    }

    server.stop().await;
}

/// 测试空连接（连接后不发送任何数据）
#[tokio::test]
async fn test_idle_connection_is_dropped() {
    let certs = TestCerts::generate();
    let port = get_available_port();
    let mut config = proxy_config("UT_Fuzzy_Server", port, &certs, Arc::new(EchoHandler));
    config.set_timeout(Duration::ZERO, Duration::ZERO, Duration::from_millis(300));
    let server = ServerProxy::new(config);
    server.start().await.unwrap();

    let response = http_request(port, &certs, "").await;
    assert!(response.is_empty());
    assert!(server.get_all_peers().is_empty());

    server.stop().await;
}

/// 测试随机文本帧：连接和回显保持正常
#[tokio::test]
async fn test_random_text_frames() {
    let certs = TestCerts::generate();
    let port = get_available_port();
    let server = start_server(port, &certs).await;

    let mut ws = raw_ws_connect(port, &certs, "edge_fuzzy").await.unwrap();
    let texts: Vec<String> = random_chunks(20, 2000)
        .into_iter()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .collect();

    for text in &texts {
        ws.send(WsMessage::text(text.clone())).await.unwrap();
    }
    // 每条消息由独立任务处理，回显顺序不固定
    let mut echoed = Vec::with_capacity(texts.len());
    for _ in 0..texts.len() {
        let message = next_matching(&mut ws, Duration::from_secs(2), |m| m.is_text())
            .await
            .expect("no echo received");
        echoed.push(message.into_text().unwrap().as_str().to_string());
    }
    let mut expected = texts.clone();
    expected.sort();
    echoed.sort();
    assert_eq!(echoed, expected);

    ws.send(WsMessage::Binary(random_chunks(1, 100).remove(0).into()))
        .await
        .unwrap();
    assert!(wait_until(|| server.stats().dropped_non_text == 1, Duration::from_secs(2)).await);
    assert!(server.get_peer("edge_fuzzy").is_some());

    server.stop().await;
}
