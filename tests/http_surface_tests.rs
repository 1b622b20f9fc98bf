/// Tests of the HTTP side of the server: custom routes, upgrade rejection and binding
mod common;

use common::*;
use http::{HeaderMap, HeaderValue, Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use ws_link::handler::EchoHandler;
use ws_link::transport::{connect_upgrade, TlsDialer};
use ws_link::ServerProxy;

fn server(port: u16, certs: &TestCerts) -> ServerProxy {
    ServerProxy::new(proxy_config("UT_Http_Server", port, certs, Arc::new(EchoHandler)))
}

#[tokio::test]
async fn test_custom_handler() {
    let certs = TestCerts::generate();
    let port = get_available_port();
    let server = server(port, &certs);
    server
        .add_handler("/healthz", |req| {
            Response::builder()
                .status(StatusCode::OK)
                .header("x-path", req.uri().path())
                .body("ok".to_string())
                .unwrap()
        })
        .unwrap();
    server.start().await.unwrap();

    let response = http_request(
        port,
        &certs,
        "GET /healthz HTTP/1.1\r\nHost: localhost\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{}", response);
    assert!(response.contains("x-path: /healthz\r\n"));
    assert!(response.contains("Connection: close\r\n"));
    assert!(response.ends_with("\r\n\r\nok"));

    server.stop().await;
}

#[tokio::test]
async fn test_add_handler_validation() {
    let certs = TestCerts::generate();
    let server = server(get_available_port(), &certs);

    server
        .add_handler("/metrics", |_| Response::new(String::new()))
        .unwrap();
    let err = server
        .add_handler("/metrics", |_| Response::new(String::new()))
        .unwrap_err();
    assert!(err.is_config_error());

    let err = server
        .add_handler("status", |_| Response::new(String::new()))
        .unwrap_err();
    assert!(err.is_config_error());
}

#[tokio::test]
async fn test_plain_request_to_upgrade_route() {
    let certs = TestCerts::generate();
    let port = get_available_port();
    let server = server(port, &certs);
    server.start().await.unwrap();

    for path in ["/", "/anything"] {
        let request = format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path);
        let response = http_request(port, &certs, &request).await;
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{}", response);
    }
    assert_eq!(server.stats().upgrades_rejected, 2);

    let response = http_request(port, &certs, "NOT-HTTP\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 400"), "{}", response);

    server.stop().await;
}

#[tokio::test]
async fn test_oversized_request_header() {
    let certs = TestCerts::generate();
    let port = get_available_port();
    let server = server(port, &certs);
    server.start().await.unwrap();

    let limit = server.config().header_size_limit();
    let request = format!(
        "GET / HTTP/1.1\r\nHost: localhost\r\nX-Padding: {}\r\n\r\n",
        "p".repeat(limit)
    );
    let response = http_request(port, &certs, &request).await;
    assert!(
        response.starts_with("HTTP/1.1 431 Request Header Fields Too Large\r\n"),
        "{}",
        response
    );

    server.stop().await;
}

#[tokio::test]
async fn test_connection_limiter() {
    let certs = TestCerts::generate();
    let port = get_available_port();
    let server = server(port, &certs);
    assert!(server.set_conn_limiter(0).unwrap_err().is_config_error());
    server.set_conn_limiter(1).unwrap();
    server.start().await.unwrap();

    let first = raw_ws_connect(port, &certs, "edge_a").await.unwrap();
    assert!(raw_ws_connect(port, &certs, "edge_b").await.is_err());
    assert_eq!(server.get_all_peers().len(), 1);

    drop(first);
    assert!(wait_until(|| server.get_all_peers().is_empty(), Duration::from_secs(3)).await);

    // 槽位在升级任务结束后才释放
    let mut second = None;
    for _ in 0..20 {
        if let Ok(ws) = raw_ws_connect(port, &certs, "edge_b").await {
            second = Some(ws);
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(second.is_some());
    assert!(wait_until(|| server.get_peer("edge_b").is_some(), Duration::from_secs(2)).await);

    server.stop().await;
}

#[tokio::test]
async fn test_upgrade_header_validation() {
    let certs = TestCerts::generate();
    let port = get_available_port();
    let server = server(port, &certs);
    server.start().await.unwrap();

    assert!(raw_ws_connect(port, &certs, "bad name!").await.is_err());
    assert!(raw_ws_connect(port, &certs, "").await.is_err());

    let connect_with_ip = |ip: &'static str| {
        let material = certs.material();
        async move {
            let stream = TlsDialer::new(LOCALHOST, port, material)
                .connect(Duration::from_secs(5))
                .await?;
            let mut headers = HeaderMap::new();
            headers.insert("clientname", HeaderValue::from_static("edge_ip"));
            headers.insert("x-real-ip", HeaderValue::from_static(ip));
            connect_upgrade(
                stream,
                &format!("wss://{}:{}/", LOCALHOST, port),
                headers,
                Duration::from_secs(5),
            )
            .await
        }
    };

    assert!(connect_with_ip("300.1.2.3").await.is_err());
    let _ws = connect_with_ip("10.1.2.3").await.unwrap();
    assert!(wait_until(|| server.get_peer("edge_ip").is_some(), Duration::from_secs(2)).await);
    assert_eq!(server.get_peer("edge_ip").unwrap().ip, "10.1.2.3");
    assert_eq!(server.stats().upgrades_rejected, 3);

    server.stop().await;
}

#[tokio::test]
async fn test_bind_errors() {
    let certs = TestCerts::generate();

    let err = server(0, &certs).start().await.unwrap_err();
    assert!(err.is_config_error());

    let config = ws_link::ProxyConfig::initialize(
        "UT_Http_Server",
        "localhost",
        get_available_port(),
        &certs.tls_info(),
    );
    if let Ok(config) = config {
        let err = ServerProxy::new(config).start().await.unwrap_err();
        assert!(err.is_config_error());
    }

    let occupied = std::net::TcpListener::bind((LOCALHOST, 0)).unwrap();
    let port = occupied.local_addr().unwrap().port();
    assert!(server(port, &certs).start().await.is_err());
}

#[tokio::test]
async fn test_start_twice_and_restart() {
    let certs = TestCerts::generate();
    let port = get_available_port();
    let server = server(port, &certs);

    server.start().await.unwrap();
    assert_eq!(server.local_addr().unwrap().port(), port);
    assert!(server.start().await.unwrap_err().is_config_error());

    server.stop().await;
    assert!(server.local_addr().is_none());

    server.start().await.unwrap();
    let ws = raw_ws_connect(port, &certs, "edge_again").await;
    assert!(ws.is_ok());
    server.stop().await;
}
