use super::BoxedTransport;
use crate::error::{ProxyError, Result};
use crate::tls::TlsMaterial;
use rustls::pki_types::ServerName;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info};

/// TLS 拨号器（客户端）
pub struct TlsDialer {
    host: String,
    port: u16,
    tls: Arc<TlsMaterial>,
}

impl TlsDialer {
    pub fn new(host: impl Into<String>, port: u16, tls: Arc<TlsMaterial>) -> Self {
        Self {
            host: host.into(),
            port,
            tls,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// 建立 TCP 连接并完成 TLS 握手，整个过程受 `deadline` 约束
    pub async fn connect(&self, deadline: Duration) -> Result<BoxedTransport> {
        let addr = self.addr();
        debug!("Connecting to {} via TLS", addr);

        // 每次拨号都取最新配置，update_tls_ca 之后的重连能用上新 CA
        let connector = TlsConnector::from(self.tls.client_config()?);
        let server_name = ServerName::try_from(self.host.clone())
            .map_err(|e| ProxyError::config_error(format!("Invalid server name: {}", e)))?;

        let tls_stream = timeout(deadline, async {
            let tcp_stream = TcpStream::connect(&addr).await?;
            tcp_stream.set_nodelay(true)?;
            connector.connect(server_name, tcp_stream).await
        })
        .await
        .map_err(|_| ProxyError::timeout(deadline))?
        .map_err(|e| ProxyError::dial_failed(&addr, e))?;

        debug!("TLS connection established to {}", addr);
        Ok(Box::pin(tls_stream))
    }
}

/// TLS 监听器（服务端）
///
/// accept 只接收 TCP 连接，TLS 握手放到每个连接自己的任务里，
/// 避免慢速握手阻塞监听循环
pub struct TlsListener {
    listener: TcpListener,
    tls: Arc<TlsMaterial>,
}

impl TlsListener {
    pub async fn bind(addr: SocketAddr, tls: Arc<TlsMaterial>) -> Result<Self> {
        // 提前构建一次配置，证书问题在启动时暴露
        tls.server_config()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ProxyError::config_error(format!("Failed to bind to {}: {}", addr, e)))?;

        info!("TLS listener bound on {}", addr);
        Ok(Self { listener, tls })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        let (tcp_stream, peer_addr) = self.listener.accept().await?;
        tcp_stream.set_nodelay(true)?;
        debug!("Accepted TCP connection from {}", peer_addr);
        Ok((tcp_stream, peer_addr))
    }

    /// 以当前的服务端配置生成握手器，CA 更新后的新连接立即生效
    pub fn acceptor(&self) -> Result<TlsAcceptor> {
        Ok(TlsAcceptor::from(self.tls.server_config()?))
    }
}

/// 对已接受的 TCP 连接执行 TLS 握手
///
/// 握手任务不持有监听器
pub async fn handshake(
    acceptor: &TlsAcceptor,
    tcp_stream: TcpStream,
    deadline: Duration,
) -> Result<BoxedTransport> {
    let tls_stream = timeout(deadline, acceptor.accept(tcp_stream))
        .await
        .map_err(|_| ProxyError::timeout(deadline))?
        .map_err(|e| ProxyError::transport(format!("TLS handshake failed: {}", e)))?;
    Ok(Box::pin(tls_stream))
}
