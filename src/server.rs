mod http;
mod registry;

pub use self::http::HttpHandler;
pub use registry::PeerIndex;

use self::http::{
    read_request_head, text_response, write_response, HeadError, RequestHead, Route, RouteTable,
};
use crate::config::{ConfigValidator, ProxyConfig};
use crate::connection::ConnectionManager;
use crate::error::{ProxyError, Result};
use crate::limiter::{BandwidthLimiter, ConnLimiter, CountingConnLimiter, SharedBandwidthLimiter};
use crate::protocol::{FrameType, PeerInfo, CLIENT_NAME_HEADER, REAL_IP_HEADER};
use crate::proxy::{CallbackList, PeerCallback, ProxyInstance, ReconnectCallback};
use crate::stats::{ConnectionStats, StatsSnapshot};
use crate::transport::{accept_upgrade, handshake, is_upgrade_request, BoxedTransport, TlsListener};
use ::http::{Request, Response, StatusCode};
use parking_lot::{Mutex, RwLock};
use registry::UpgradeGuard;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// accept 出错后的退避，避免文件描述符耗尽时空转
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// 服务端代理
///
/// 接受客户端的 WebSocket 升级，按 clientName 建立对端索引，
/// 每个对端由一个 [`ConnectionManager`] 管理
pub struct ServerProxy {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    config: ProxyConfig,
    peers: PeerIndex,
    routes: RouteTable,
    conn_limiter: RwLock<Option<Arc<dyn ConnLimiter>>>,
    on_connect: CallbackList<PeerCallback>,
    on_disconnect: CallbackList<PeerCallback>,
    bandwidth: RwLock<Option<Arc<SharedBandwidthLimiter>>>,
    stats: ConnectionStats,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl ProxyInstance for ServerInner {
    fn reconnect_callbacks(&self) -> Vec<ReconnectCallback> {
        Vec::new()
    }

    fn disconnect_callbacks(&self) -> Vec<PeerCallback> {
        self.on_disconnect.snapshot()
    }

    fn on_connect_callbacks(&self) -> Vec<PeerCallback> {
        self.on_connect.snapshot()
    }

    fn bandwidth_limiter(&self) -> Option<Arc<dyn BandwidthLimiter>> {
        self.bandwidth
            .read()
            .clone()
            .map(|limiter| limiter as Arc<dyn BandwidthLimiter>)
    }

    fn proxy_config(&self) -> &ProxyConfig {
        &self.config
    }

    fn stats(&self) -> &ConnectionStats {
        &self.stats
    }
}

impl ServerProxy {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                config,
                peers: PeerIndex::default(),
                routes: RouteTable::default(),
                conn_limiter: RwLock::new(None),
                on_connect: CallbackList::default(),
                on_disconnect: CallbackList::default(),
                bandwidth: RwLock::new(None),
                stats: ConnectionStats::new(),
                accept_task: Mutex::new(None),
                local_addr: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.inner.config
    }

    /// 绑定监听端口并启动 accept 循环
    ///
    /// 绑定失败会直接返回错误；端口 0 会被拒绝
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let config = &inner.config;
        let ip = ConfigValidator::validate_listen_addr(config.host(), config.port())?;

        if inner
            .accept_task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
        {
            return Err(ProxyError::config_error(format!(
                "server '{}' is already running",
                config.name()
            )));
        }

        if !inner.routes.ensure("/", Route::Upgrade) {
            if let Some(Route::Custom(_)) = inner.routes.resolve("/") {
                warn!(
                    "A custom handler occupies '/', websocket upgrade is only reachable through it"
                );
            }
        }

        let limiter = config
            .bandwidth_limiter_cfg()
            .map(|cfg| Arc::new(SharedBandwidthLimiter::new(cfg)));
        if let Some(old) = std::mem::replace(&mut *inner.bandwidth.write(), limiter) {
            old.stop();
        }

        let scope = config.renew_scope();
        let addr = SocketAddr::from((ip, config.port()));
        let listener = match TlsListener::bind(addr, Arc::clone(config.tls())).await {
            Ok(listener) => listener,
            Err(e) => {
                scope.cancel();
                return Err(e);
            }
        };
        let local_addr = listener.local_addr()?;
        *inner.local_addr.lock() = Some(local_addr);

        let task = tokio::spawn(Arc::clone(inner).accept_loop(listener, scope));
        *inner.accept_task.lock() = Some(task);

        info!("Server '{}' listening on wss://{}", config.name(), local_addr);
        Ok(())
    }

    /// 停止服务：取消生命周期信号，逐个停止在线连接，释放监听端口
    ///
    /// 单个连接停止失败只记录日志，可重复调用
    pub async fn stop(&self) {
        let inner = &self.inner;
        inner.config.scope().cancel();

        for (name, manager) in inner.peers.drain() {
            if let Err(e) = manager.stop().await {
                error!("Stop connection of peer '{}' error: {}", name, e);
            }
        }

        if let Some(limiter) = inner.bandwidth.write().take() {
            limiter.stop();
        }

        let task = inner.accept_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Accept loop of '{}' ended abnormally: {}", inner.config.name(), e);
            }
            info!("Server '{}' stopped", inner.config.name());
        }
        inner.local_addr.lock().take();
    }

    /// 以文本帧向指定对端发送 JSON 消息
    pub async fn send<T: Serialize + ?Sized>(&self, client_name: &str, message: &T) -> Result<()> {
        self.send_with_type(client_name, message, FrameType::Text as i32)
            .await
    }

    pub async fn send_with_type<T: Serialize + ?Sized>(
        &self,
        client_name: &str,
        message: &T,
        frame_type: i32,
    ) -> Result<()> {
        let frame_type = FrameType::try_from(frame_type)?;
        let manager = self
            .inner
            .peers
            .get(client_name)
            .ok_or_else(|| ProxyError::unknown_peer(client_name))?;
        let payload = serde_json::to_vec(message)?;
        manager.send(frame_type, payload).await
    }

    pub fn get_all_peers(&self) -> Vec<PeerInfo> {
        let peers = &self.inner.peers;
        peers
            .names()
            .into_iter()
            .filter_map(|name| peers.get(&name))
            .map(|manager| manager.peer().clone())
            .collect()
    }

    pub fn get_peer(&self, client_name: &str) -> Option<PeerInfo> {
        self.inner
            .peers
            .get(client_name)
            .map(|manager| manager.peer().clone())
    }

    /// 限制同时在线的升级连接数
    pub fn set_conn_limiter(&self, max: usize) -> Result<()> {
        if max == 0 {
            return Err(ProxyError::config_error(
                "max connections must be greater than 0",
            ));
        }
        self.set_custom_conn_limiter(Arc::new(CountingConnLimiter::new(max)));
        Ok(())
    }

    pub fn set_custom_conn_limiter(&self, limiter: Arc<dyn ConnLimiter>) {
        *self.inner.conn_limiter.write() = Some(limiter);
    }

    /// 注册自定义 HTTP 接口，路径重复时报错
    pub fn add_handler<F>(&self, url: &str, handler: F) -> Result<()>
    where
        F: Fn(&Request<()>) -> Response<String> + Send + Sync + 'static,
    {
        self.inner.routes.add(url, Route::Custom(Arc::new(handler)))
    }

    /// 传空列表即清空
    pub fn set_on_conn_callback(&self, callbacks: Vec<PeerCallback>) {
        self.inner.on_connect.set(callbacks);
    }

    pub fn set_disconn_callback(&self, callbacks: Vec<PeerCallback>) {
        self.inner.on_disconnect.set(callbacks);
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// 实际监听的地址，未启动时为 None
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    pub fn bandwidth_limiter(&self) -> Option<Arc<SharedBandwidthLimiter>> {
        self.inner.bandwidth.read().clone()
    }
}

impl ServerInner {
    async fn accept_loop(self: Arc<Self>, listener: TlsListener, scope: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                _ = scope.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            let (tcp_stream, remote) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    error!("Accept error on '{}': {}", self.config.name(), e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
            };

            let acceptor = match listener.acceptor() {
                Ok(acceptor) => acceptor,
                Err(e) => {
                    error!("Failed to build TLS acceptor: {}", e);
                    continue;
                }
            };

            let inner = Arc::clone(&self);
            tokio::spawn(async move { inner.serve_conn(acceptor, tcp_stream, remote).await });
        }
        debug!("Accept loop of '{}' exited", self.config.name());
    }

    /// 每个 TCP 连接只处理一个 HTTP 请求
    async fn serve_conn(
        self: &Arc<Self>,
        acceptor: TlsAcceptor,
        tcp_stream: TcpStream,
        remote: SocketAddr,
    ) {
        let config = &self.config;
        let mut stream = match handshake(&acceptor, tcp_stream, config.handshake_timeout()).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!("TLS handshake with {} failed: {}", remote, e);
                return;
            }
        };

        // 读超时覆盖整个请求，请求头的读取取两者中较短的一个
        let head_timeout = config.read_header_timeout().min(config.read_timeout());
        let head = match timeout(
            head_timeout,
            read_request_head(&mut stream, config.header_size_limit()),
        )
        .await
        {
            Ok(Ok(head)) => head,
            Ok(Err(HeadError::TooLarge)) => {
                warn!(
                    "Request header from {} exceeds {} bytes",
                    remote,
                    config.header_size_limit()
                );
                self.respond(
                    &mut stream,
                    StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
                    "request header too large",
                )
                .await;
                return;
            }
            Ok(Err(HeadError::Malformed(msg))) => {
                debug!("Malformed request from {}: {}", remote, msg);
                self.respond(&mut stream, StatusCode::BAD_REQUEST, "malformed request")
                    .await;
                return;
            }
            Ok(Err(e)) => {
                debug!("Request from {}: {}", remote, e);
                return;
            }
            Err(_) => {
                debug!("Read request header from {} timeout", remote);
                return;
            }
        };

        match self.routes.resolve(head.request.uri().path()) {
            Some(Route::Upgrade) => self.handle_upgrade(stream, head, remote).await,
            Some(Route::Custom(handler)) => {
                let response = handler(&head.request);
                self.write(&mut stream, &response).await;
            }
            None => {
                self.respond(&mut stream, StatusCode::NOT_FOUND, "404 page not found")
                    .await;
            }
        }
    }

    async fn handle_upgrade(
        self: &Arc<Self>,
        mut stream: BoxedTransport,
        head: RequestHead,
        remote: SocketAddr,
    ) {
        let RequestHead { request, leftover } = head;

        if !is_upgrade_request(&request) {
            self.reject(&mut stream, remote, "not a websocket upgrade request")
                .await;
            return;
        }

        let limiter = self.conn_limiter.read().clone();
        let Some(_slot) = UpgradeGuard::acquire(limiter) else {
            self.reject(
                &mut stream,
                remote,
                "max websocket client connection reached, please try again later",
            )
            .await;
            return;
        };

        let client_name = header_value(&request, CLIENT_NAME_HEADER);
        if !ConfigValidator::is_valid_serial_number(&client_name) {
            self.reject(&mut stream, remote, &format!("invalid clientName '{}'", client_name))
                .await;
            return;
        }

        let real_ip = header_value(&request, REAL_IP_HEADER);
        if !real_ip.is_empty() && ConfigValidator::parse_ipv4(&real_ip).is_err() {
            self.reject(&mut stream, remote, &format!("invalid X-Real-IP '{}'", real_ip))
                .await;
            return;
        }
        let ip = if real_ip.is_empty() {
            remote.ip().to_string()
        } else {
            real_ip
        };

        let handshake_timeout = self.config.handshake_timeout();
        let ws = match accept_upgrade(stream, &request, leftover, handshake_timeout).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!("Upgrade for '{}' from {} failed: {}", client_name, remote, e);
                self.stats.upgrade_rejected();
                return;
            }
        };

        let weak = Arc::downgrade(self);
        let proxy: Weak<dyn ProxyInstance> = weak;
        let manager = ConnectionManager::new(ws, PeerInfo::new(&client_name, ip), proxy);

        if !self.peers.insert_if_absent(&client_name, Arc::clone(&manager)) {
            warn!(
                "Client '{}' from {} is already connected, closing the new connection",
                client_name, remote
            );
            self.stats.upgrade_rejected();
            if let Err(e) = manager.stop().await {
                debug!("Close duplicate connection of '{}': {}", client_name, e);
            }
            return;
        }

        if let Err(e) = manager.start() {
            error!("Start connection of '{}' failed: {}", client_name, e);
            self.peers.remove_if_same(&client_name, &manager);
            if let Err(e) = manager.stop().await {
                debug!("Close unstarted connection of '{}': {}", client_name, e);
            }
            return;
        }

        manager.done().await;
        self.peers.remove_if_same(&client_name, &manager);
        debug!("Client '{}' removed from peer index", client_name);
    }

    /// 拒绝升级：400 + 简短原因
    async fn reject(&self, stream: &mut BoxedTransport, remote: SocketAddr, reason: &str) {
        warn!("Reject upgrade from {}: {}", remote, reason);
        self.stats.upgrade_rejected();
        self.respond(stream, StatusCode::BAD_REQUEST, reason).await;
    }

    async fn respond(&self, stream: &mut BoxedTransport, status: StatusCode, body: &str) {
        self.write(stream, &text_response(status, body)).await;
    }

    async fn write(&self, stream: &mut BoxedTransport, response: &Response<String>) {
        let deadline = self.config.write_timeout();
        match timeout(deadline, write_response(stream, response)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Write response error: {}", e),
            Err(_) => debug!("Write response timeout after {:?}", deadline),
        }
    }
}

fn header_value<B>(request: &Request<B>, name: &str) -> String {
    request
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .unwrap_or_default()
}

impl Drop for ServerProxy {
    fn drop(&mut self) {
        self.inner.config.scope().cancel();
    }
}
