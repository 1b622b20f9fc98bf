/// 单条 WebSocket 连接的生命周期管理
///
/// 每个已升级的连接由一个 [`ConnectionManager`] 负责：
/// - 接收循环：分发文本消息、更新存活时间、执行限流
/// - 心跳循环：定期发送 Ping 并检测超时
/// - 发送：所有写操作经由同一把异步锁串行化
/// - 停止：幂等，任意一方（任一循环、代理、调用者）触发都只执行一次拆除
use crate::config::HeartbeatConfig;
use crate::error::{ProxyError, Result};
use crate::handler::MessageHandler;
use crate::limiter::{BandwidthLimiter, RequestLimiter, RpsLimiter};
use crate::protocol::{FrameType, PeerInfo, PING_PAYLOAD};
use crate::proxy::ProxyInstance;
use crate::stats::ConnectionStats;
use crate::transport::WsStream;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type WsSink = SplitSink<WsStream, WsMessage>;
type WsSource = SplitStream<WsStream>;

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// 已升级，尚未启动
    Init,
    Connected,
    /// 正在拆除
    Teardown,
    Closed,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnState::Init => "init",
            ConnState::Connected => "connected",
            ConnState::Teardown => "teardown",
            ConnState::Closed => "closed",
        };
        f.write_str(s)
    }
}

pub struct ConnectionManager {
    peer: PeerInfo,
    proxy: Weak<dyn ProxyInstance>,
    handler: Option<Arc<dyn MessageHandler>>,
    heartbeat: HeartbeatConfig,
    write_timeout: Duration,
    stats: ConnectionStats,

    /// 写半部，同时充当发送锁
    sink: tokio::sync::Mutex<Option<WsSink>>,
    /// 读半部，启动时交给接收循环
    source: parking_lot::Mutex<Option<WsSource>>,

    state: watch::Sender<ConnState>,
    /// 仍在运行的循环数
    loops: watch::Sender<usize>,
    last_alive: parking_lot::Mutex<Instant>,
    cancel: parking_lot::Mutex<CancellationToken>,

    rps_limiter: parking_lot::Mutex<Option<RpsLimiter>>,
    bandwidth: parking_lot::Mutex<Option<Arc<dyn BandwidthLimiter>>>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionManager {
    /// 包装一个已完成升级的连接，处于 [`ConnState::Init`] 状态
    pub fn new(ws: WsStream, peer: PeerInfo, proxy: Weak<dyn ProxyInstance>) -> Arc<Self> {
        let (handler, heartbeat, write_timeout, stats) = match proxy.upgrade() {
            Some(p) => {
                let config = p.proxy_config();
                (
                    config.handler(),
                    config.heartbeat(),
                    config.write_timeout(),
                    p.stats().clone(),
                )
            }
            None => (
                None,
                HeartbeatConfig::default(),
                crate::config::DEFAULT_WRITE_TIMEOUT,
                ConnectionStats::new(),
            ),
        };

        let (sink, source) = ws.split();
        let (state, _) = watch::channel(ConnState::Init);
        let (loops, _) = watch::channel(0usize);

        Arc::new(Self {
            peer,
            proxy,
            handler,
            heartbeat,
            write_timeout,
            stats,
            sink: tokio::sync::Mutex::new(Some(sink)),
            source: parking_lot::Mutex::new(Some(source)),
            state,
            loops,
            last_alive: parking_lot::Mutex::new(Instant::now()),
            cancel: parking_lot::Mutex::new(CancellationToken::new()),
            rps_limiter: parking_lot::Mutex::new(None),
            bandwidth: parking_lot::Mutex::new(None),
        })
    }

    pub fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    pub fn state(&self) -> ConnState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    /// 最近一次收到 Ping / Pong 的时间
    pub fn last_alive(&self) -> Instant {
        *self.last_alive.lock()
    }

    /// 启动连接：装配限流器、执行建连回调，再拉起心跳和接收循环
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let proxy = self.proxy.upgrade().ok_or(ProxyError::NotConnected)?;
        let config = proxy.proxy_config();

        let source = {
            if self.state() != ConnState::Init {
                return Err(ProxyError::transport(format!(
                    "connection of [{}] cannot start in state {}",
                    self.peer,
                    self.state()
                )));
            }
            self.source.lock().take().ok_or(ProxyError::NotConnected)?
        };

        let cancel = config.scope().child_token();
        *self.cancel.lock() = cancel.clone();

        // 先登记循环数，stop 一旦看到 Connected 就必须等到两个循环退出
        self.loops.send_replace(2);
        let mut started = false;
        self.state.send_if_modified(|s| {
            if *s == ConnState::Init {
                *s = ConnState::Connected;
                started = true;
            }
            started
        });
        if !started {
            self.loops.send_replace(0);
            return Err(ProxyError::NotConnected);
        }
        *self.last_alive.lock() = Instant::now();

        if let Some(cfg) = config.rps_limiter_cfg() {
            match RpsLimiter::new(cfg) {
                Ok(limiter) => *self.rps_limiter.lock() = Some(limiter),
                Err(e) => warn!("Failed to create rps limiter for [{}]: {}", self.peer, e),
            }
        }
        if let Some(bandwidth) = proxy.bandwidth_limiter() {
            bandwidth.register(&self.peer.sn);
            *self.bandwidth.lock() = Some(bandwidth);
        }

        self.stats.connection_opened();
        for callback in proxy.on_connect_callbacks() {
            callback(&self.peer);
        }

        tokio::spawn(Arc::clone(self).heartbeat_loop(cancel.clone()));
        tokio::spawn(Arc::clone(self).receive_loop(source, cancel));

        info!("Connection of [{}] started", self.peer);
        Ok(())
    }

    /// 按帧类型发送一条消息
    pub async fn send(&self, frame_type: FrameType, payload: Vec<u8>) -> Result<()> {
        if !self.is_connected() {
            return Err(ProxyError::NotConnected);
        }
        let message = frame_type.into_message(payload)?;
        self.send_message(message).await
    }

    async fn send_message(&self, message: WsMessage) -> Result<()> {
        let mut guard = self.sink.lock().await;
        // 拿到锁之后再确认一次，拆除开始后不再写出任何帧
        if !self.is_connected() {
            return Err(ProxyError::NotConnected);
        }
        let sink = guard.as_mut().ok_or(ProxyError::NotConnected)?;
        timeout(self.write_timeout, sink.send(message))
            .await
            .map_err(|_| ProxyError::timeout(self.write_timeout))??;
        self.stats.frame_sent();
        Ok(())
    }

    /// 停止连接，可重复调用
    ///
    /// 第一个调用者负责取消两个循环、等待它们退出并关闭底层连接；
    /// 其余调用者等待拆除完成后返回
    pub async fn stop(&self) -> Result<()> {
        let mut was_connected = false;
        let first = self.state.send_if_modified(|s| match s {
            ConnState::Init => {
                *s = ConnState::Teardown;
                true
            }
            ConnState::Connected => {
                was_connected = true;
                *s = ConnState::Teardown;
                true
            }
            _ => false,
        });

        if !first {
            let mut state = self.state.subscribe();
            let _ = state.wait_for(|s| *s == ConnState::Closed).await;
            return Ok(());
        }

        debug!("Stopping connection of [{}]", self.peer);
        self.cancel.lock().cancel();

        let mut loops = self.loops.subscribe();
        let _ = loops.wait_for(|n| *n == 0).await;

        let result = self.close_sink().await;
        self.source.lock().take();

        if was_connected {
            self.stats.connection_closed();
        }
        self.state.send_replace(ConnState::Closed);
        info!("Connection of [{}] closed", self.peer);
        result
    }

    /// 等待连接进入拆除流程
    pub async fn done(&self) {
        let token = self.cancel.lock().clone();
        token.cancelled().await;
    }

    /// 等待拆除完成
    pub async fn closed(&self) {
        let mut state = self.state.subscribe();
        let _ = state.wait_for(|s| *s == ConnState::Closed).await;
    }

    async fn close_sink(&self) -> Result<()> {
        let Some(mut sink) = self.sink.lock().await.take() else {
            return Ok(());
        };
        match timeout(self.write_timeout, sink.close()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                // 对端已先行断开时关闭失败属于正常情况
                debug!("Close connection of [{}]: {}", self.peer, e);
                Ok(())
            }
            Err(_) => Err(ProxyError::timeout(self.write_timeout)),
        }
    }

    fn touch(&self) {
        *self.last_alive.lock() = Instant::now();
    }

    fn loop_exited(&self) {
        self.loops.send_modify(|n| *n = n.saturating_sub(1));
    }

    async fn heartbeat_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                break;
            }
            if let Err(e) = self
                .send(FrameType::Ping, PING_PAYLOAD.as_bytes().to_vec())
                .await
            {
                error!("Send ping to [{}] error: {}", self.peer, e);
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(self.heartbeat.interval) => {}
            }

            let silent = self.last_alive().elapsed();
            if silent > self.heartbeat.timeout {
                error!(
                    "Heartbeat of [{}] timeout, no ping/pong for {:?}",
                    self.peer, silent
                );
                break;
            }
        }

        debug!("Heartbeat loop of [{}] exited", self.peer);
        self.loop_exited();
        if let Err(e) = self.stop().await {
            warn!("Stop connection of [{}] error: {}", self.peer, e);
        }
    }

    async fn receive_loop(self: Arc<Self>, mut source: WsSource, cancel: CancellationToken) {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Receive loop of [{}] cancelled", self.peer);
                    break;
                }
                next = source.next() => next,
            };

            let message = match next {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    error!("Read next websocket message from [{}] error: {}", self.peer, e);
                    break;
                }
                None => {
                    warn!("Connection of [{}] closed by peer", self.peer);
                    break;
                }
            };

            match message {
                WsMessage::Text(_) => self.dispatch(message.into_data()),
                // Pong 由协议层自动回复
                WsMessage::Ping(_) | WsMessage::Pong(_) => self.touch(),
                WsMessage::Close(frame) => {
                    info!("Received close from [{}]: {:?}", self.peer, frame);
                }
                WsMessage::Binary(data) => {
                    error!(
                        "Unsupported binary message ({} bytes) from [{}], dropped",
                        data.len(),
                        self.peer
                    );
                    self.stats.dropped_non_text();
                }
                WsMessage::Frame(_) => {}
            }
        }

        drop(source);
        self.post_process();
        self.loop_exited();
        if let Err(e) = self.stop().await {
            warn!("Stop connection of [{}] error: {}", self.peer, e);
        }
    }

    /// 限流检查通过后交给处理器，非空回复以文本帧写回
    fn dispatch(self: &Arc<Self>, payload: Bytes) {
        if !self.admit(payload.len()) {
            return;
        }
        let Some(handler) = self.handler.clone() else {
            error!("Message handler is not initialized, message from [{}] dropped", self.peer);
            return;
        };
        self.stats.message_received(payload.len());

        let manager = Arc::clone(self);
        let peer = self.peer.to_msg_peer_info();
        tokio::spawn(async move {
            let reply = handler.handle_msg(payload, peer).await;
            if reply.is_empty() {
                return;
            }
            if let Err(e) = manager.send(FrameType::Text, reply).await {
                error!("Reply to [{}] error: {}", manager.peer, e);
            }
        });
    }

    fn admit(&self, len: usize) -> bool {
        if let Some(limiter) = self.rps_limiter.lock().as_ref() {
            if !limiter.allow() {
                warn!("Rps limit reached for [{}], message dropped", self.peer);
                self.stats.dropped_by_rps();
                return false;
            }
        }
        if let Some(limiter) = self.bandwidth.lock().as_ref() {
            if !limiter.allow(&self.peer.sn, len) {
                warn!(
                    "Bandwidth limit reached for [{}], {} bytes dropped",
                    self.peer, len
                );
                self.stats.dropped_by_bandwidth();
                return false;
            }
        }
        true
    }

    /// 接收循环退出后的清理：断开回调、注销带宽、释放速率限制器
    fn post_process(&self) {
        if let Some(proxy) = self.proxy.upgrade() {
            for callback in proxy.disconnect_callbacks() {
                callback(&self.peer);
            }
        }
        if let Some(bandwidth) = self.bandwidth.lock().take() {
            bandwidth.unregister(&self.peer.sn);
        }
        self.rps_limiter.lock().take();
    }
}
