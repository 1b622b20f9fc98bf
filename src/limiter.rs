/// 限流模块
///
/// - [`RpsLimiter`]：每个连接独立的请求速率令牌桶
/// - [`SharedBandwidthLimiter`]：同一代理下所有对端共享的字节窗口
/// - [`CountingConnLimiter`]：服务端并发升级连接数上限
mod bandwidth;
mod conn;
mod rps;

pub use bandwidth::{BandwidthLimiterConfig, SharedBandwidthLimiter, DEFAULT_RESERVE_RATE};
pub use conn::{ConnSlot, CountingConnLimiter};
pub use rps::{RpsLimiter, RpsLimiterConfig};

/// 请求速率限制器
pub trait RequestLimiter: Send + Sync {
    /// 有令牌时消耗一个并返回 true
    fn allow(&self) -> bool;
}

/// 跨对端共享的带宽限制器，内部自行同步
pub trait BandwidthLimiter: Send + Sync {
    fn register(&self, sn: &str);
    fn unregister(&self, sn: &str);
    /// 当前窗口内再放行 `len` 字节是否会超出上限
    fn allow(&self, sn: &str, len: usize) -> bool;
    fn stop(&self);
}

/// 并发连接数限制器，服务端对每个升级请求成对调用
pub trait ConnLimiter: Send + Sync {
    fn try_acquire(&self) -> bool;
    fn release(&self);
}
