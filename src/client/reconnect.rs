use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// 指数退避：每次翻倍，到达上限后保持
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial.min(max),
        }
    }

    /// 返回本次应等待的时长，并推进到下一档
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = std::cmp::min(self.current * 2, self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial.min(self.max);
    }
}

/// 失败次数达到该值的整数倍时才输出日志
pub(crate) const LOG_EVERY_N_FAILURES: u64 = 3;

/// 睡眠期间被取消时返回 false
pub(crate) async fn sleep_or_cancel(scope: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = scope.cancelled() => false,
        _ = sleep(duration) => true,
    }
}
