use super::ConnLimiter;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// 计数信号量式的并发连接限制器
#[derive(Debug)]
pub struct CountingConnLimiter {
    max: usize,
    active: AtomicUsize,
}

impl CountingConnLimiter {
    pub fn new(max: usize) -> Self {
        Self {
            max,
            active: AtomicUsize::new(0),
        }
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

impl ConnLimiter for CountingConnLimiter {
    fn try_acquire(&self) -> bool {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max).then_some(n + 1)
            })
            .is_ok()
    }

    fn release(&self) {
        let _ = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

/// RAII 槽位：离开作用域时自动归还
pub struct ConnSlot {
    limiter: Arc<dyn ConnLimiter>,
}

impl ConnSlot {
    /// 限制器已满时返回 None
    pub fn acquire(limiter: Arc<dyn ConnLimiter>) -> Option<Self> {
        limiter.try_acquire().then(|| Self { limiter })
    }
}

impl Drop for ConnSlot {
    fn drop(&mut self) {
        self.limiter.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release() {
        let limiter = CountingConnLimiter::new(2);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        limiter.release();
        assert_eq!(limiter.active(), 1);
        assert!(limiter.try_acquire());
    }

    #[test]
    fn test_release_never_underflows() {
        let limiter = CountingConnLimiter::new(1);
        limiter.release();
        assert_eq!(limiter.active(), 0);
    }

    #[test]
    fn test_slot_guard() {
        let limiter: Arc<dyn ConnLimiter> = Arc::new(CountingConnLimiter::new(1));
        let slot = ConnSlot::acquire(limiter.clone());
        assert!(slot.is_some());
        assert!(ConnSlot::acquire(limiter.clone()).is_none());
        drop(slot);
        assert!(ConnSlot::acquire(limiter).is_some());
    }
}
