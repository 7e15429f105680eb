//! 自旋锁实现
//!
//! 基于原子操作实现自旋锁机制，通过 `lock_api` 暴露为带 RAII 保护器的
//! [`SpinLock`](crate::SpinLock)。

use core::{
    hint,
    sync::atomic::{AtomicBool, Ordering},
};

/// 自旋锁的底层实现，提供互斥访问临界区的能力。
///
/// 不可重入（即不能嵌套获取同一把锁）。一般不直接使用本类型，
/// 而是通过 [`SpinLock`](crate::SpinLock) 携带被保护的数据。
#[derive(Debug)]
pub struct RawSpinLock {
    lock: AtomicBool,
}

impl RawSpinLock {
    /// 创建一个新的 RawSpinLock 实例。
    pub const fn new() -> Self {
        RawSpinLock {
            lock: AtomicBool::new(false),
        }
    }

    /// 检查锁是否被占用（仅用于调试/测试）。
    #[cfg(test)]
    pub fn is_locked(&self) -> bool {
        self.lock.load(Ordering::Relaxed)
    }
}

impl Default for RawSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl lock_api::RawMutex for RawSpinLock {
    const INIT: Self = RawSpinLock::new();

    // 保护器可以跨线程发送
    type GuardMarker = lock_api::GuardSend;

    fn lock(&self) {
        while self
            .lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            hint::spin_loop();
        }
    }

    fn try_lock(&self) -> bool {
        self.lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    unsafe fn unlock(&self) {
        self.lock.store(false, Ordering::Release);
    }
}
