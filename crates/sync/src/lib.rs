//! 同步原语
//!
//! 向其它内核模块提供基本的锁和同步原语，
//! 包括自旋锁和一次性完成信号（completion）。
//!
//! # 使用约定
//!
//! 这里的原语是 VM 等子系统的"给定构件"：调用方负责锁序和
//! 临界区纪律，本 crate 不做任何重入探测。

#![no_std]

mod completion;
mod raw_spin_lock;

pub use completion::*;
pub use raw_spin_lock::*;

/// 由 [`RawSpinLock`] 支撑的互斥自旋锁。
///
/// # 示例
/// ```ignore
/// let lock = SpinLock::new(0);
/// {
///     let mut guard = lock.lock(); // 获取锁
///     *guard += 1; // 访问和修改数据
/// } // 离开作用域，自动释放锁
/// ```
///
/// # 注意
/// SpinLock 不是可重入的。当持有锁时，尝试再次获取锁将导致死锁。
pub type SpinLock<T> = lock_api::Mutex<RawSpinLock, T>;

/// SpinLock 的 RAII 保护器，提供对锁定数据的访问。
///
/// 当保护器离开作用域时，自动释放锁。
pub type SpinLockGuard<'a, T> = lock_api::MutexGuard<'a, RawSpinLock, T>;
