//! 一次性完成信号
//!
//! 单生产者、多等待者的通知原语：一次传输的发起方持有 [`Completion`]，
//! 完成后调用 [`Completion::complete`]；任意数量的等待者可以在其上自旋等待。
//!
//! 典型用法是"页帧内容搬运中"的忙标志：等待者先在锁内克隆
//! `Arc<Completion>`，释放锁后等待，醒来后必须重新取锁并复查状态 ——
//! 信号只表示"这一次传输结束了"，不承诺醒来时帧仍处于等待前观察到的状态。

use core::{
    hint,
    sync::atomic::{AtomicBool, Ordering},
};

/// 一次性完成信号。
///
/// `complete` 只应由发起传输的一方调用一次；重复调用无害但无意义。
#[derive(Debug)]
pub struct Completion {
    done: AtomicBool,
}

impl Completion {
    /// 创建一个尚未完成的信号。
    pub const fn new() -> Self {
        Completion {
            done: AtomicBool::new(false),
        }
    }

    /// 标记完成并唤醒所有等待者。
    pub fn complete(&self) {
        self.done.store(true, Ordering::Release);
    }

    /// 查询是否已完成。
    pub fn is_complete(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// 自旋等待直到完成。
    pub fn wait(&self) {
        while !self.is_complete() {
            hint::spin_loop();
        }
    }

    /// 在给定的自旋预算内等待。
    ///
    /// # 返回值
    /// 在预算内完成返回 true，预算耗尽仍未完成返回 false。
    pub fn wait_spins(&self, budget: u64) -> bool {
        let mut spins = 0u64;
        while !self.is_complete() {
            if spins >= budget {
                return false;
            }
            spins += 1;
            hint::spin_loop();
        }
        true
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}
