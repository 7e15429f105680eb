//! 核间中断投递的 Mock 实现
//!
//! 注意：这里不直接依赖 `vm` crate（避免循环依赖）。
//! `vm` crate 在 `cfg(test)` 下为 [`MockIpiSink`] 实现其 `IpiSender` trait。

use alloc::vec::Vec;
use sync::SpinLock;

/// 只记录不投递的 IPI 接收器。
///
/// 用于断言"击落门铃发给了哪个核"；不会真正触发目标核的处理，
/// 因此只适用于不等待确认的测试场景。
pub struct MockIpiSink {
    sent: SpinLock<Vec<usize>>,
}

impl MockIpiSink {
    /// 创建空的记录器。
    pub const fn new() -> Self {
        Self {
            sent: SpinLock::new(Vec::new()),
        }
    }

    /// 记录一次投递。
    pub fn record(&self, target_core: usize) {
        self.sent.lock().push(target_core);
    }

    /// 取出已记录的投递目标。
    pub fn sent(&self) -> Vec<usize> {
        self.sent.lock().clone()
    }

    /// 清空记录。
    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

impl Default for MockIpiSink {
    fn default() -> Self {
        Self::new()
    }
}
