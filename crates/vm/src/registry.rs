//! 进程注册表
//!
//! pid 到进程句柄的并发安全映射。换页引擎用它找到牺牲帧属主的
//! 地址空间和调度核；系统调用层用它解析当前进程。
//!
//! 注销顺序约定：先 [`VmManager::as_destroy`](crate::VmManager::as_destroy)
//! 释放地址空间，再 [`ProcessRegistry::unregister`]。换页引擎在重写他人
//! PTE 时要求属主仍然在册，查不到按页表链接损坏处理（panic）。

use crate::addrspace::AddressSpace;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};
use hashbrown::HashMap;
use sync::SpinLock;

/// 进程标识符。
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub struct Pid(pub u32);

/// 进程句柄：VM 子系统关心的进程侧状态。
///
/// 进程模型是单线程的：一个进程同一时刻只在一个核上运行，
/// `core` 记录其线程当前被调度到的核。
#[derive(Debug)]
pub struct Process {
    pid: Pid,
    core: AtomicUsize,
    space: Arc<AddressSpace>,
}

impl Process {
    /// 创建进程句柄。
    pub fn new(pid: Pid, core: usize, space: Arc<AddressSpace>) -> Arc<Self> {
        Arc::new(Process {
            pid,
            core: AtomicUsize::new(core),
            space,
        })
    }

    /// 进程号。
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// 当前调度核。
    pub fn core(&self) -> usize {
        self.core.load(Ordering::Acquire)
    }

    /// 迁移到另一个核（由调度器在切换时调用）。
    pub fn set_core(&self, core: usize) {
        self.core.store(core, Ordering::Release);
    }

    /// 地址空间。
    pub fn space(&self) -> &Arc<AddressSpace> {
        &self.space
    }
}

/// pid → 进程句柄的并发安全注册表。
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    table: SpinLock<HashMap<Pid, Arc<Process>>>,
}

impl ProcessRegistry {
    /// 创建空注册表。
    pub fn new() -> Self {
        ProcessRegistry {
            table: SpinLock::new(HashMap::new()),
        }
    }

    /// 登记进程。同 pid 重复登记视为 exec 替换，旧句柄被返回。
    pub fn register(&self, proc: Arc<Process>) -> Option<Arc<Process>> {
        self.table.lock().insert(proc.pid(), proc)
    }

    /// 注销进程，返回被移除的句柄。
    pub fn unregister(&self, pid: Pid) -> Option<Arc<Process>> {
        self.table.lock().remove(&pid)
    }

    /// 查询进程。
    pub fn get(&self, pid: Pid) -> Option<Arc<Process>> {
        self.table.lock().get(&pid).cloned()
    }

    /// 在册进程数。
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    /// 注册表是否为空。
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_lookup_unregister() {
        let registry = ProcessRegistry::new();
        let space = AddressSpace::new(4);
        let p = Process::new(Pid(7), 0, space);

        assert!(registry.register(p).is_none());
        assert_eq!(registry.len(), 1);

        let got = registry.get(Pid(7)).expect("pid 7 registered");
        assert_eq!(got.pid(), Pid(7));
        assert_eq!(got.core(), 0);
        got.set_core(2);
        assert_eq!(got.core(), 2);

        assert!(registry.get(Pid(8)).is_none());
        assert!(registry.unregister(Pid(7)).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_reregister_replaces() {
        let registry = ProcessRegistry::new();
        let a = Process::new(Pid(1), 0, AddressSpace::new(4));
        let b = Process::new(Pid(1), 1, AddressSpace::new(4));
        registry.register(a);
        let old = registry.register(b).expect("exec replace returns old");
        assert_eq!(old.core(), 0);
        assert_eq!(registry.get(Pid(1)).unwrap().core(), 1);
    }
}
