//! 地址空间深拷贝（fork）
//!
//! 为子进程生成段布局、堆边界完全相同的地址空间，并对每个源 PTE
//! 做帧不相交的逐字节拷贝：驻留页在帧表锁内存拷贝，已换出的页
//! 放锁后从交换区读进子进程的新帧。不存在写时复制 —— 父子立即分叉。
//!
//! 子进程在拷贝开始前就登记进注册表：已拷入的子页随即对换页引擎
//! 可见、可被正常换出。中途分配失败时整体回退，不留下半活的地址空间。

use crate::address::Vpn;
use crate::addrspace::{AddressSpace, PageBacking, PageTableEntry};
use crate::coremap::PageOwner;
use crate::error::VmResult;
use crate::manager::VmManager;
use crate::registry::{Pid, Process};
use alloc::sync::Arc;
use alloc::vec::Vec;
use sync::Completion;

/// 拷贝单页时的下一步动作。
enum CopyAction {
    /// 源帧正忙（可能正被换出），等完成信号后复查
    Wait(Arc<Completion>),
    /// 源页驻留，帧表锁内存拷贝
    Mem(crate::address::Ppn),
    /// 源页在交换区，放锁读盘
    Disk(usize),
}

impl VmManager {
    /// fork 的地址空间深拷贝（as_copy）。
    ///
    /// 成功时返回已登记好的子进程句柄；任何一页分配失败都会销毁
    /// 已拷贝的部分并注销子进程，返回内存不足。
    pub fn as_copy(
        &self,
        parent: &Arc<Process>,
        child_pid: Pid,
        child_core: usize,
    ) -> VmResult<Arc<Process>> {
        let src = parent.space();
        let child_space = src.clone_layout();
        let child = Process::new(child_pid, child_core, child_space.clone());
        let replaced = self.registry.register(child.clone());
        debug_assert!(replaced.is_none(), "as_copy: child pid already registered");

        // 父进程在 fork 期间挂起，页表键集不会增删；换页引擎只会把
        // 驻留页改写为换出页，逐页循环里会处理这种状态变化。
        let vpns: Vec<Vpn> = src.inner.lock().pages.keys().copied().collect();
        log::debug!(
            "as_copy: pid {} -> pid {}, {} pages",
            parent.pid().0,
            child_pid.0,
            vpns.len()
        );

        for vpn in vpns {
            if let Err(e) = self.copy_one_page(src, &child_space, parent.core(), child_pid, vpn) {
                log::warn!(
                    "as_copy: pid {} -> pid {} failed at vpn {:#x}: {:?}",
                    parent.pid().0,
                    child_pid.0,
                    vpn.as_usize(),
                    e
                );
                // 先释放已拷贝的一切，再注销子进程
                self.as_destroy(&child_space);
                self.registry.unregister(child_pid);
                return Err(e);
            }
        }
        Ok(child)
    }

    /// 把源地址空间的一页拷进子进程的新帧并绑定子 PTE。
    fn copy_one_page(
        &self,
        src: &Arc<AddressSpace>,
        dst: &Arc<AddressSpace>,
        current_core: usize,
        child_pid: Pid,
        vpn: Vpn,
    ) -> VmResult<()> {
        let table = self.coremap.lock();
        let (mut table, dst_ppn) =
            self.user_alloc_onepage(table, PageOwner { pid: child_pid, vpn }, Some(current_core))?;

        // 分配期间帧表锁可能被放开过，源页状态要现查；源帧忙（正被
        // 换出）就等它结束再看。
        loop {
            let action = {
                let inner = src.inner.lock();
                let pte = inner
                    .pages
                    .get(&vpn)
                    .expect("source PTE vanished during fork");
                match pte.backing {
                    PageBacking::Resident(src_ppn) => match &table.frame(src_ppn).busy {
                        Some(busy) => CopyAction::Wait(busy.clone()),
                        None => CopyAction::Mem(src_ppn),
                    },
                    PageBacking::Swapped(slot) => CopyAction::Disk(slot),
                }
            };
            match action {
                CopyAction::Wait(busy) => {
                    drop(table);
                    busy.wait();
                    table = self.coremap.lock();
                }
                CopyAction::Mem(src_ppn) => {
                    // 持锁拷贝：换页引擎无法在拷贝中途动源帧
                    self.phys.copy_frame(src_ppn, dst_ppn);
                    break;
                }
                CopyAction::Disk(slot) => {
                    let store = self.swap.as_ref().expect("swapped PTE without a swap store");
                    drop(table);
                    // SAFETY: 目标帧已标记忙，本线程独占其内容。父进程
                    // 挂起且换页引擎从不释放交换槽，槽位内容稳定。
                    store.read_page(slot, unsafe { self.phys.frame_bytes_mut(dst_ppn) });
                    table = self.coremap.lock();
                    break;
                }
            }
        }

        {
            let mut inner = dst.inner.lock();
            inner.pages.insert(
                vpn,
                PageTableEntry {
                    backing: PageBacking::Resident(dst_ppn),
                    dirty: true,
                },
            );
        }
        let busy = table
            .frame_mut(dst_ppn)
            .busy
            .take()
            .expect("fork frame lost its busy marker");
        busy.complete();
        Ok(())
    }
}
