//! 换页引擎
//!
//! 在没有空闲帧时腾出一帧：选牺牲帧、写到交换区、改写属主 PTE、
//! 击落过期的 TLB 翻译，最后按调用方要求的状态移交该帧。
//!
//! 交换槽分配失败和磁盘写失败都是致命错误：一次换出横跨两个
//! 地址空间的状态，半途而废没有定义好的回滚路径。

use crate::address::Ppn;
use crate::addrspace::PageBacking;
use crate::coremap::{CoreMap, FrameStatus};
use crate::error::{VmError, VmResult};
use crate::manager::VmManager;
use alloc::sync::Arc;
use sync::{Completion, SpinLockGuard};

impl VmManager {
    /// 换出一帧并按 `status` 移交给调用方。
    ///
    /// 进入时必须持有帧表锁（以保护器传入）；磁盘 I/O 期间锁被释放、
    /// 牺牲帧保持 Fixed + 忙，返回时锁已重新取得。未配置交换时返回
    /// [`VmError::SwapUnavailable`]，所有候选帧都不可选时返回
    /// [`VmError::OutOfMemory`]。
    ///
    /// `current_core` 是调用方线程所在的核（内核路径无核上下文时为
    /// None），用于决定本地失效还是跨核击落。
    pub(crate) fn swap_out<'a>(
        &'a self,
        mut table: SpinLockGuard<'a, CoreMap>,
        status: FrameStatus,
        current_core: Option<usize>,
    ) -> VmResult<(SpinLockGuard<'a, CoreMap>, Ppn)> {
        let store = self.swap.as_ref().ok_or(VmError::SwapUnavailable)?;

        let victim = table.find_victim().ok_or(VmError::OutOfMemory)?;
        let owner = table
            .frame(victim)
            .owner
            .expect("victim frame has no owner");

        // 立即标记 Fixed + 忙，防止放锁期间被再次选中或触碰
        let busy = Arc::new(Completion::new());
        {
            let frame = table.frame_mut(victim);
            frame.status = FrameStatus::Fixed;
            frame.busy = Some(busy.clone());
        }

        let slot = table
            .swap_bitmap
            .as_mut()
            .expect("swap store without bitmap")
            .alloc()
            .unwrap_or_else(|| panic!("swap space exhausted"));

        log::debug!(
            "evict: frame {} (pid {} vpn {:#x}) -> swap slot {}",
            victim.as_usize(),
            owner.pid.0,
            owner.vpn.as_usize(),
            slot
        );

        // 放锁做磁盘写；其它线程只会阻塞在这一帧上
        drop(table);
        // SAFETY: 牺牲帧已标记忙，本线程独占其内容。
        let bytes = unsafe { self.phys.frame_bytes(victim) };
        store.write_page(slot, bytes);
        let mut table = self.coremap.lock();

        // 把属主 PTE 改绑到交换槽。换页引擎是唯一会改写他人页表的
        // 角色，整个改写都在帧表锁内完成。
        let proc = self.registry.get(owner.pid).unwrap_or_else(|| {
            panic!("page-table linkage corrupt: pid {} not registered", owner.pid.0)
        });
        {
            let mut inner = proc.space().inner.lock();
            let pte = inner
                .pages
                .get_mut(&owner.vpn)
                .expect("victim PTE missing from owner page table");
            match pte.backing {
                PageBacking::Resident(p) => debug_assert_eq!(p, victim),
                PageBacking::Swapped(_) => panic!("victim PTE already on swap"),
            }
            pte.backing = PageBacking::Swapped(slot);
            pte.dirty = false;
        }

        // 击落过期翻译
        if table.frame(victim).in_tlb {
            self.invalidate_frame(current_core, proc.core(), victim);
            table.frame_mut(victim).in_tlb = false;
        }

        // 按调用方要求的状态移交
        {
            let frame = table.frame_mut(victim);
            frame.status = status;
            frame.owner = None;
            frame.last_touch = 0;
            frame.run_len = 0;
            frame.busy = None;
        }
        busy.complete();

        Ok((table, victim))
    }
}
