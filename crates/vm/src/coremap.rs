//! 帧表（coremap）与帧分配器
//!
//! 本模块提供物理帧的全局簿记和分配功能。
//!
//! ## 帧表
//!
//! 每个物理帧对应一个 [`FrameSlot`]：状态（Free/Dirty/Fixed）、属主
//! （进程号 + 虚拟页号，即指回属主 PTE 的逻辑反向指针）、忙信号、
//! TLB 驻留标志、最近触碰时间戳，以及内核连续段首帧上的段长。
//!
//! ## 分配策略
//!
//! - 内核分配 [`VmManager::alloc_kpages`]：线性扫描找连续空闲段，
//!   整段标记 Fixed；多页段找不到就失败，从不为多页段换出。
//!   单页内核分配在无空闲帧时可以走换出路径。
//! - 用户分配 `user_alloc_onepage`：返回一个清零的 Dirty 帧，
//!   绑定属主并保持忙标记，直到调用方把 PTE 绑定完成；
//!   无空闲帧时触发换出。
//!
//! 所有帧表变更都串行在同一把帧表锁上；这把锁同时保护交换位图，
//! 是分配、换出与缺页活动的唯一串行化点。可能在已持锁路径上被调用的
//! 操作一律提供以 `&mut CoreMap`（或锁保护器）为参数的"锁内"变体，
//! 由公开包装函数负责取锁，不做运行期持锁探测。

use crate::address::{Kvaddr, Ppn};
use crate::config::PAGE_SIZE;
use crate::error::VmResult;
use crate::manager::VmManager;
use crate::registry::Pid;
use crate::swap::SwapBitmap;
use crate::Vpn;
use alloc::boxed::Box;
use alloc::sync::Arc;
use sync::{Completion, SpinLockGuard};

// ============================================================================
// 帧表数据模型
// ============================================================================

/// 物理帧的状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameStatus {
    /// 空闲，可被分配
    Free,
    /// 用户页帧，可成为换出牺牲帧
    Dirty,
    /// 固定帧（内核帧，或正在换出的牺牲帧），绝不被选为牺牲帧
    Fixed,
}

/// 指回属主 PTE 的逻辑反向指针。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PageOwner {
    /// 属主进程
    pub(crate) pid: Pid,
    /// 该帧承载的虚拟页号
    pub(crate) vpn: Vpn,
}

/// 一个物理帧的簿记信息。
#[derive(Debug)]
pub(crate) struct FrameSlot {
    /// 帧状态
    pub(crate) status: FrameStatus,
    /// 属主 PTE（仅用户帧有）
    pub(crate) owner: Option<PageOwner>,
    /// 内容搬运中的忙信号；等待者克隆后在锁外等待，醒来必须复查
    pub(crate) busy: Option<Arc<Completion>>,
    /// 可能驻留在某核 TLB 中（false 表示确定不在任何 TLB 中）
    pub(crate) in_tlb: bool,
    /// 最近一次安装进 TLB 的逻辑时间，0 表示从未触碰
    pub(crate) last_touch: u64,
    /// 内核连续段的页数，仅段首帧非零
    pub(crate) run_len: usize,
}

impl FrameSlot {
    fn free() -> Self {
        FrameSlot {
            status: FrameStatus::Free,
            owner: None,
            busy: None,
            in_tlb: false,
            last_touch: 0,
            run_len: 0,
        }
    }

    /// 重置为空闲状态。
    fn reset(&mut self) {
        debug_assert!(self.busy.is_none(), "resetting a busy frame");
        *self = FrameSlot::free();
    }
}

/// 帧表：全局的每帧簿记数组，加上交换槽位图。
///
/// 两者受同一把帧表锁保护（[`VmManager`] 中的 `coremap` 字段）。
#[derive(Debug)]
pub(crate) struct CoreMap {
    frames: Box<[FrameSlot]>,
    pub(crate) swap_bitmap: Option<SwapBitmap>,
}

impl CoreMap {
    /// 创建 `pages` 帧的全空帧表；`swap_slots` 给出交换区槽数（如配置了交换）。
    pub(crate) fn new(pages: usize, swap_slots: Option<usize>) -> Self {
        let frames: Box<[FrameSlot]> = (0..pages).map(|_| FrameSlot::free()).collect();
        CoreMap {
            frames,
            swap_bitmap: swap_slots.map(SwapBitmap::new),
        }
    }

    /// 帧数。
    pub(crate) fn len(&self) -> usize {
        self.frames.len()
    }

    /// 帧的簿记信息。
    pub(crate) fn frame(&self, ppn: Ppn) -> &FrameSlot {
        &self.frames[ppn.as_usize()]
    }

    /// 帧的簿记信息（可变）。
    pub(crate) fn frame_mut(&mut self, ppn: Ppn) -> &mut FrameSlot {
        &mut self.frames[ppn.as_usize()]
    }

    /// 找一个空闲帧。
    pub(crate) fn find_free(&self) -> Option<Ppn> {
        self.frames
            .iter()
            .position(|f| f.status == FrameStatus::Free)
            .map(Ppn)
    }

    /// 线性扫描，找 `npages` 个连续空闲帧，返回段首帧号。
    pub(crate) fn find_free_run(&self, npages: usize) -> Option<Ppn> {
        let mut run = 0usize;
        for (idx, frame) in self.frames.iter().enumerate() {
            if frame.status == FrameStatus::Free {
                run += 1;
                if run == npages {
                    return Some(Ppn(idx + 1 - npages));
                }
            } else {
                run = 0;
            }
        }
        None
    }

    /// 把从 `start` 开始的 `npages` 帧标记为内核段。
    pub(crate) fn mark_kernel_run(&mut self, start: Ppn, npages: usize) {
        for i in 0..npages {
            let frame = &mut self.frames[start.as_usize() + i];
            debug_assert_eq!(frame.status, FrameStatus::Free);
            frame.status = FrameStatus::Fixed;
            frame.run_len = if i == 0 { npages } else { 0 };
        }
    }

    /// 释放一个内核段，返回释放的帧数；`start` 不是段首时返回 0。
    pub(crate) fn free_run(&mut self, start: Ppn) -> usize {
        let npages = self.frames[start.as_usize()].run_len;
        for i in 0..npages {
            let frame = &mut self.frames[start.as_usize() + i];
            debug_assert_eq!(frame.status, FrameStatus::Fixed);
            frame.reset();
        }
        npages
    }

    /// 非空闲帧占用的字节数。
    pub(crate) fn used_bytes(&self) -> usize {
        self.frames
            .iter()
            .filter(|f| f.status != FrameStatus::Free)
            .count()
            * PAGE_SIZE
    }

    /// 选择换出牺牲帧：跳过 Fixed 和忙帧，从未触碰的帧立即胜出，
    /// 否则取最近触碰时间最早的（LRU 近似）。
    ///
    /// 所有帧都参与扫描（包括 0 号帧）；没有可选帧时返回 None。
    pub(crate) fn find_victim(&self) -> Option<Ppn> {
        let mut best: Option<(usize, u64)> = None;
        for (idx, frame) in self.frames.iter().enumerate() {
            if frame.status != FrameStatus::Dirty || frame.busy.is_some() {
                continue;
            }
            if frame.last_touch == 0 {
                return Some(Ppn(idx));
            }
            match best {
                Some((_, t)) if t <= frame.last_touch => {}
                _ => best = Some((idx, frame.last_touch)),
            }
        }
        best.map(|(idx, _)| Ppn(idx))
    }
}

// ============================================================================
// 帧分配器：VmManager 上的分配/释放入口
// ============================================================================

impl VmManager {
    /// 分配 `npages` 个页对齐的连续 Fixed 帧，返回段首的内核直映射地址。
    ///
    /// 多页段找不到连续空闲帧即失败；单页分配在配置了交换时
    /// 可以通过换出腾出一帧。
    pub fn alloc_kpages(&self, npages: usize) -> Option<Kvaddr> {
        if npages == 0 {
            return None;
        }
        let mut table = self.coremap.lock();
        if let Some(start) = table.find_free_run(npages) {
            table.mark_kernel_run(start, npages);
            return Some(start.start_addr().to_kvaddr());
        }
        if npages > 1 {
            // 从不为内核多页段换出
            log::debug!("alloc_kpages: no free run of {npages} pages");
            return None;
        }
        match self.swap_out(table, FrameStatus::Fixed, None) {
            Ok((mut table, ppn)) => {
                table.frame_mut(ppn).run_len = 1;
                Some(ppn.start_addr().to_kvaddr())
            }
            Err(e) => {
                log::debug!("alloc_kpages: eviction unavailable: {e:?}");
                None
            }
        }
    }

    /// 释放 [`VmManager::alloc_kpages`] 返回的内核段。
    pub fn free_kpages(&self, addr: Kvaddr) {
        let paddr = addr.to_paddr();
        if paddr.as_usize() % PAGE_SIZE != 0 {
            log::warn!("free_kpages: unaligned address {:#x}", addr.as_usize());
            return;
        }
        let ppn = Ppn(paddr.as_usize() / PAGE_SIZE);
        let mut table = self.coremap.lock();
        if ppn.as_usize() >= table.len() {
            log::warn!("free_kpages: address {:#x} out of range", addr.as_usize());
            return;
        }
        if table.free_run(ppn) == 0 {
            log::warn!(
                "free_kpages: {:#x} is not the start of a kernel run",
                addr.as_usize()
            );
        }
    }

    /// 诊断接口：当前被占用的物理内存字节数。
    pub fn coremap_used_bytes(&self) -> usize {
        self.coremap.lock().used_bytes()
    }

    /// 诊断接口：交换区中持有有效数据的槽数。
    pub fn swap_slots_used(&self) -> usize {
        let table = self.coremap.lock();
        table.swap_bitmap.as_ref().map_or(0, |bm| bm.used())
    }

    /// 分配一个清零的用户帧并绑定属主。
    ///
    /// 返回时帧处于 Dirty 状态并保持忙标记：调用方必须在把 PTE
    /// 绑定到该帧之后，取走 `busy` 并调用 `complete` 唤醒等待者。
    /// 无空闲帧时触发换出，期间帧表锁会被释放再重取，
    /// 调用方不得假设锁保护器前后指向同一视图。
    pub(crate) fn user_alloc_onepage<'a>(
        &'a self,
        table: SpinLockGuard<'a, CoreMap>,
        owner: PageOwner,
        current_core: Option<usize>,
    ) -> VmResult<(SpinLockGuard<'a, CoreMap>, Ppn)> {
        let (mut table, ppn) = match table.find_free() {
            Some(ppn) => (table, ppn),
            None => self.swap_out(table, FrameStatus::Dirty, current_core)?,
        };
        let frame = table.frame_mut(ppn);
        frame.status = FrameStatus::Dirty;
        frame.owner = Some(owner);
        frame.busy = Some(Arc::new(Completion::new()));
        frame.in_tlb = false;
        frame.last_touch = 0;
        frame.run_len = 0;
        // 首触清零；纯内存写，持锁完成
        self.phys.zero_frame(ppn);
        Ok((table, ppn))
    }

    /// 释放一个用户帧（锁内变体）。
    pub(crate) fn user_free_onepage(&self, table: &mut CoreMap, ppn: Ppn) {
        let frame = table.frame_mut(ppn);
        debug_assert_eq!(frame.status, FrameStatus::Dirty);
        debug_assert!(frame.busy.is_none(), "freeing a busy frame");
        frame.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_run_scan() {
        let mut cm = CoreMap::new(8, None);
        assert_eq!(cm.find_free_run(8), Some(Ppn(0)));
        cm.mark_kernel_run(Ppn(2), 2);
        assert_eq!(cm.find_free_run(2), Some(Ppn(0)));
        assert_eq!(cm.find_free_run(3), Some(Ppn(4)));
        assert_eq!(cm.find_free_run(5), None);
        assert_eq!(cm.used_bytes(), 2 * PAGE_SIZE);
    }

    #[test]
    fn test_free_run_release() {
        let mut cm = CoreMap::new(8, None);
        cm.mark_kernel_run(Ppn(1), 3);
        assert_eq!(cm.frame(Ppn(1)).run_len, 3);
        assert_eq!(cm.frame(Ppn(2)).run_len, 0);
        // 非段首
        assert_eq!(cm.free_run(Ppn(2)), 0);
        assert_eq!(cm.free_run(Ppn(1)), 3);
        assert_eq!(cm.used_bytes(), 0);
    }

    #[test]
    fn test_victim_prefers_untouched_then_oldest() {
        let mut cm = CoreMap::new(4, None);
        for i in 0..4 {
            let f = cm.frame_mut(Ppn(i));
            f.status = FrameStatus::Dirty;
            f.last_touch = (i as u64) + 10;
        }
        // 都触碰过：取最早的
        assert_eq!(cm.find_victim(), Some(Ppn(0)));
        cm.frame_mut(Ppn(0)).last_touch = 100;
        assert_eq!(cm.find_victim(), Some(Ppn(1)));
        // 未触碰的立即胜出
        cm.frame_mut(Ppn(3)).last_touch = 0;
        assert_eq!(cm.find_victim(), Some(Ppn(3)));
    }

    #[test]
    fn test_victim_skips_fixed_and_busy() {
        let mut cm = CoreMap::new(3, None);
        cm.frame_mut(Ppn(0)).status = FrameStatus::Fixed;
        let f1 = cm.frame_mut(Ppn(1));
        f1.status = FrameStatus::Dirty;
        f1.busy = Some(Arc::new(Completion::new()));
        assert_eq!(cm.find_victim(), None);

        let f2 = cm.frame_mut(Ppn(2));
        f2.status = FrameStatus::Dirty;
        f2.last_touch = 5;
        assert_eq!(cm.find_victim(), Some(Ppn(2)));
    }

    #[test]
    fn test_victim_considers_frame_zero() {
        // 0 号帧不是"未找到"哨兵，照常参与选择
        let mut cm = CoreMap::new(2, None);
        let f0 = cm.frame_mut(Ppn(0));
        f0.status = FrameStatus::Dirty;
        f0.last_touch = 1;
        assert_eq!(cm.find_victim(), Some(Ppn(0)));
    }
}
