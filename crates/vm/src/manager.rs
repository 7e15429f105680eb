//! VM 管理器
//!
//! [`VmManager`] 是整个子系统的显式上下文：拥有物理内存区、帧表与
//! 交换位图（同一把帧表锁）、交换设备、各核软件 TLB 与击落邮箱、
//! 进程注册表和触碰时钟。所有 VM 入口点都是它的方法，
//! 没有任何环境全局变量。

use crate::address::{Vaddr, Vpn};
use crate::addrspace::{AddressSpace, PageBacking};
use crate::config::{PAGE_SIZE, VmConfig};
use crate::coremap::CoreMap;
use crate::error::{VmError, VmResult};
use crate::fault::FaultKind;
use crate::phys::PhysMemory;
use crate::registry::{Process, ProcessRegistry};
use crate::swap::SwapStore;
use crate::tlb::{IpiSender, ShootdownRequest, Tlb};
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use device::BlockDriver;
use sync::{Completion, SpinLock};

/// 虚拟内存子系统的显式上下文。
pub struct VmManager {
    pub(crate) config: VmConfig,
    pub(crate) phys: PhysMemory,
    /// 帧表 + 交换位图：分配、换出与缺页活动的唯一串行化点
    pub(crate) coremap: SpinLock<CoreMap>,
    pub(crate) swap: Option<SwapStore>,
    pub(crate) tlbs: Box<[SpinLock<Tlb>]>,
    pub(crate) shootdown_queues: Box<[SpinLock<Vec<ShootdownRequest>>]>,
    pub(crate) ipi: Arc<dyn IpiSender>,
    pub(crate) registry: ProcessRegistry,
    /// 帧触碰用的逻辑时钟（0 保留为"从未触碰"）
    clock: AtomicU64,
    pub(crate) tlb_seed: AtomicU64,
}

impl VmManager {
    /// 启动 VM 子系统。
    ///
    /// `swap_device` 是启动时打开一次的交换设备（无交换配置传 None），
    /// `ipi` 是平台提供的核间中断投递通道。
    pub fn new(
        config: VmConfig,
        swap_device: Option<Arc<dyn BlockDriver>>,
        ipi: Arc<dyn IpiSender>,
    ) -> Self {
        let phys = PhysMemory::new(config.ram_pages);
        let swap = swap_device.map(SwapStore::new);
        let coremap = SpinLock::new(CoreMap::new(
            config.ram_pages,
            swap.as_ref().map(SwapStore::slots),
        ));
        let tlbs: Box<[SpinLock<Tlb>]> =
            (0..config.cores).map(|_| SpinLock::new(Tlb::new())).collect();
        let shootdown_queues: Box<[SpinLock<Vec<ShootdownRequest>>]> =
            (0..config.cores).map(|_| SpinLock::new(Vec::new())).collect();

        log::info!(
            "vm: {} pages of managed ram, {} swap slots, {} cores",
            config.ram_pages,
            swap.as_ref().map_or(0, SwapStore::slots),
            config.cores
        );

        VmManager {
            config,
            phys,
            coremap,
            swap,
            tlbs,
            shootdown_queues,
            ipi,
            registry: ProcessRegistry::new(),
            clock: AtomicU64::new(0),
            tlb_seed: AtomicU64::new(0x5DEE_CE66),
        }
    }

    /// 进程注册表。
    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    /// 受管物理内存页数。
    pub fn ram_pages(&self) -> usize {
        self.phys.pages()
    }

    /// 创建空地址空间（as_create），栈大小取自启动配置。
    pub fn as_create(&self) -> Arc<AddressSpace> {
        AddressSpace::new(self.config.stack_pages)
    }

    /// 销毁地址空间（as_destroy）：释放它占有的全部帧与交换槽。
    ///
    /// 必须在把进程从注册表注销之前调用 —— 换页引擎改写他人 PTE 时
    /// 要求属主仍然在册。
    pub fn as_destroy(&self, space: &Arc<AddressSpace>) {
        // 地址空间的属主不再缺页，键集从此只减不增
        let vpns: Vec<Vpn> = space.inner.lock().pages.keys().copied().collect();
        for vpn in vpns {
            self.release_page(space, vpn, None);
        }
        let mut inner = space.inner.lock();
        debug_assert!(inner.pages.is_empty());
        inner.regions.clear();
        inner.heap_bound = inner.heap_base;
    }

    /// 调整堆边界（sbrk），返回旧的堆顶地址。
    ///
    /// 生长只移动边界，页在首次缺页时才物化；收缩会销毁腾出范围内的
    /// PTE，归还驻留帧和交换槽。收缩到堆基址以下是参数错误。
    pub fn sbrk(&self, proc: &Arc<Process>, delta_pages: isize) -> VmResult<Vaddr> {
        let space = proc.space();
        let (old_bound, new_bound) = {
            let mut inner = space.inner.lock();
            let old = inner.heap_bound;
            if delta_pages >= 0 {
                let new = Vpn(old.as_usize() + delta_pages as usize);
                if new > inner.stack_base() {
                    return Err(VmError::OutOfMemory);
                }
                inner.heap_bound = new;
                return Ok(old.start_addr());
            }
            let shrink = delta_pages.unsigned_abs();
            if inner.heap_bound.as_usize() - inner.heap_base.as_usize() < shrink {
                return Err(VmError::InvalidArgument);
            }
            let new = Vpn(old.as_usize() - shrink);
            inner.heap_bound = new;
            (old, new)
        };

        // 腾出范围内的页逐个释放（帧表锁在 release_page 内按页取放）
        for vpn in crate::address::VpnRange::new(new_bound, old_bound) {
            self.release_page(space, vpn, Some(proc.core()));
        }
        Ok(old_bound.start_addr())
    }

    /// 释放一个虚拟页的后备（帧或交换槽）并摘除其 PTE。
    ///
    /// 页无后备时是空操作。帧正忙（比如正被换出）时等它结束后复查：
    /// 醒来时驻留页可能已变成换出页。`tlb_core` 给出需要就地失效的核
    /// （进程已死、其核必将整表清空时传 None）。
    pub(crate) fn release_page(
        &self,
        space: &Arc<AddressSpace>,
        vpn: Vpn,
        tlb_core: Option<usize>,
    ) {
        enum Action {
            Gone,
            Wait(Arc<Completion>),
            FreeFrame(crate::address::Ppn),
            FreeSlot(usize),
        }

        loop {
            let mut table = self.coremap.lock();
            let action = {
                let inner = space.inner.lock();
                match inner.pages.get(&vpn) {
                    None => Action::Gone,
                    Some(pte) => match pte.backing {
                        PageBacking::Resident(ppn) => match &table.frame(ppn).busy {
                            Some(busy) => Action::Wait(busy.clone()),
                            None => Action::FreeFrame(ppn),
                        },
                        PageBacking::Swapped(slot) => Action::FreeSlot(slot),
                    },
                }
            };
            match action {
                Action::Gone => return,
                Action::Wait(busy) => {
                    drop(table);
                    busy.wait();
                }
                Action::FreeFrame(ppn) => {
                    if table.frame(ppn).in_tlb {
                        if let Some(core) = tlb_core {
                            self.invalidate_frame(Some(core), core, ppn);
                        }
                        table.frame_mut(ppn).in_tlb = false;
                    }
                    space.inner.lock().pages.remove(&vpn);
                    self.user_free_onepage(&mut table, ppn);
                    return;
                }
                Action::FreeSlot(slot) => {
                    space.inner.lock().pages.remove(&vpn);
                    table
                        .swap_bitmap
                        .as_mut()
                        .expect("swapped PTE without bitmap")
                        .free(slot);
                    return;
                }
            }
        }
    }

    /// 内核向用户地址写入字节序列（跨页安全，按需缺页物化）。
    ///
    /// 加载器和系统调用层通过它向用户空间拷出数据。
    pub fn write_bytes_at(&self, proc: &Arc<Process>, va: Vaddr, bytes: &[u8]) -> VmResult<()> {
        self.copy_bytes(proc, va, bytes.len(), |frame, off, done, take| {
            frame[off..off + take].copy_from_slice(&bytes[done..done + take]);
        }, true)
    }

    /// 从用户地址读取字节序列（跨页安全，按需缺页物化）。
    pub fn read_bytes_at(&self, proc: &Arc<Process>, va: Vaddr, out: &mut [u8]) -> VmResult<()> {
        let total = out.len();
        self.copy_bytes(proc, va, total, |frame, off, done, take| {
            out[done..done + take].copy_from_slice(&frame[off..off + take]);
        }, false)
    }

    /// 逐页解析-拷贝循环，`write_bytes_at`/`read_bytes_at` 的公共骨架。
    fn copy_bytes(
        &self,
        proc: &Arc<Process>,
        va: Vaddr,
        total: usize,
        mut copy: impl FnMut(&mut [u8], usize, usize, usize),
        is_write: bool,
    ) -> VmResult<()> {
        enum Step {
            Wait(Arc<Completion>),
            Fault,
            Copy(crate::address::Ppn),
        }

        let space = proc.space().clone();
        let mut done = 0usize;
        while done < total {
            let cur = Vaddr(va.as_usize().checked_add(done).ok_or(VmError::BadAddress)?);
            let vpn = cur.page_floor();
            let off = cur.page_offset();
            let take = core::cmp::min(total - done, PAGE_SIZE - off);
            loop {
                let table = self.coremap.lock();
                let step = {
                    let mut inner = space.inner.lock();
                    match inner.pages.get_mut(&vpn) {
                        Some(pte) => match pte.backing {
                            PageBacking::Resident(ppn) => match &table.frame(ppn).busy {
                                Some(busy) => Step::Wait(busy.clone()),
                                None => {
                                    if is_write {
                                        pte.dirty = true;
                                    }
                                    Step::Copy(ppn)
                                }
                            },
                            PageBacking::Swapped(_) => Step::Fault,
                        },
                        None => Step::Fault,
                    }
                };
                match step {
                    Step::Wait(busy) => {
                        drop(table);
                        busy.wait();
                    }
                    Step::Fault => {
                        drop(table);
                        let kind = if is_write { FaultKind::Write } else { FaultKind::Read };
                        self.vm_fault(proc.pid(), kind, cur)?;
                    }
                    Step::Copy(ppn) => {
                        // SAFETY: 持帧表锁期间换页引擎无法触碰该帧。
                        let frame = unsafe { self.phys.frame_bytes_mut(ppn) };
                        copy(frame, off, done, take);
                        break;
                    }
                }
            }
            done += take;
        }
        Ok(())
    }

    /// 帧触碰时钟：单调递增，永不返回 0。
    pub(crate) fn touch_clock(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }
}
