//! 缺页处理
//!
//! [`VmManager::vm_fault`] 由陷入层在每次 TLB miss / 保护异常时调用，
//! 把缺页地址解析到一个物理帧（驻留 / 换入 / 首触清零），
//! 最后在缺页进程所在核上安装 TLB 表项。
//!
//! 整个解析过程以帧表锁为串行化点；遇到忙帧就克隆其完成信号、
//! 放锁等待，醒来后从头复查 —— 等待期间页的状态可能已经改变
//! （比如被换出）。

use crate::address::{Ppn, Vaddr, Vpn};
use crate::addrspace::{PageBacking, PageTableEntry};
use crate::coremap::{CoreMap, PageOwner};
use crate::error::{VmError, VmResult};
use crate::manager::VmManager;
use crate::registry::Pid;
use alloc::sync::Arc;
use sync::{Completion, SpinLockGuard};

/// 陷入层报告的缺页种类。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// 读访问缺页
    Read,
    /// 写访问缺页
    Write,
    /// 对只读映射的写（本设计中页总是以读写安装，出现即为内核 bug）
    Readonly,
}

/// 一次解析的下一步动作。
enum Resolution {
    /// 页驻留且帧空闲，直接使用
    Use(Ppn),
    /// 帧正忙，等它的完成信号后复查
    Wait(Arc<Completion>),
    /// 页在交换区给定槽位
    SwapIn(usize),
    /// 页尚无后备，首触清零
    Fresh,
}

impl VmManager {
    /// 缺页处理入口（vm_fault）。
    ///
    /// # Panics
    /// [`FaultKind::Readonly`] 表示对本应读写的映射报了只读保护异常，
    /// 属于内核内部不变量被破坏，直接 panic。
    pub fn vm_fault(&self, pid: Pid, kind: FaultKind, vaddr: Vaddr) -> VmResult<()> {
        if kind == FaultKind::Readonly {
            panic!(
                "vm_fault: readonly fault on an always-writable mapping at {:#x}",
                vaddr.as_usize()
            );
        }
        // 查不到进程：多半是启动早期的内核缺页，按非法地址上报
        let Some(proc) = self.registry.get(pid) else {
            return Err(VmError::BadAddress);
        };
        let space = proc.space().clone();
        let vpn = vaddr.page_floor();
        log::trace!("vm_fault: pid {} {:?} at {:#x}", pid.0, kind, vaddr.as_usize());

        loop {
            let table = self.coremap.lock();
            let resolution = {
                let mut inner = space.inner.lock();
                inner.check_fault(vpn)?;
                match inner.pages.get_mut(&vpn) {
                    Some(pte) => match pte.backing {
                        PageBacking::Resident(ppn) => {
                            if let Some(busy) = &table.frame(ppn).busy {
                                Resolution::Wait(busy.clone())
                            } else {
                                if kind == FaultKind::Write {
                                    pte.dirty = true;
                                }
                                Resolution::Use(ppn)
                            }
                        }
                        PageBacking::Swapped(slot) => Resolution::SwapIn(slot),
                    },
                    None => Resolution::Fresh,
                }
            };

            match resolution {
                Resolution::Wait(busy) => {
                    drop(table);
                    busy.wait();
                    // 从头复查：醒来时页可能已被换出
                }
                Resolution::Use(ppn) => {
                    self.finish_fault(table, proc.core(), vpn, ppn);
                    return Ok(());
                }
                Resolution::SwapIn(slot) => {
                    let (table, ppn) =
                        self.user_alloc_onepage(table, PageOwner { pid, vpn }, Some(proc.core()))?;
                    // 放锁读盘；新帧保持忙
                    drop(table);
                    let store = self.swap.as_ref().expect("swapped PTE without a swap store");
                    // SAFETY: 新帧已标记忙，本线程独占其内容。
                    store.read_page(slot, unsafe { self.phys.frame_bytes_mut(ppn) });
                    let mut table = self.coremap.lock();

                    // 归还交换槽并把 PTE 改绑回物理帧
                    table
                        .swap_bitmap
                        .as_mut()
                        .expect("swap store without bitmap")
                        .free(slot);
                    {
                        let mut inner = space.inner.lock();
                        let pte = inner
                            .pages
                            .get_mut(&vpn)
                            .expect("PTE vanished during swap-in");
                        debug_assert!(matches!(pte.backing, PageBacking::Swapped(s) if s == slot));
                        pte.backing = PageBacking::Resident(ppn);
                        pte.dirty = kind == FaultKind::Write;
                    }
                    let busy = table
                        .frame_mut(ppn)
                        .busy
                        .take()
                        .expect("swap-in frame lost its busy marker");
                    busy.complete();
                    log::debug!(
                        "vm_fault: pid {} vpn {:#x} swapped in from slot {}",
                        pid.0,
                        vpn.as_usize(),
                        slot
                    );
                    self.finish_fault(table, proc.core(), vpn, ppn);
                    return Ok(());
                }
                Resolution::Fresh => {
                    let (mut table, ppn) =
                        self.user_alloc_onepage(table, PageOwner { pid, vpn }, Some(proc.core()))?;
                    {
                        let mut inner = space.inner.lock();
                        let prev = inner.pages.insert(
                            vpn,
                            PageTableEntry {
                                backing: PageBacking::Resident(ppn),
                                dirty: true,
                            },
                        );
                        debug_assert!(prev.is_none(), "lazy PTE already present");
                    }
                    let busy = table
                        .frame_mut(ppn)
                        .busy
                        .take()
                        .expect("fresh frame lost its busy marker");
                    busy.complete();
                    self.finish_fault(table, proc.core(), vpn, ppn);
                    return Ok(());
                }
            }
        }
    }

    /// 记录触碰时间并安装 TLB 表项。
    ///
    /// 必须持着帧表锁完成：放锁后换页引擎可能立刻换出该帧，
    /// 先放锁再安装会留下指向已换出帧的翻译。
    fn finish_fault(&self, mut table: SpinLockGuard<'_, CoreMap>, core: usize, vpn: Vpn, ppn: Ppn) {
        let now = self.touch_clock();
        let frame = table.frame_mut(ppn);
        frame.last_touch = now;
        frame.in_tlb = true;
        self.tlb_install(core, vpn, ppn);
    }
}
