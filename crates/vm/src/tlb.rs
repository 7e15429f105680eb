//! 每核软件 TLB 与跨核击落协议
//!
//! TLB 以每核 [`TLB_SLOTS`] 槽的定长数组建模（MIPS 风格的小型硬件
//! TLB，无精确替换信息）。安装时优先复用匹配或无效槽，否则伪随机
//! 替换一个槽。
//!
//! ## 击落协议
//!
//! 跨核失效采用显式的请求/确认消息：换页引擎把
//! [`ShootdownRequest`] 投入目标核的邮箱，通过注入的 [`IpiSender`]
//! 敲响门铃，然后在请求的确认信号上等待。目标核的陷入层在收到
//! IPI 后调用 [`VmManager::tlb_shootdown`] 清空邮箱并逐一确认。
//! 等待有自旋预算（[`VmConfig`](crate::VmConfig)），预算耗尽视为
//! 远端核失联，panic 而不是无限期停摆。

use crate::address::{Ppn, Vaddr, Vpn};
use crate::config::TLB_SLOTS;
use crate::manager::VmManager;
use alloc::sync::Arc;
use core::sync::atomic::Ordering;
use sync::Completion;

/// 一条 TLB 表项。
#[derive(Debug, Clone, Copy)]
struct TlbEntry {
    vpn: Vpn,
    ppn: Ppn,
    valid: bool,
}

impl TlbEntry {
    const INVALID: TlbEntry = TlbEntry {
        vpn: Vpn(0),
        ppn: Ppn(0),
        valid: false,
    };
}

/// 一个核的软件 TLB。
#[derive(Debug)]
pub(crate) struct Tlb {
    entries: [TlbEntry; TLB_SLOTS],
}

impl Tlb {
    pub(crate) fn new() -> Self {
        Tlb {
            entries: [TlbEntry::INVALID; TLB_SLOTS],
        }
    }

    /// 查询虚拟页的翻译。
    pub(crate) fn probe(&self, vpn: Vpn) -> Option<Ppn> {
        self.entries
            .iter()
            .find(|e| e.valid && e.vpn == vpn)
            .map(|e| e.ppn)
    }

    /// 选择安装槽：匹配页号的槽 > 无效槽 > 伪随机槽。
    pub(crate) fn pick_slot(&self, vpn: Vpn, rand: u64) -> usize {
        if let Some(idx) = self.entries.iter().position(|e| e.valid && e.vpn == vpn) {
            return idx;
        }
        if let Some(idx) = self.entries.iter().position(|e| !e.valid) {
            return idx;
        }
        (rand % TLB_SLOTS as u64) as usize
    }

    /// 写入一个槽。
    pub(crate) fn write(&mut self, slot: usize, vpn: Vpn, ppn: Ppn) {
        self.entries[slot] = TlbEntry {
            vpn,
            ppn,
            valid: true,
        };
    }

    /// 使指向给定物理帧的所有表项失效，返回是否命中。
    pub(crate) fn invalidate_ppn(&mut self, ppn: Ppn) -> bool {
        let mut hit = false;
        for e in self.entries.iter_mut() {
            if e.valid && e.ppn == ppn {
                *e = TlbEntry::INVALID;
                hit = true;
            }
        }
        hit
    }

    /// 整表清空。
    pub(crate) fn flush(&mut self) {
        self.entries = [TlbEntry::INVALID; TLB_SLOTS];
    }
}

/// 发给某个核的失效请求。
#[derive(Debug)]
pub struct ShootdownRequest {
    pub(crate) ppn: Ppn,
    pub(crate) ack: Arc<Completion>,
}

/// 核间中断的投递接口。
///
/// VM 子系统只负责把请求放进目标核的邮箱；真正打断目标核、
/// 让其陷入层调用 [`VmManager::tlb_shootdown`] 是平台代码的职责。
pub trait IpiSender: Send + Sync {
    /// 向目标核投递一次击落门铃。
    fn send(&self, target_core: usize);
}

// 单元测试用：test-support 的 Mock 不依赖本 crate（避免循环依赖），
// 在 cfg(test) 下为它实现 IpiSender。
#[cfg(test)]
impl IpiSender for test_support::mock::ipi::MockIpiSink {
    fn send(&self, target_core: usize) {
        self.record(target_core);
    }
}

impl VmManager {
    /// 上下文切换时激活地址空间（as_activate）：清空该核的 TLB。
    ///
    /// 帧上的 TLB 驻留标志保持保守（可能高估），多余的击落无害。
    pub fn as_activate(&self, core: usize) {
        self.tlbs[core].lock().flush();
    }

    /// 诊断接口：查询某核 TLB 中一个虚拟地址的翻译。
    pub fn tlb_probe(&self, core: usize, vaddr: Vaddr) -> Option<Ppn> {
        self.tlbs[core].lock().probe(vaddr.page_floor())
    }

    /// 击落 IPI 的处理入口：清空本核邮箱，逐一失效并确认。
    ///
    /// 由目标核的陷入层调用；不取帧表锁，可以在换页引擎持锁
    /// 等待确认时安全执行。
    pub fn tlb_shootdown(&self, core: usize) {
        loop {
            let req = self.shootdown_queues[core].lock().pop();
            let Some(req) = req else { break };
            self.tlbs[core].lock().invalidate_ppn(req.ppn);
            req.ack.complete();
        }
    }

    /// 使一个帧的翻译失效。
    ///
    /// 属主核与当前核一致时就地失效；否则走请求/确认协议，
    /// 等待受自旋预算约束。持有帧表锁调用是安全的（见
    /// [`VmManager::tlb_shootdown`]）。
    pub(crate) fn invalidate_frame(
        &self,
        current_core: Option<usize>,
        owner_core: usize,
        ppn: Ppn,
    ) {
        if current_core == Some(owner_core) {
            self.tlbs[owner_core].lock().invalidate_ppn(ppn);
            return;
        }
        let ack = Arc::new(Completion::new());
        self.shootdown_queues[owner_core].lock().push(ShootdownRequest {
            ppn,
            ack: ack.clone(),
        });
        self.ipi.send(owner_core);
        if !ack.wait_spins(self.config.shootdown_spin_budget) {
            panic!("tlb shootdown: core {owner_core} did not acknowledge");
        }
    }

    /// 在指定核上安装一条翻译（缺页处理的最后一步）。
    pub(crate) fn tlb_install(&self, core: usize, vpn: Vpn, ppn: Ppn) {
        let mut tlb = self.tlbs[core].lock();
        let slot = tlb.pick_slot(vpn, self.next_rand());
        tlb.write(slot, vpn, ppn);
    }

    /// TLB 槽替换用的伪随机数（splitmix64）。
    fn next_rand(&self) -> u64 {
        let mut z = self
            .tlb_seed
            .fetch_add(0x9E37_79B9_7F4A_7C15, Ordering::Relaxed)
            .wrapping_add(0x9E37_79B9_7F4A_7C15);
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }
}
