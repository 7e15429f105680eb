//! 虚拟内存子系统
//!
//! 提供按需调页（demand paging）的全部核心机制：
//!
//! - 物理帧表（coremap）与帧分配器
//! - 换页引擎（牺牲帧选择、换出到交换设备、跨核 TLB 击落）
//! - 缺页处理（驻留 / 换入 / 首触清零）
//! - 进程地址空间（region 描述符 + 按虚拟页号排序的页表）与 fork 深拷贝
//!
//! # 显式上下文
//!
//! 所有状态（物理内存、帧表、交换位图、各核软件 TLB、进程注册表）都由
//! [`VmManager`] 拥有，VM 入口点都是它的方法；没有任何环境全局变量。
//!
//! # 锁序
//!
//! 帧表锁 → 地址空间结构锁 → 各核 TLB 锁。
//! 任何路径都不得在持有地址空间锁时再取帧表锁。
//! 磁盘 I/O 期间释放帧表锁，受影响的帧以 completion 标记为忙；
//! 等待者醒来后必须重新取锁并复查状态。

#![no_std]

extern crate alloc;

mod coremap;
mod evict;
mod fork;
mod phys;

pub mod address;
pub mod addrspace;
pub mod config;
pub mod error;
pub mod fault;
pub mod manager;
pub mod registry;
pub mod swap;
pub mod tlb;

// Re-export 常用类型
pub use address::{Kvaddr, Paddr, Ppn, Vaddr, Vpn, VpnRange};
pub use addrspace::{AddressSpace, PageBacking, Region};
pub use config::{PAGE_SIZE, TLB_SLOTS, USER_SPACE_TOP, USER_STACK_TOP, VmConfig};
pub use error::{VmError, VmResult};
pub use fault::FaultKind;
pub use manager::VmManager;
pub use registry::{Pid, Process, ProcessRegistry};
pub use swap::SwapStore;
pub use tlb::IpiSender;
pub use uapi::mm::RegionPerms;
