//! 进程地址空间
//!
//! 地址空间拥有 region 描述符列表、按虚拟页号排序的页表
//! （`BTreeMap<Vpn, PageTableEntry>`）和堆边界，整体由一把结构锁保护。
//!
//! 页表项在首次缺页时惰性创建，随地址空间销毁或堆收缩销毁；
//! 每个页表项独占属于它的地址空间，帧表条目只以
//! （进程号，虚拟页号）的形式引用它。
//!
//! ## 用户地址布局
//!
//! ```text
//! 0 ──────── region……region ── heap_base ──── heap_bound ╌╌空洞╌╌ stack_base ──── USER_STACK_TOP
//!             （加载器声明）      （堆，sbrk 生长）                     （固定页数的用户栈）
//! ```
//!
//! 合法缺页地址：region 内、堆内、栈内，或已有页表项的页；
//! 堆顶与栈底之间的空洞以及栈顶以上的地址一律非法。

use crate::address::{Vaddr, Vpn, VpnRange};
use crate::config::{PAGE_SIZE, USER_STACK_TOP};
use crate::error::{VmError, VmResult};
use alloc::collections::btree_map::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use sync::SpinLock;
use uapi::mm::RegionPerms;

/// 一个虚拟页的后备存储。
///
/// 三态不变量：驻留、在交换区、或（页表中无此项的）无后备，三者互斥。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageBacking {
    /// 驻留在物理帧中
    Resident(crate::address::Ppn),
    /// 已换出到交换区给定槽位
    Swapped(usize),
}

/// 页表项：一个虚拟页到物理帧或交换槽的绑定。
#[derive(Debug)]
pub struct PageTableEntry {
    /// 后备存储
    pub(crate) backing: PageBacking,
    /// 自上次换入以来是否被写过
    pub(crate) dirty: bool,
}

/// 段描述符：一段合法的用户虚拟地址范围及其权限。
///
/// 创建后不可变（克隆除外）。权限位被完整记录，但缺页时不强制执行：
/// 页总是以读写安装。
#[derive(Debug, Clone)]
pub struct Region {
    base: Vpn,
    pages: usize,
    perms: RegionPerms,
}

impl Region {
    /// 段基址页号。
    pub fn base(&self) -> Vpn {
        self.base
    }

    /// 段页数。
    pub fn pages(&self) -> usize {
        self.pages
    }

    /// 段权限。
    pub fn perms(&self) -> RegionPerms {
        self.perms
    }

    /// 段覆盖的页号范围。
    pub fn range(&self) -> VpnRange {
        VpnRange::from_start_len(self.base, self.pages)
    }
}

/// 地址空间的受锁内部状态。
#[derive(Debug)]
pub(crate) struct AsInner {
    /// 段描述符列表
    pub(crate) regions: Vec<Region>,
    /// 按虚拟页号排序的页表
    pub(crate) pages: BTreeMap<Vpn, PageTableEntry>,
    /// 堆基址（各段之上）
    pub(crate) heap_base: Vpn,
    /// 堆当前边界（不含）
    pub(crate) heap_bound: Vpn,
    /// 用户栈页数
    pub(crate) stack_pages: usize,
}

impl AsInner {
    /// 栈底页号。
    pub(crate) fn stack_base(&self) -> Vpn {
        Vpn(USER_STACK_TOP / PAGE_SIZE - self.stack_pages)
    }

    /// 查找覆盖给定页的段。
    pub(crate) fn region_at(&self, vpn: Vpn) -> Option<&Region> {
        self.regions.iter().find(|r| r.range().contains(vpn))
    }

    /// 缺页地址合法性检查（见模块文档的布局图）。
    pub(crate) fn check_fault(&self, vpn: Vpn) -> VmResult<()> {
        let stack_top = Vpn(USER_STACK_TOP / PAGE_SIZE);
        if vpn >= stack_top {
            return Err(VmError::BadAddress);
        }
        if vpn >= self.stack_base() {
            return Ok(());
        }
        if vpn >= self.heap_bound {
            // 堆顶与栈底之间的空洞
            return Err(VmError::BadAddress);
        }
        if vpn >= self.heap_base {
            return Ok(());
        }
        if self.region_at(vpn).is_some() || self.pages.contains_key(&vpn) {
            return Ok(());
        }
        Err(VmError::BadAddress)
    }
}

/// 进程地址空间。
///
/// 由进程独占；只有代表该进程执行的缺页处理、或代表帧分配器行事的
/// 换页引擎会改写其页表，后者在改写期间始终持有帧表锁。
#[derive(Debug)]
pub struct AddressSpace {
    pub(crate) inner: SpinLock<AsInner>,
}

impl AddressSpace {
    /// 创建空地址空间（as_create）。
    pub fn new(stack_pages: usize) -> Arc<Self> {
        Arc::new(AddressSpace {
            inner: SpinLock::new(AsInner {
                regions: Vec::new(),
                pages: BTreeMap::new(),
                heap_base: Vpn(0),
                heap_bound: Vpn(0),
                stack_pages,
            }),
        })
    }

    /// 声明一个段（as_define_region）。
    ///
    /// 基址向下、长度向上对齐到页边界；段之间不允许重叠，
    /// 段必须整体落在用户栈之下。堆基址被抬到所有段之上。
    pub fn define_region(&self, vaddr: Vaddr, size: usize, perms: RegionPerms) -> VmResult<()> {
        // 先对齐基址，再对齐长度
        let size = size + vaddr.page_offset();
        let base = vaddr.page_floor();
        let pages = size.div_ceil(PAGE_SIZE);
        if pages == 0 {
            return Ok(());
        }

        let mut inner = self.inner.lock();
        let range = VpnRange::from_start_len(base, pages);
        if range.end() > inner.stack_base() {
            return Err(VmError::BadAddress);
        }
        if inner.regions.iter().any(|r| r.range().overlaps(&range)) {
            return Err(VmError::BadAddress);
        }

        inner.regions.push(Region { base, pages, perms });

        // 堆紧跟在最高的段之后
        if inner.heap_base < range.end() {
            inner.heap_base = range.end();
        }
        if inner.heap_bound < inner.heap_base {
            inner.heap_bound = inner.heap_base;
        }
        Ok(())
    }

    /// 用户栈初始化（as_define_stack）：返回初始栈指针。
    pub fn define_stack(&self) -> Vaddr {
        Vaddr(USER_STACK_TOP)
    }

    /// 当前堆边界 `[heap_base, heap_bound)`。
    pub fn heap_bounds(&self) -> (Vaddr, Vaddr) {
        let inner = self.inner.lock();
        (inner.heap_base.start_addr(), inner.heap_bound.start_addr())
    }

    /// 查询某虚拟页的后备状态（诊断/测试用）。
    pub fn page_backing(&self, vpn: Vpn) -> Option<PageBacking> {
        self.inner.lock().pages.get(&vpn).map(|pte| pte.backing)
    }

    /// 页表项数量（诊断/测试用）。
    pub fn page_count(&self) -> usize {
        self.inner.lock().pages.len()
    }

    /// 复制段布局与堆边界，页表为空（fork 深拷贝的第一步）。
    pub(crate) fn clone_layout(&self) -> Arc<AddressSpace> {
        let src = self.inner.lock();
        Arc::new(AddressSpace {
            inner: SpinLock::new(AsInner {
                regions: src.regions.clone(),
                pages: BTreeMap::new(),
                heap_base: src.heap_base,
                heap_bound: src.heap_bound,
                stack_pages: src.stack_pages,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space() -> Arc<AddressSpace> {
        let s = AddressSpace::new(16);
        // 代码段 2 页 + 数据段 3 页
        s.define_region(Vaddr(0x0040_0000), 2 * PAGE_SIZE, RegionPerms::rx())
            .unwrap();
        s.define_region(Vaddr(0x0041_0000), 3 * PAGE_SIZE, RegionPerms::rw())
            .unwrap();
        s
    }

    #[test]
    fn test_define_region_aligns_and_sets_heap() {
        let s = AddressSpace::new(16);
        // 基址带页内偏移：基址向下取整、长度补足
        s.define_region(Vaddr(0x0040_0010), 100, RegionPerms::rw())
            .unwrap();
        let inner = s.inner.lock();
        assert_eq!(inner.regions.len(), 1);
        assert_eq!(inner.regions[0].base(), Vaddr(0x0040_0000).page_floor());
        assert_eq!(inner.regions[0].pages(), 1);
        assert_eq!(inner.heap_base, Vpn(0x0040_1000 / PAGE_SIZE));
        assert_eq!(inner.heap_bound, inner.heap_base);
    }

    #[test]
    fn test_define_region_rejects_overlap() {
        let s = space();
        assert_eq!(
            s.define_region(Vaddr(0x0040_1000), PAGE_SIZE, RegionPerms::rw()),
            Err(VmError::BadAddress)
        );
    }

    #[test]
    fn test_define_region_rejects_stack_collision() {
        let s = AddressSpace::new(16);
        let stack_base = USER_STACK_TOP - 16 * PAGE_SIZE;
        assert_eq!(
            s.define_region(Vaddr(stack_base - PAGE_SIZE), 2 * PAGE_SIZE, RegionPerms::rw()),
            Err(VmError::BadAddress)
        );
    }

    #[test]
    fn test_fault_classification() {
        let s = space();
        let inner = s.inner.lock();

        // 段内合法
        assert!(inner.check_fault(Vaddr(0x0040_0000).page_floor()).is_ok());
        assert!(inner.check_fault(Vaddr(0x0041_2fff).page_floor()).is_ok());
        // 段外、堆外
        assert_eq!(
            inner.check_fault(Vaddr(0x0000_1000).page_floor()),
            Err(VmError::BadAddress)
        );
        // 栈内合法，栈顶之上非法
        assert!(inner.check_fault(Vpn(USER_STACK_TOP / PAGE_SIZE - 1)).is_ok());
        assert_eq!(
            inner.check_fault(Vpn(USER_STACK_TOP / PAGE_SIZE)),
            Err(VmError::BadAddress)
        );
        // 堆顶与栈底之间的空洞非法
        assert_eq!(
            inner.check_fault(Vpn(USER_STACK_TOP / PAGE_SIZE - 17)),
            Err(VmError::BadAddress)
        );
    }

    #[test]
    fn test_fault_classification_heap_growth() {
        let s = space();
        {
            let mut inner = s.inner.lock();
            let base = inner.heap_base;
            inner.heap_bound = base.add(2);
        }
        let inner = s.inner.lock();
        let base = inner.heap_base;
        assert!(inner.check_fault(base).is_ok());
        assert!(inner.check_fault(base.add(1)).is_ok());
        assert_eq!(inner.check_fault(base.add(2)), Err(VmError::BadAddress));
    }
}
