//! 物理内存区
//!
//! [`PhysMemory`] 是 VM 管理器拥有的、页对齐的受管物理内存区（arena）。
//! 帧号到字节窗口的转换在这里完成；对帧内容的独占访问由帧表的
//! 属主关系和忙协议保证，而不是借用检查器。

use crate::address::Ppn;
use crate::config::PAGE_SIZE;
use alloc::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};
use core::ptr::NonNull;

/// 受管物理内存区。
pub(crate) struct PhysMemory {
    base: NonNull<u8>,
    pages: usize,
}

// SAFETY: 这块内存区本身只是一段字节；并发访问纪律（帧属主 + 忙协议）
// 由 coremap 层保证。
unsafe impl Send for PhysMemory {}
unsafe impl Sync for PhysMemory {}

impl PhysMemory {
    /// 分配并清零 `pages` 页的内存区。启动期调用，失败即终止。
    pub(crate) fn new(pages: usize) -> Self {
        let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE)
            .expect("PhysMemory: bad layout");
        // SAFETY: layout 非零大小。
        let ptr = unsafe { alloc_zeroed(layout) };
        let base = match NonNull::new(ptr) {
            Some(p) => p,
            None => handle_alloc_error(layout),
        };
        PhysMemory { base, pages }
    }

    /// 受管页数。
    pub(crate) fn pages(&self) -> usize {
        self.pages
    }

    /// 帧起始字节的裸指针。
    ///
    /// 调用方必须依照帧表纪律（持有帧表锁，或持有该帧的忙标记）
    /// 才能通过该指针读写帧内容。
    pub(crate) fn frame_ptr(&self, ppn: Ppn) -> *mut u8 {
        debug_assert!(ppn.as_usize() < self.pages, "frame_ptr: ppn out of range");
        // SAFETY: ppn 在内存区范围内。
        unsafe { self.base.as_ptr().add(ppn.as_usize() * PAGE_SIZE) }
    }

    /// 将指定帧清零。
    pub(crate) fn zero_frame(&self, ppn: Ppn) {
        // SAFETY: 调用方独占该帧（见 frame_ptr 的纪律）。
        unsafe {
            core::ptr::write_bytes(self.frame_ptr(ppn), 0, PAGE_SIZE);
        }
    }

    /// 将 `src` 帧的内容逐字节拷贝到 `dst` 帧。
    pub(crate) fn copy_frame(&self, src: Ppn, dst: Ppn) {
        debug_assert!(src != dst, "copy_frame: src == dst");
        // SAFETY: 两帧不同且调用方独占二者。
        unsafe {
            core::ptr::copy_nonoverlapping(self.frame_ptr(src), self.frame_ptr(dst), PAGE_SIZE);
        }
    }

    /// 以只读切片访问帧内容。
    ///
    /// # Safety
    /// 调用方必须保证切片存续期间没有其它线程写该帧
    /// （持有帧表锁或该帧的忙标记）。
    pub(crate) unsafe fn frame_bytes<'a>(&'a self, ppn: Ppn) -> &'a [u8] {
        // SAFETY: 见函数契约。
        unsafe { core::slice::from_raw_parts(self.frame_ptr(ppn), PAGE_SIZE) }
    }

    /// 以可写切片访问帧内容。
    ///
    /// # Safety
    /// 调用方必须独占该帧（持有帧表锁，或持有该帧的忙标记）。
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn frame_bytes_mut<'a>(&'a self, ppn: Ppn) -> &'a mut [u8] {
        // SAFETY: 见函数契约。
        unsafe { core::slice::from_raw_parts_mut(self.frame_ptr(ppn), PAGE_SIZE) }
    }
}

impl Drop for PhysMemory {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.pages * PAGE_SIZE, PAGE_SIZE)
            .expect("PhysMemory: bad layout");
        // SAFETY: base 由同一 layout 分配。
        unsafe {
            dealloc(self.base.as_ptr(), layout);
        }
    }
}
