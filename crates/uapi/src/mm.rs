//! 内存管理相关的共享定义

use bitflags::bitflags;

bitflags! {
    /// 段（region）的访问权限位。
    ///
    /// 与 ELF program header 的 PF_X/PF_W/PF_R 位序一致，
    /// 加载器可以直接把 `p_flags` 的低三位传进来。
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegionPerms: u8 {
        /// 可执行
        const EXEC = 1 << 0;
        /// 可写
        const WRITE = 1 << 1;
        /// 可读
        const READ = 1 << 2;
    }
}

impl RegionPerms {
    /// 读写数据段的常用组合。
    pub fn rw() -> Self {
        RegionPerms::READ | RegionPerms::WRITE
    }

    /// 只读代码段的常用组合。
    pub fn rx() -> Self {
        RegionPerms::READ | RegionPerms::EXEC
    }
}
