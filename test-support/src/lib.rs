//! 测试支持 crate
//!
//! 提供各子系统单元测试用的 Mock 实现

#![no_std]

extern crate alloc;

pub mod mock;
