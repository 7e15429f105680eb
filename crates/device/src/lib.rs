//! 设备驱动接口
//!
//! 目前只包含块设备抽象；交换区（swap）等消费方通过
//! [`BlockDriver`](block::BlockDriver) 使用块设备。

#![no_std]

extern crate alloc;

pub mod block;

pub use block::{BlockDriver, RamDisk};
