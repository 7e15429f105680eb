//! 错误码定义（与 Linux 兼容的编号）
//!
//! 内核子系统内部使用各自的错误枚举，在系统调用边界上统一翻译为
//! 这里的负 errno 约定。

/// 输入/输出错误
pub const EIO: i32 = 5;
/// 无此进程
pub const ESRCH: i32 = 3;
/// 内存不足
pub const ENOMEM: i32 = 12;
/// 地址非法
pub const EFAULT: i32 = 14;
/// 参数无效
pub const EINVAL: i32 = 22;
/// 设备上没有剩余空间
pub const ENOSPC: i32 = 28;
