//! 虚拟内存错误类型
//!
//! 可通过 [`VmError::to_errno()`] 转换为系统调用错误码。
//!
//! 错误分两类：
//! - 进程级错误（非法地址、写只读页、非法镜像）只终止出错的进程或加载；
//! - 系统级错误（内存耗尽、交换区耗尽、交换区 I/O 不完整）没有恢复策略，
//!   由最上层调用者通过 [`VmError::escalate()`] 停机。

use core::fmt;

/// 虚拟内存错误类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// 置换之后仍然拿不到物理帧 (-ENOMEM)
    OutOfMemory,
    /// 交换区位图已满 (-ENOSPC)
    OutOfSwapSpace,
    /// 可执行镜像格式错误或被截断 (-ENOEXEC)
    InvalidExecutable,
    /// 交换区读写不完整 (-EIO)
    TruncatedIo,
    /// 缺页地址不属于任何段 (-EFAULT)
    BadAddress,
    /// 写只读页 (-EFAULT)
    ProtectionViolation,
    /// 没有当前进程或地址空间 (-EFAULT)
    NoAddressSpace,
    /// 第三次定义区域 (-ENOSYS)
    InvalidRegion,
    /// 未知的缺页类型 (-EINVAL)
    BadFaultKind,
    /// 后备存储返回的错误，原样传递
    Io(isize),
}

/// 虚拟内存操作结果
pub type VmResult<T> = Result<T, VmError>;

impl VmError {
    /// 转换为系统调用错误码（负数）
    pub fn to_errno(&self) -> isize {
        match self {
            VmError::TruncatedIo => -5,
            VmError::InvalidExecutable => -8,
            VmError::OutOfMemory => -12,
            VmError::BadAddress | VmError::ProtectionViolation | VmError::NoAddressSpace => -14,
            VmError::BadFaultKind => -22,
            VmError::OutOfSwapSpace => -28,
            VmError::InvalidRegion => -38,
            VmError::Io(errno) => *errno,
        }
    }

    /// 是否为需要停机的系统级错误
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            VmError::OutOfMemory | VmError::OutOfSwapSpace | VmError::TruncatedIo
        )
    }

    /// 将系统级错误升级为停机
    ///
    /// # Panics
    /// 总是 panic
    pub fn escalate(self) -> ! {
        log::error!("vm: unrecoverable error: {}", self);
        panic!("vm: {}", self);
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::OutOfMemory => write!(f, "out of physical memory"),
            VmError::OutOfSwapSpace => write!(f, "out of swap space"),
            VmError::InvalidExecutable => write!(f, "invalid executable image"),
            VmError::TruncatedIo => write!(f, "truncated swap I/O"),
            VmError::BadAddress => write!(f, "address outside every segment"),
            VmError::ProtectionViolation => write!(f, "write to read-only page"),
            VmError::NoAddressSpace => write!(f, "no current address space"),
            VmError::InvalidRegion => write!(f, "too many regions"),
            VmError::BadFaultKind => write!(f, "unknown fault type"),
            VmError::Io(errno) => write!(f, "backing store error {}", errno),
        }
    }
}
