//! 虚拟内存子系统
//!
//! 提供物理帧管理（coremap + FIFO 置换）、按需调页的地址空间、
//! 缺页处理、软件管理的 TLB 以及基于交换文件的换入换出。
//!
//! # 组成
//!
//! - [`coremap`]：物理帧状态表与 FIFO 所有权队列
//! - [`address_space`] / [`page_table`]：代码段、数据段、栈段三段式地址空间
//! - [`loader`]：从可执行镜像按页加载代码/数据
//! - [`swap`]：交换文件槽位位图与页读写
//! - [`tlb`]：TLB 插入与失效
//! - [`fault`]：缺页处理状态机
//! - [`stats`]：被动统计计数
//!
//! # 架构解耦
//!
//! 通过 trait 与内核其余部分解耦：
//! - [`ArchVmOps`]：物理内存布局、地址转换、TLB 读写
//! - [`VmConfig`]：栈布局与交换文件参数
//! - [`ProcessOps`]：当前进程的地址空间
//! - [`VmFs`] / [`VmFile`]：可执行镜像和交换文件的按偏移读写
//!
//! 内核使用前必须调用 [`register_arch_ops`] 和 [`register_config`]，
//! 然后通过 [`vm_bootstrap`] 建立全局实例。

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod arch_ops;
mod config;
mod error;
mod file;
mod process;

pub mod address;
pub mod address_space;
pub mod coremap;
pub mod fault;
pub mod loader;
pub mod page_table;
pub mod stats;
pub mod swap;
pub mod tlb;
pub mod vm;

pub use arch_ops::{ArchVmOps, arch_ops, register_arch_ops};
pub use config::{DefaultVmConfig, VmConfig, register_config, vm_config};
pub use error::{VmError, VmResult};
pub use file::{VmFile, VmFs};
pub use process::ProcessOps;

// Re-export 常用类型
pub use address::{AlignOps, PAGE_FRAME, PAGE_SIZE, Paddr, UsizeConvert, Vaddr};
pub use address_space::{AddressSpace, AsId};
pub use coremap::{Coremap, FrameState, FrameStats};
pub use fault::FaultKind;
pub use loader::{ImageLayout, LoadOutcome, LoadSegment};
pub use page_table::{PageTableEntry, PteState, SegmentKind, SegmentPerms};
pub use stats::{StatKind, VmStats, VmStatsSnapshot};
pub use swap::{SwapSlot, SwapStore};
pub use tlb::{Tlb, TlbEntry};
pub use vm::{Vm, kernel_vm, vm_bootstrap, vm_fault, vm_shutdown};
