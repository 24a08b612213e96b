//! 测试支持 crate
//!
//! 提供宿主机上运行单元测试所需的 Mock 实现：
//!
//! - [`mock::arch`]：中断开关（实现 `sync::ArchOps`）
//! - [`mock::mm`]：模拟物理内存与软件 TLB
//! - [`mock::fs`]：内存文件系统（可执行镜像与交换文件）
//! - [`mock::process`]：可切换的“当前进程”
//! - [`mock::elf`]：构造最小的 32 位大端 MIPS 可执行镜像
//!
//! 这里不依赖 `vm` crate（避免循环依赖），
//! `vm` 的集成测试用新类型把它们接到自己的 trait 上。

#![no_std]

extern crate alloc;

pub mod mock;
