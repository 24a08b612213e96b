//! Mock 实现模块

pub mod arch;
pub mod elf;
pub mod fs;
pub mod mm;
pub mod process;
