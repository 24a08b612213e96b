//! 地址模块
//!
//! 物理地址 [`Paddr`] 与用户虚拟地址 [`Vaddr`] 的新类型封装，
//! 以及页对齐相关操作。
//!
//! 页大小固定为 [`PAGE_SIZE`]（4 KiB）。

/// 页大小
pub const PAGE_SIZE: usize = 4096;

/// 页帧掩码，`addr & PAGE_FRAME` 即页起始地址
pub const PAGE_FRAME: usize = !(PAGE_SIZE - 1);

/// 在类型和 usize 之间进行转换
pub trait UsizeConvert: Copy {
    /// 转换为 usize
    fn as_usize(&self) -> usize;
    /// 从 usize 构造
    fn from_usize(value: usize) -> Self;
}

/// 页对齐操作
pub trait AlignOps: UsizeConvert {
    /// 向下对齐到页边界
    fn align_down_to_page(self) -> Self {
        Self::from_usize(self.as_usize() & PAGE_FRAME)
    }

    /// 向上对齐到页边界
    fn align_up_to_page(self) -> Self {
        Self::from_usize((self.as_usize() + PAGE_SIZE - 1) & PAGE_FRAME)
    }

    /// 是否页对齐
    fn is_page_aligned(self) -> bool {
        self.as_usize() & !PAGE_FRAME == 0
    }

    /// 页内偏移
    fn page_offset(self) -> usize {
        self.as_usize() & !PAGE_FRAME
    }
}

/// `impl_address!` 宏
///
/// 为地址新类型实现 [`UsizeConvert`]、[`AlignOps`] 和十六进制的 `Debug`。
macro_rules! impl_address {
    ($type:ident, $name:literal) => {
        impl UsizeConvert for $type {
            #[inline]
            fn as_usize(&self) -> usize {
                self.0
            }

            #[inline]
            fn from_usize(value: usize) -> Self {
                Self(value)
            }
        }

        impl AlignOps for $type {}

        impl core::fmt::Debug for $type {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, concat!($name, "({:#x})"), self.0)
            }
        }

        impl core::ops::Add<usize> for $type {
            type Output = Self;

            fn add(self, rhs: usize) -> Self {
                Self(self.0 + rhs)
            }
        }
    };
}

/// 物理地址
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Paddr(pub usize);

/// 用户虚拟地址
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Vaddr(pub usize);

impl_address!(Paddr, "Paddr");
impl_address!(Vaddr, "Vaddr");

impl Paddr {
    /// 物理帧号
    #[inline]
    pub fn frame_index(self) -> usize {
        self.0 / PAGE_SIZE
    }

    /// 由物理帧号构造帧起始地址
    #[inline]
    pub fn from_frame_index(index: usize) -> Self {
        Self(index * PAGE_SIZE)
    }
}
