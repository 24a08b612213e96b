//! 交换区
//!
//! 交换文件是一串页大小的槽，第 `i` 个槽位于字节偏移 `i * PAGE_SIZE`，
//! 文件本身不含任何元数据；占用情况只记录在内存中的位图里（置位 = 占用）。
//!
//! - 换出时分配一个空槽并写入整页；
//! - 换入时读出整页并立即释放该槽，因此每次换出只能换入一次；
//! - 地址空间销毁时直接释放仍在交换区中的页。
//!
//! 位图锁只保护位图本身，读写文件时不持有任何锁。

use crate::address::PAGE_SIZE;
use crate::error::{VmError, VmResult};
use crate::file::{VmFile, VmFs};
use crate::stats::{StatKind, VmStats};
use alloc::sync::Arc;
use alloc::vec::Vec;
use sync::SpinLock;

/// 交换区槽号
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapSlot(usize);

impl SwapSlot {
    /// 由槽号构造
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    /// 槽号
    pub fn index(self) -> usize {
        self.0
    }

    /// 槽在交换文件中的字节偏移
    pub fn offset(self) -> usize {
        self.0 * PAGE_SIZE
    }
}

/// 槽位图
struct SwapBitmap {
    words: Vec<u64>,
    nslots: usize,
    used: usize,
    /// 上次分配的字位置
    hint: usize,
}

impl SwapBitmap {
    const fn empty() -> Self {
        Self {
            words: Vec::new(),
            nslots: 0,
            used: 0,
            hint: 0,
        }
    }

    fn new(nslots: usize) -> Self {
        Self {
            words: alloc::vec![0u64; nslots.div_ceil(64)],
            nslots,
            used: 0,
            hint: 0,
        }
    }

    fn is_set(&self, index: usize) -> bool {
        index < self.nslots && self.words[index / 64] & (1u64 << (index % 64)) != 0
    }

    fn alloc(&mut self) -> Option<usize> {
        let len = self.words.len();
        for offset in 0..len {
            let idx = (self.hint + offset) % len;
            let word = self.words[idx];
            if word == u64::MAX {
                continue;
            }
            let bit = (!word).trailing_zeros() as usize;
            let index = idx * 64 + bit;
            if index >= self.nslots {
                continue;
            }
            self.words[idx] |= 1u64 << bit;
            self.used += 1;
            self.hint = idx;
            return Some(index);
        }
        None
    }

    fn unmark(&mut self, index: usize) {
        debug_assert!(self.is_set(index));
        self.words[index / 64] &= !(1u64 << (index % 64));
        self.used -= 1;
    }
}

/// 交换区
pub struct SwapStore {
    file: SpinLock<Option<Arc<dyn VmFile>>>,
    bitmap: SpinLock<SwapBitmap>,
}

impl SwapStore {
    /// 创建尚未打开交换文件的交换区（容量为 0）
    pub const fn new() -> Self {
        Self {
            file: SpinLock::new(None),
            bitmap: SpinLock::new(SwapBitmap::empty()),
        }
    }

    /// 打开（必要时创建）交换文件，容量为 `size / PAGE_SIZE` 个槽
    pub fn init(&self, fs: &dyn VmFs, path: &str, size: usize) -> VmResult<()> {
        let file = fs.open(path, true).map_err(|errno| {
            log::error!("swap: cannot open {}: {}", path, errno);
            VmError::Io(errno)
        })?;
        let nslots = size / PAGE_SIZE;
        *self.bitmap.lock() = SwapBitmap::new(nslots);
        *self.file.lock() = Some(file);
        log::info!("swap: {} opened, {} slots", path, nslots);
        Ok(())
    }

    /// 关闭交换文件并丢弃位图
    pub fn shutdown(&self) {
        let used = self.used_slots();
        if used != 0 {
            log::debug!("swap: shutdown with {} slots still in use", used);
        }
        self.file.lock().take();
        *self.bitmap.lock() = SwapBitmap::empty();
    }

    fn file(&self) -> VmResult<Arc<dyn VmFile>> {
        self.file.lock().clone().ok_or(VmError::OutOfSwapSpace)
    }

    /// 将一页写入新分配的槽
    ///
    /// 交换区已满返回 [`VmError::OutOfSwapSpace`]，写入不完整返回
    /// [`VmError::TruncatedIo`]，两者都应升级为停机。
    pub fn write_out(&self, page: &[u8], stats: &VmStats) -> VmResult<SwapSlot> {
        debug_assert_eq!(page.len(), PAGE_SIZE);
        let file = self.file()?;
        let slot = self
            .bitmap
            .lock()
            .alloc()
            .map(SwapSlot)
            .ok_or(VmError::OutOfSwapSpace)?;

        let written = file.write_at(slot.offset(), page);
        if written != Ok(PAGE_SIZE) {
            log::error!("swap: write of slot {} failed: {:?}", slot.index(), written);
            self.bitmap.lock().unmark(slot.index());
            return Err(VmError::TruncatedIo);
        }
        stats.increment(StatKind::SwapfileWrites);
        log::debug!("swap: page written to slot {}", slot.index());
        Ok(slot)
    }

    /// 从槽读出一页并释放该槽
    ///
    /// # Panics
    /// 槽未被占用时 panic
    pub fn read_in(&self, slot: SwapSlot, page: &mut [u8]) -> VmResult<()> {
        debug_assert_eq!(page.len(), PAGE_SIZE);
        assert!(
            self.is_slot_used(slot),
            "swap: reading empty slot {}",
            slot.index()
        );
        let file = self.file()?;
        let read = file.read_at(slot.offset(), page);
        if read != Ok(PAGE_SIZE) {
            log::error!("swap: read of slot {} failed: {:?}", slot.index(), read);
            return Err(VmError::TruncatedIo);
        }
        self.bitmap.lock().unmark(slot.index());
        log::debug!("swap: page read from slot {}", slot.index());
        Ok(())
    }

    /// 释放一个槽而不读取
    ///
    /// # Panics
    /// 槽未被占用时 panic
    pub fn free_slot(&self, slot: SwapSlot) {
        let mut bitmap = self.bitmap.lock();
        assert!(
            bitmap.is_set(slot.index()),
            "swap: freeing empty slot {}",
            slot.index()
        );
        bitmap.unmark(slot.index());
    }

    /// 槽是否被占用
    pub fn is_slot_used(&self, slot: SwapSlot) -> bool {
        self.bitmap.lock().is_set(slot.index())
    }

    /// 已占用的槽数
    pub fn used_slots(&self) -> usize {
        self.bitmap.lock().used
    }

    /// 总槽数
    pub fn capacity(&self) -> usize {
        self.bitmap.lock().nslots
    }
}

impl Default for SwapStore {
    fn default() -> Self {
        Self::new()
    }
}
