//! 内存文件系统
//!
//! 以路径为键保存文件内容，支持按偏移读写。
//! 可以给单个文件设置“单次传输上限”，用来模拟短读/短写。

use alloc::collections::btree_map::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use sync::SpinLock;

/// 内存中的一个文件
pub struct MemFile {
    data: SpinLock<Vec<u8>>,
    /// 单次读写最多传输的字节数，`usize::MAX` 表示不限制
    transfer_limit: AtomicUsize,
    /// 固定容量（例如交换文件），写入超出容量的部分被截断
    capacity: Option<usize>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl MemFile {
    fn new(data: Vec<u8>, capacity: Option<usize>) -> Self {
        Self {
            data: SpinLock::new(data),
            transfer_limit: AtomicUsize::new(usize::MAX),
            capacity,
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// 从 `offset` 读取，返回实际读取的字节数（越过文件末尾时返回 0）
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let data = self.data.lock();
        if offset >= data.len() {
            return 0;
        }
        let limit = self.transfer_limit.load(Ordering::Relaxed);
        let n = buf.len().min(data.len() - offset).min(limit);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        n
    }

    /// 写入到 `offset`，必要时扩展文件，返回实际写入的字节数
    pub fn write_at(&self, offset: usize, buf: &[u8]) -> usize {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let mut data = self.data.lock();
        let limit = self.transfer_limit.load(Ordering::Relaxed);
        let mut n = buf.len().min(limit);
        if let Some(cap) = self.capacity {
            n = n.min(cap.saturating_sub(offset));
        }
        if n == 0 {
            return 0;
        }
        if data.len() < offset + n {
            data.resize(offset + n, 0);
        }
        data[offset..offset + n].copy_from_slice(&buf[..n]);
        n
    }

    /// 设置单次传输上限
    pub fn set_transfer_limit(&self, limit: usize) {
        self.transfer_limit.store(limit, Ordering::Relaxed);
    }

    /// 文件内容的拷贝
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    /// 文件长度
    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    /// 文件是否为空
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 累计读次数
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    /// 累计写次数
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }
}

/// 内存文件系统
pub struct MemFs {
    files: SpinLock<BTreeMap<String, Arc<MemFile>>>,
    /// 新建文件的容量上限
    create_capacity: Option<usize>,
}

impl MemFs {
    /// 创建空文件系统
    pub fn new() -> Self {
        Self {
            files: SpinLock::new(BTreeMap::new()),
            create_capacity: None,
        }
    }

    /// 创建空文件系统，`open(.., create = true)` 新建的文件容量固定为 `capacity`
    pub fn with_create_capacity(capacity: usize) -> Self {
        Self {
            files: SpinLock::new(BTreeMap::new()),
            create_capacity: Some(capacity),
        }
    }

    /// 放入（或替换）一个文件
    pub fn insert(&self, path: &str, data: Vec<u8>) -> Arc<MemFile> {
        let file = Arc::new(MemFile::new(data, None));
        self.files.lock().insert(path.to_string(), file.clone());
        file
    }

    /// 打开文件，`create` 为真时不存在则新建
    pub fn open(&self, path: &str, create: bool) -> Option<Arc<MemFile>> {
        let mut files = self.files.lock();
        if let Some(file) = files.get(path) {
            return Some(file.clone());
        }
        if !create {
            return None;
        }
        let file = Arc::new(MemFile::new(Vec::new(), self.create_capacity));
        files.insert(path.to_string(), file.clone());
        Some(file)
    }

    /// 按路径查找文件
    pub fn file(&self, path: &str) -> Option<Arc<MemFile>> {
        self.files.lock().get(path).cloned()
    }
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}
