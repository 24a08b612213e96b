//! 后备存储接口 trait 定义
//!
//! 可执行镜像与交换文件都通过这组接口按偏移读写。

use alloc::sync::Arc;

/// 可按偏移读写的文件
///
/// 返回实际传输的字节数，允许短读/短写，由调用者检测。
/// 错误值为负的 errno。
pub trait VmFile: Send + Sync {
    /// 从指定偏移读取数据到缓冲区
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize, isize>;

    /// 将缓冲区数据写入指定偏移
    fn write_at(&self, offset: usize, buf: &[u8]) -> Result<usize, isize>;
}

/// 按路径打开文件
pub trait VmFs: Send + Sync {
    /// 打开 `path`；`create` 为真时不存在则创建
    fn open(&self, path: &str, create: bool) -> Result<Arc<dyn VmFile>, isize>;
}

