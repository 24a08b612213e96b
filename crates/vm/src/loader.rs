//! 可执行镜像加载
//!
//! 镜像必须是 32 位、大端、`EV_CURRENT` 版本的 MIPS 可执行文件。
//! 头部按偏移单独读取，不会把整个文件读入内存：
//! ELF 头位于偏移 0，第 `i` 个程序头位于 `e_phoff + i * e_phentsize`。
//!
//! 程序头类型只接受 `PT_NULL`、`PT_PHDR`、`PT_MIPS_REGINFO`（跳过）和 `PT_LOAD`，
//! 其他类型视为无法执行。第一个 `PT_LOAD` 是代码段，第二个是数据段。
//!
//! 按页加载时，段内第 `k` 页对应虚拟地址
//! `[align_down(p_vaddr) + k * PAGE_SIZE, +PAGE_SIZE)`，
//! 与文件中 `[p_vaddr, p_vaddr + p_filesz)` 的交集从文件读入，其余部分填零（.bss）。

use crate::address::{AlignOps, PAGE_SIZE, UsizeConvert, Vaddr};
use crate::error::{VmError, VmResult};
use crate::file::{VmFile, VmFs};
use crate::page_table::{SegmentKind, SegmentPerms};
use alloc::sync::Arc;
use alloc::vec::Vec;
use goblin::container::Ctx;
use goblin::elf::Elf;
use goblin::elf::header::{self, Header, header32};
use goblin::elf::program_header::{self, ProgramHeader, program_header32};

/// MIPS 寄存器信息段
const PT_MIPS_REGINFO: u32 = 0x7000_0000;

/// 单页加载的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// 页中有文件内容
    Read,
    /// 页完全位于文件内容之外，只填了零
    ZeroFilled,
}

/// 一个 `PT_LOAD` 段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadSegment {
    /// 起始虚拟地址（不一定页对齐）
    pub vaddr: Vaddr,
    /// 文件中的字节数
    pub filesz: usize,
    /// 内存中的字节数
    pub memsz: usize,
    /// 权限
    pub perms: SegmentPerms,
}

/// 镜像布局
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageLayout {
    /// 入口地址
    pub entry: Vaddr,
    /// 全部 `PT_LOAD` 段，按程序头顺序
    pub segments: Vec<LoadSegment>,
}

struct Image {
    file: Arc<dyn VmFile>,
    header: Header,
    ctx: Ctx,
}

fn read_exact(file: &dyn VmFile, offset: usize, buf: &mut [u8], what: &str) -> VmResult<()> {
    let n = file.read_at(offset, buf).map_err(VmError::Io)?;
    if n != buf.len() {
        log::warn!(
            "loader: short read on {} ({} of {} bytes) - file truncated?",
            what,
            n,
            buf.len()
        );
        return Err(VmError::InvalidExecutable);
    }
    Ok(())
}

impl Image {
    fn open(fs: &dyn VmFs, path: &str) -> VmResult<Self> {
        let file = fs.open(path, false).map_err(VmError::Io)?;

        let mut ehdr = [0u8; header32::SIZEOF_EHDR];
        read_exact(&*file, 0, &mut ehdr, "header")?;

        let ident_ok = ehdr[..header::SELFMAG] == header::ELFMAG[..]
            && ehdr[header::EI_CLASS] == header::ELFCLASS32
            && ehdr[header::EI_DATA] == header::ELFDATA2MSB
            && ehdr[header::EI_VERSION] == header::EV_CURRENT;
        if !ident_ok {
            log::debug!("loader: {}: not a 32-bit big-endian ELF", path);
            return Err(VmError::InvalidExecutable);
        }

        let header = Elf::parse_header(&ehdr).map_err(|_| VmError::InvalidExecutable)?;
        if header.e_version != u32::from(header::EV_CURRENT)
            || header.e_type != header::ET_EXEC
            || header.e_machine != header::EM_MIPS
        {
            log::debug!(
                "loader: {}: type {} machine {} is not a MIPS executable",
                path,
                header.e_type,
                header.e_machine
            );
            return Err(VmError::InvalidExecutable);
        }
        let container = header.container().map_err(|_| VmError::InvalidExecutable)?;
        let endian = header.endianness().map_err(|_| VmError::InvalidExecutable)?;
        Ok(Self {
            file,
            header,
            ctx: Ctx::new(container, endian),
        })
    }

    fn program_header(&self, index: usize) -> VmResult<ProgramHeader> {
        let offset =
            self.header.e_phoff as usize + index * usize::from(self.header.e_phentsize);
        let mut buf = [0u8; program_header32::SIZEOF_PHDR];
        read_exact(&*self.file, offset, &mut buf, "program header")?;
        ProgramHeader::parse(&buf, 0, 1, self.ctx)
            .ok()
            .and_then(|mut phs| phs.pop())
            .ok_or(VmError::InvalidExecutable)
    }

    /// 按顺序遍历 `PT_LOAD` 段，遇到 `f` 返回 `Some` 时停止
    fn find_load<T>(&self, mut f: impl FnMut(usize, ProgramHeader) -> Option<T>) -> VmResult<Option<T>> {
        let mut ordinal = 0;
        for index in 0..usize::from(self.header.e_phnum) {
            let ph = self.program_header(index)?;
            match ph.p_type {
                program_header::PT_NULL | program_header::PT_PHDR | PT_MIPS_REGINFO => {}
                program_header::PT_LOAD => {
                    if let Some(found) = f(ordinal, ph) {
                        return Ok(Some(found));
                    }
                    ordinal += 1;
                }
                other => {
                    log::warn!("loader: unknown segment type {:#x}", other);
                    return Err(VmError::InvalidExecutable);
                }
            }
        }
        Ok(None)
    }
}

/// 用户地址与镜像偏移都不能越过 32 位
const ADDR_LIMIT: u64 = 1 << 32;

fn to_load_segment(ph: &ProgramHeader) -> VmResult<LoadSegment> {
    let filesz = if ph.p_filesz > ph.p_memsz {
        log::warn!("loader: segment filesize > segment memsize");
        ph.p_memsz
    } else {
        ph.p_filesz
    };
    let within = |start: u64, len: u64| start.checked_add(len).is_some_and(|end| end <= ADDR_LIMIT);
    if !within(ph.p_vaddr, ph.p_memsz) || !within(ph.p_offset, filesz) {
        log::warn!(
            "loader: segment {:#x}+{:#x} (offset {:#x}) out of range",
            ph.p_vaddr,
            ph.p_memsz,
            ph.p_offset
        );
        return Err(VmError::InvalidExecutable);
    }
    Ok(LoadSegment {
        vaddr: Vaddr(ph.p_vaddr as usize),
        filesz: filesz as usize,
        memsz: ph.p_memsz as usize,
        perms: SegmentPerms::from_bits_truncate((ph.p_flags & 0x7) as u8),
    })
}

/// 读取镜像的入口地址与全部 `PT_LOAD` 段
pub fn read_layout(fs: &dyn VmFs, path: &str) -> VmResult<ImageLayout> {
    let image = Image::open(fs, path)?;
    let mut segments = Vec::new();
    image.find_load(|_, ph| {
        segments.push(to_load_segment(&ph));
        None::<()>
    })?;
    Ok(ImageLayout {
        entry: Vaddr(image.header.e_entry as usize),
        segments: segments.into_iter().collect::<VmResult<_>>()?,
    })
}

/// 将 `kind` 段的第 `page_index` 页装入 `frame`
///
/// `frame` 先被清零；页中属于文件内容的部分再从镜像读入。
/// 栈段没有文件内容，直接填零。
pub fn load_page(
    fs: &dyn VmFs,
    path: &str,
    kind: SegmentKind,
    page_index: usize,
    frame: &mut [u8],
) -> VmResult<LoadOutcome> {
    debug_assert_eq!(frame.len(), PAGE_SIZE);
    frame.fill(0);
    let wanted = match kind {
        SegmentKind::Code => 0,
        SegmentKind::Data => 1,
        SegmentKind::Stack => return Ok(LoadOutcome::ZeroFilled),
    };

    let image = Image::open(fs, path)?;
    let (file_offset, seg) = image
        .find_load(|ordinal, ph| {
            (ordinal == wanted).then(|| (ph.p_offset as usize, to_load_segment(&ph)))
        })?
        .ok_or_else(|| {
            log::warn!("loader: {}: no {:?} segment", path, kind);
            VmError::InvalidExecutable
        })?;
    let seg = seg?;

    let data_start = seg.vaddr.as_usize();
    let bounds = page_index
        .checked_mul(PAGE_SIZE)
        .and_then(|off| seg.vaddr.align_down_to_page().as_usize().checked_add(off))
        .and_then(|start| Some((start, start.checked_add(PAGE_SIZE)?)))
        .zip(data_start.checked_add(seg.filesz));
    let Some(((page_start, page_end), data_end)) = bounds else {
        log::warn!("loader: {}: page {} of {:?} segment out of range", path, page_index, kind);
        return Err(VmError::InvalidExecutable);
    };

    let lo = page_start.max(data_start);
    let hi = page_end.min(data_end);
    if lo >= hi {
        return Ok(LoadOutcome::ZeroFilled);
    }

    log::trace!(
        "loader: {} bytes at {:#x} from offset {:#x}",
        hi - lo,
        lo,
        file_offset + (lo - data_start)
    );
    read_exact(
        &*image.file,
        file_offset + (lo - data_start),
        &mut frame[lo - page_start..hi - page_start],
        "segment",
    )?;
    Ok(LoadOutcome::Read)
}
