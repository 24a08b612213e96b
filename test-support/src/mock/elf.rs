//! 构造最小的 32 位大端 MIPS 可执行镜像
//!
//! 只写入 ELF 头和程序头表，没有节头表。
//! 各段数据按页对齐依次放在程序头表之后。

use alloc::vec;
use alloc::vec::Vec;

/// ELF 头大小
pub const EHDR_SIZE: usize = 52;
/// 程序头大小
pub const PHDR_SIZE: usize = 32;

/// `PT_LOAD`
pub const PT_LOAD: u32 = 1;
/// `PT_MIPS_REGINFO`
pub const PT_MIPS_REGINFO: u32 = 0x7000_0000;
/// `EM_MIPS`
pub const EM_MIPS: u16 = 8;

const PAGE_SIZE: usize = 4096;

/// 一个程序头描述的段
#[derive(Clone, Debug)]
pub struct ElfSegment {
    pub p_type: u32,
    pub vaddr: u32,
    pub data: Vec<u8>,
    pub memsz: u32,
    pub flags: u32,
}

/// 镜像构造器
#[derive(Clone, Debug)]
pub struct ElfImageBuilder {
    segments: Vec<ElfSegment>,
    machine: u16,
    entry: u32,
}

impl ElfImageBuilder {
    /// 空镜像（MIPS，入口为 0）
    pub fn new() -> Self {
        Self {
            segments: Vec::new(),
            machine: EM_MIPS,
            entry: 0,
        }
    }

    /// 添加一个 `PT_LOAD` 段，`memsz` 可以大于 `data.len()`（.bss）
    pub fn load_segment(mut self, vaddr: u32, data: &[u8], memsz: u32, flags: u32) -> Self {
        assert!(memsz as usize >= data.len());
        self.segments.push(ElfSegment {
            p_type: PT_LOAD,
            vaddr,
            data: data.to_vec(),
            memsz,
            flags,
        });
        self
    }

    /// 添加任意类型的段
    pub fn raw_segment(mut self, p_type: u32, vaddr: u32, data: &[u8], memsz: u32) -> Self {
        self.segments.push(ElfSegment {
            p_type,
            vaddr,
            data: data.to_vec(),
            memsz,
            flags: 0,
        });
        self
    }

    /// 修改目标机器类型
    pub fn machine(mut self, machine: u16) -> Self {
        self.machine = machine;
        self
    }

    /// 修改入口地址
    pub fn entry(mut self, entry: u32) -> Self {
        self.entry = entry;
        self
    }

    /// 生成镜像字节
    pub fn build(&self) -> Vec<u8> {
        let phoff = EHDR_SIZE;
        let table_end = phoff + PHDR_SIZE * self.segments.len();

        // 数据放置位置：段在页内的偏移与虚拟地址在页内的偏移一致
        let mut offsets = Vec::with_capacity(self.segments.len());
        let mut cursor = align_up(table_end, PAGE_SIZE);
        for seg in &self.segments {
            let off = cursor + (seg.vaddr as usize % PAGE_SIZE);
            offsets.push(off);
            cursor = align_up(off + seg.data.len(), PAGE_SIZE);
        }

        let total = offsets
            .iter()
            .zip(&self.segments)
            .map(|(off, seg)| off + seg.data.len())
            .max()
            .unwrap_or(table_end)
            .max(table_end);
        let mut image = vec![0u8; total];

        // e_ident
        image[0..4].copy_from_slice(b"\x7fELF");
        image[4] = 1; // ELFCLASS32
        image[5] = 2; // ELFDATA2MSB
        image[6] = 1; // EV_CURRENT
        put_u16(&mut image, 16, 2); // ET_EXEC
        put_u16(&mut image, 18, self.machine);
        put_u32(&mut image, 20, 1); // e_version
        put_u32(&mut image, 24, self.entry);
        put_u32(&mut image, 28, phoff as u32);
        put_u32(&mut image, 32, 0); // e_shoff
        put_u32(&mut image, 36, 0); // e_flags
        put_u16(&mut image, 40, EHDR_SIZE as u16);
        put_u16(&mut image, 42, PHDR_SIZE as u16);
        put_u16(&mut image, 44, self.segments.len() as u16);
        put_u16(&mut image, 46, 40); // e_shentsize
        put_u16(&mut image, 48, 0); // e_shnum
        put_u16(&mut image, 50, 0); // e_shstrndx

        for (i, (seg, off)) in self.segments.iter().zip(&offsets).enumerate() {
            let at = phoff + i * PHDR_SIZE;
            put_u32(&mut image, at, seg.p_type);
            put_u32(&mut image, at + 4, *off as u32);
            put_u32(&mut image, at + 8, seg.vaddr);
            put_u32(&mut image, at + 12, seg.vaddr);
            put_u32(&mut image, at + 16, seg.data.len() as u32);
            put_u32(&mut image, at + 20, seg.memsz);
            put_u32(&mut image, at + 24, seg.flags);
            put_u32(&mut image, at + 28, PAGE_SIZE as u32);
            image[*off..*off + seg.data.len()].copy_from_slice(&seg.data);
        }
        image
    }
}

impl Default for ElfImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// 生成长度为 `len` 的可辨识字节序列（第 `seed` 组）
pub fn pattern(seed: u8, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| seed.wrapping_mul(31).wrapping_add((i % 251) as u8) | 1)
        .collect()
}

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

fn put_u16(buf: &mut [u8], at: usize, value: u16) {
    buf[at..at + 2].copy_from_slice(&value.to_be_bytes());
}

fn put_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_be_bytes());
}
