//! 虚拟内存统计
//!
//! 十个被动计数器，只在 [`VmStats::init`] 与 [`VmStats::shutdown`] 之间生效，
//! 其余时间的递增会被丢弃。计数对行为没有任何影响。
//!
//! 计数约定：
//!
//! - `tlb_faults = tlb_faults_with_free + tlb_faults_with_replace`
//! - `tlb_faults = tlb_reloads + page_faults_zeroed + page_faults_disk`
//! - `page_faults_disk = page_faults_elf + page_faults_swap`
//!
//! [`VmStats::report`] 打印全部计数并检查上述等式。

use sync::SpinLock;

/// 计数器种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum StatKind {
    /// TLB 缺失
    TlbFaults,
    /// 有空闲槽的 TLB 缺失
    TlbFaultsWithFree,
    /// 需要替换的 TLB 缺失
    TlbFaultsWithReplace,
    /// 整个 TLB 失效
    TlbInvalidations,
    /// 页已在内存中，只需重新装入 TLB
    TlbReloads,
    /// 填零的缺页
    PageFaultsZeroed,
    /// 需要读盘的缺页
    PageFaultsDisk,
    /// 从可执行镜像读入的缺页
    PageFaultsElf,
    /// 从交换文件读入的缺页
    PageFaultsSwap,
    /// 写交换文件
    SwapfileWrites,
}

impl StatKind {
    /// 计数器个数
    pub const COUNT: usize = 10;

    /// 全部种类，按报告顺序
    pub const ALL: [StatKind; Self::COUNT] = [
        StatKind::TlbFaults,
        StatKind::TlbFaultsWithFree,
        StatKind::TlbFaultsWithReplace,
        StatKind::TlbInvalidations,
        StatKind::TlbReloads,
        StatKind::PageFaultsZeroed,
        StatKind::PageFaultsDisk,
        StatKind::PageFaultsElf,
        StatKind::PageFaultsSwap,
        StatKind::SwapfileWrites,
    ];

    /// 报告中使用的名字
    pub fn name(self) -> &'static str {
        match self {
            StatKind::TlbFaults => "tlb_faults",
            StatKind::TlbFaultsWithFree => "tlb_faults_with_free",
            StatKind::TlbFaultsWithReplace => "tlb_faults_with_replace",
            StatKind::TlbInvalidations => "tlb_invalidations",
            StatKind::TlbReloads => "tlb_reloads",
            StatKind::PageFaultsZeroed => "page_faults_zeroed",
            StatKind::PageFaultsDisk => "page_faults_disk",
            StatKind::PageFaultsElf => "page_faults_elf",
            StatKind::PageFaultsSwap => "page_faults_swap",
            StatKind::SwapfileWrites => "swapfile_writes",
        }
    }
}

/// 计数快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmStatsSnapshot {
    counters: [u64; StatKind::COUNT],
}

impl VmStatsSnapshot {
    /// 读取某个计数
    pub fn get(&self, kind: StatKind) -> u64 {
        self.counters[kind as usize]
    }

    /// 三条计数等式是否全部成立
    pub fn is_consistent(&self) -> bool {
        self.inconsistencies().next().is_none()
    }

    fn inconsistencies(&self) -> impl Iterator<Item = &'static str> + '_ {
        use StatKind::*;
        let g = |k| self.get(k);
        [
            (
                g(TlbFaults) != g(TlbFaultsWithFree) + g(TlbFaultsWithReplace),
                "tlb_faults != tlb_faults_with_free + tlb_faults_with_replace",
            ),
            (
                g(TlbFaults) != g(TlbReloads) + g(PageFaultsZeroed) + g(PageFaultsDisk),
                "tlb_faults != tlb_reloads + page_faults_zeroed + page_faults_disk",
            ),
            (
                g(PageFaultsDisk) != g(PageFaultsElf) + g(PageFaultsSwap),
                "page_faults_disk != page_faults_elf + page_faults_swap",
            ),
        ]
        .into_iter()
        .filter(|(broken, _)| *broken)
        .map(|(_, msg)| msg)
    }
}

struct StatsInner {
    active: bool,
    counters: [u64; StatKind::COUNT],
}

/// 虚拟内存统计
pub struct VmStats {
    inner: SpinLock<StatsInner>,
}

impl VmStats {
    /// 创建未激活的统计
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(StatsInner {
                active: false,
                counters: [0; StatKind::COUNT],
            }),
        }
    }

    /// 清零并开始计数
    pub fn init(&self) {
        let mut inner = self.inner.lock();
        inner.counters = [0; StatKind::COUNT];
        inner.active = true;
    }

    /// 停止计数
    pub fn shutdown(&self) {
        self.inner.lock().active = false;
    }

    /// 是否在计数
    pub fn is_active(&self) -> bool {
        self.inner.lock().active
    }

    /// 递增一个计数
    pub fn increment(&self, kind: StatKind) {
        let mut inner = self.inner.lock();
        if inner.active {
            inner.counters[kind as usize] += 1;
        }
    }

    /// 读取当前全部计数
    pub fn snapshot(&self) -> VmStatsSnapshot {
        VmStatsSnapshot {
            counters: self.inner.lock().counters,
        }
    }

    /// 打印全部计数，计数不一致时给出警告
    ///
    /// 返回打印时的快照。
    pub fn report(&self) -> VmStatsSnapshot {
        let snap = self.snapshot();
        for kind in StatKind::ALL {
            log::info!("vmstats: {} = {}", kind.name(), snap.get(kind));
        }
        for msg in snap.inconsistencies() {
            log::warn!("vmstats: inconsistent counters: {}", msg);
        }
        snap
    }
}

impl Default for VmStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_support::mock::arch::init_sync_arch_ops;

    #[test]
    fn test_inactive_increments_are_dropped() {
        init_sync_arch_ops();
        let stats = VmStats::new();
        stats.increment(StatKind::TlbFaults);
        assert_eq!(stats.snapshot().get(StatKind::TlbFaults), 0);

        stats.init();
        stats.increment(StatKind::TlbFaults);
        stats.increment(StatKind::TlbFaults);
        stats.shutdown();
        stats.increment(StatKind::TlbFaults);
        assert_eq!(stats.snapshot().get(StatKind::TlbFaults), 2);
    }

    #[test]
    fn test_consistency_checks() {
        init_sync_arch_ops();
        let stats = VmStats::new();
        stats.init();
        assert!(stats.report().is_consistent());

        // 一次从镜像读入的缺页
        for kind in [
            StatKind::TlbFaults,
            StatKind::TlbFaultsWithFree,
            StatKind::PageFaultsDisk,
            StatKind::PageFaultsElf,
        ] {
            stats.increment(kind);
        }
        assert!(stats.snapshot().is_consistent());

        stats.increment(StatKind::PageFaultsSwap);
        let snap = stats.report();
        assert!(!snap.is_consistent());
        assert_eq!(snap.inconsistencies().count(), 1);
    }

    #[test]
    fn test_init_resets_counters() {
        init_sync_arch_ops();
        let stats = VmStats::new();
        stats.init();
        stats.increment(StatKind::SwapfileWrites);
        stats.init();
        assert_eq!(stats.snapshot(), VmStatsSnapshot::default());
        assert!(stats.is_active());
    }
}
