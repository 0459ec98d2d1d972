//! Platform/Board Constants (QEMU virt machine)
//!
//! All board-specific addresses and sizes live here so they can be
//! changed in one place when targeting a different platform. The memory
//! window and GIC frames are also constructor parameters of the state
//! objects, so tests can aim the same code at arena-backed windows.

// ── Boot console (PL011) ─────────────────────────────────────────────
pub const UART_BASE: usize = 0x0900_0000;
pub const UART_SIZE: u64 = 0x1000;

// ── Managed physical memory window ──────────────────────────────────
/// Start of the RAM window tracked by the page allocator.
pub const PHYS_START_ADDR: u64 = 0x4000_0000;
/// Size of the tracked RAM window.
pub const PHYS_MEM_SIZE: u64 = 0x8000_0000;
/// Pages reserved for the translation-table pool.
pub const HEAP_PAGES: usize = 256;

// ── Partitioning limits ─────────────────────────────────────────────
pub const MAX_VMS: usize = 4;
pub const MAX_CPUS: usize = 8;
/// vCPUs are pinned 1:1 to physical CPUs, so the per-VM limit matches.
pub const MAX_VCPUS: usize = MAX_CPUS;

// ── CPU topology ────────────────────────────────────────────────────
/// Cores per cluster, used when folding MPIDR affinity fields into a
/// linear CPU number.
pub const CPUS_PER_CLUSTER: u64 = 4;

pub const STACK_SIZE: usize = 4096 * 2;

// ── GIC ─────────────────────────────────────────────────────────────
pub const GICD_BASE: u64 = 0x0800_0000;
pub const GICD_SIZE: u64 = 0x1_0000;
pub const GITS_BASE: u64 = 0x0808_0000;
pub const GITS_SIZE: u64 = 0x2_0000;
pub const GICR_BASE: u64 = 0x080A_0000;

/// Stride of one redistributor frame: 128KB on GICv3, 256KB on GICv4.
#[cfg(not(feature = "gicv4"))]
pub const GICR_FRAME_SIZE: u64 = 0x2_0000;
#[cfg(feature = "gicv4")]
pub const GICR_FRAME_SIZE: u64 = 0x4_0000;

// ── Virtual devices ─────────────────────────────────────────────────
pub const V_SANCT_UART_BASE: u64 = 0x3086_0000;
pub const V_SANCT_UART_SIZE: u64 = 0x1_0000;
pub const V_SANCT_UART_DEVS: usize = 4;

pub const V_ANATOP_BASE: u64 = 0x3036_0000;
pub const V_ANATOP_SIZE: u64 = 0x1_0000;

pub const V_IOMUX_BASE: u64 = 0x3033_0000;
pub const V_IOMUX_SIZE: u64 = 0x1_0000;

pub const V_CLOCK_CTRL_BASE: u64 = 0x3038_0000;
pub const V_CLOCK_CTRL_SIZE: u64 = 0x1_0000;

// ── Boot archive ────────────────────────────────────────────────────
/// Where the firmware leaves the CPIO boot archive.
pub const INITRD_BASE: u64 = 0x4800_0000;
pub const INITRD_MAX_SIZE: usize = 0x0200_0000;

// ── Logging ─────────────────────────────────────────────────────────
/// Default max level compiled in; `dlog::init` may lower it at boot.
pub const LOG_LEVEL: log::LevelFilter = log::LevelFilter::Info;
