#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

//! Boot-CPU entry.
//!
//! The platform bring-up stub drops us here at EL2 with the MMU off and a
//! stack established; the exception vectors and the guest entry/exit
//! register shuffle also live in that stub. Everything else (memory
//! subsystem, manifest, VM construction, secondary bring-up) happens in
//! `peregrine::init::one_time_init`, after which the hypervisor is purely
//! reactive.

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
mod boot {
    use core::cell::UnsafeCell;
    use core::sync::atomic::AtomicU16;

    use peregrine::init;
    use peregrine::mm::PAGE_SIZE;
    use peregrine::platform::*;
    use peregrine::state::{GicMap, SystemConfig};

    /// One owner-bitmap entry per page of the managed window.
    const PAGE_COUNT: usize = (PHYS_MEM_SIZE / PAGE_SIZE as u64) as usize;
    static BITMAP: [AtomicU16; PAGE_COUNT] = [const { AtomicU16::new(0) }; PAGE_COUNT];

    /// Backing for the translation-table pool.
    #[repr(C, align(4096))]
    struct TablePool(UnsafeCell<[u8; HEAP_PAGES * PAGE_SIZE]>);
    unsafe impl Sync for TablePool {}
    static TABLE_POOL: TablePool = TablePool(UnsafeCell::new([0; HEAP_PAGES * PAGE_SIZE]));

    #[no_mangle]
    pub extern "C" fn rust_main() -> ! {
        let boot_cpu_id = peregrine::arch::read_mpidr() & 0x00ff_ffff;

        let cfg = SystemConfig {
            phys_base: PHYS_START_ADDR,
            phys_size: PHYS_MEM_SIZE,
            bitmap: &BITMAP,
            table_pool_base: TABLE_POOL.0.get() as u64,
            table_pool_pages: HEAP_PAGES,
            gic: GicMap::from_platform(),
            boot_cpu_id,
            cpu_ids: &[0x0],
        };

        let archive =
            unsafe { core::slice::from_raw_parts(INITRD_BASE as *const u8, INITRD_MAX_SIZE) };

        let state = match init::one_time_init(cfg, archive) {
            Ok(state) => state,
            Err(e) => panic!("one-time init failed: {:?}", e),
        };

        let _first = init::cpu_main(state);

        // The guest-entry stub restores `_first`'s register file and ERETs
        // into the guest; without it the boot CPU parks here.
        loop {
            unsafe { core::arch::asm!("wfe", options(nostack, nomem)) };
        }
    }

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        use core::fmt::Write;
        let mut w = peregrine::uart::writer();
        let _ = writeln!(w, "\nPANIC: {}", info);
        loop {
            unsafe { core::arch::asm!("wfe", options(nostack, nomem)) };
        }
    }
}

#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
fn main() {
    eprintln!("peregrine is a bare-metal AArch64 image; build for aarch64-unknown-none");
}
