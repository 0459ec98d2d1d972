//! Shared test fixtures: an arena-backed system state, a minimal FDT
//! writer for manifests, and boot-archive assembly.
#![allow(dead_code)]

use core::sync::atomic::AtomicU16;

use peregrine::cpio;
use peregrine::mm::PAGE_SIZE;
use peregrine::state::{GicMap, SystemConfig, SystemState};

/// Leaks a page-aligned arena and returns its base address.
pub fn arena(pages: usize) -> u64 {
    let v = vec![0u8; (pages + 1) * PAGE_SIZE];
    let base = Box::leak(v.into_boxed_slice()).as_ptr() as u64;
    (base + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
}

/// A GIC register file backed by ordinary memory, so the write-through
/// and routing paths are observable.
pub fn fake_gic() -> GicMap {
    let base = arena(0x160);
    GicMap {
        gicd_base: base,
        gicd_size: 0x1_0000,
        gits_base: base + 0x1_0000,
        gits_size: 0x2_0000,
        gicr_base: base + 0x3_0000,
        gicr_frame_size: 0x2_0000,
    }
}

pub const TEST_CPUS: [u64; 4] = [0x0, 0x1, 0x2, 0x3];

/// Builds a full system state over fresh arenas. `window_pages` is the
/// size of the managed RAM window.
pub fn make_state(window_pages: usize) -> &'static SystemState {
    let bitmap: &'static [AtomicU16] = Box::leak(
        (0..window_pages)
            .map(|_| AtomicU16::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice(),
    );
    let pool_pages = 128;

    let cfg = SystemConfig {
        phys_base: arena(window_pages),
        phys_size: (window_pages * PAGE_SIZE) as u64,
        bitmap,
        table_pool_base: arena(pool_pages),
        table_pool_pages: pool_pages,
        gic: fake_gic(),
        boot_cpu_id: 0x0,
        cpu_ids: Box::leak(Box::new(TEST_CPUS)),
    };

    Box::leak(Box::new(SystemState::create(cfg).expect("state")))
}

// ── flattened device tree writer ────────────────────────────────────

const FDT_BEGIN_NODE: u32 = 1;
const FDT_END_NODE: u32 = 2;
const FDT_PROP: u32 = 3;
const FDT_END: u32 = 9;

pub struct FdtBuilder {
    structure: Vec<u8>,
    strings: Vec<u8>,
}

impl FdtBuilder {
    /// Starts the blob with the (unnamed) root node open.
    pub fn new() -> Self {
        let mut b = Self {
            structure: Vec::new(),
            strings: Vec::new(),
        };
        b.begin_node("");
        b
    }

    fn push_u32(&mut self, v: u32) {
        self.structure.extend_from_slice(&v.to_be_bytes());
    }

    fn pad4(&mut self) {
        while self.structure.len() % 4 != 0 {
            self.structure.push(0);
        }
    }

    fn string_off(&mut self, name: &str) -> u32 {
        let off = self.strings.len() as u32;
        self.strings.extend_from_slice(name.as_bytes());
        self.strings.push(0);
        off
    }

    pub fn begin_node(&mut self, name: &str) {
        self.push_u32(FDT_BEGIN_NODE);
        self.structure.extend_from_slice(name.as_bytes());
        self.structure.push(0);
        self.pad4();
    }

    pub fn end_node(&mut self) {
        self.push_u32(FDT_END_NODE);
    }

    pub fn prop(&mut self, name: &str, data: &[u8]) {
        let name_off = self.string_off(name);
        self.push_u32(FDT_PROP);
        self.push_u32(data.len() as u32);
        self.push_u32(name_off);
        self.structure.extend_from_slice(data);
        self.pad4();
    }

    pub fn prop_u32(&mut self, name: &str, v: u32) {
        self.prop(name, &v.to_be_bytes());
    }

    pub fn prop_u64(&mut self, name: &str, v: u64) {
        self.prop(name, &v.to_be_bytes());
    }

    pub fn prop_str(&mut self, name: &str, v: &str) {
        let mut data = v.as_bytes().to_vec();
        data.push(0);
        self.prop(name, &data);
    }

    pub fn prop_empty(&mut self, name: &str) {
        self.prop(name, &[]);
    }

    pub fn prop_u32_list(&mut self, name: &str, vs: &[u32]) {
        let mut data = Vec::new();
        for v in vs {
            data.extend_from_slice(&v.to_be_bytes());
        }
        self.prop(name, &data);
    }

    /// Closes the root node and assembles the final blob.
    pub fn finish(mut self) -> Vec<u8> {
        self.end_node();
        self.push_u32(FDT_END);

        const HEADER_LEN: usize = 40;
        const RSVMAP_LEN: usize = 16; // one terminating (0, 0) entry

        let off_struct = HEADER_LEN + RSVMAP_LEN;
        let off_strings = off_struct + self.structure.len();
        let total = off_strings + self.strings.len();

        let mut out = Vec::with_capacity(total);
        for v in [
            0xd00d_feed_u32,
            total as u32,
            off_struct as u32,
            off_strings as u32,
            HEADER_LEN as u32,
            17, // version
            16, // last compatible version
            0,  // boot cpu
            self.strings.len() as u32,
            self.structure.len() as u32,
        ] {
            out.extend_from_slice(&v.to_be_bytes());
        }
        out.extend_from_slice(&[0u8; RSVMAP_LEN]);
        out.extend_from_slice(&self.structure);
        out.extend_from_slice(&self.strings);
        out
    }
}

// ── manifest + archive assembly ─────────────────────────────────────

pub struct TestVm {
    pub id: u16,
    pub name: &'static str,
    pub is_primary: bool,
    pub vcpu_count: u16,
    pub cpus: Vec<u32>,
    pub memory_size: u64,
    pub kernel_ipa: u64,
    pub boot_address: Option<u64>,
    pub gic_ipa: Option<u64>,
    pub smc_whitelist: Vec<u32>,
    pub smc_whitelist_permissive: bool,
    pub interrupts: Vec<(u32, u32)>,
}

impl TestVm {
    pub fn primary() -> Self {
        Self {
            id: 1,
            name: "primary",
            is_primary: true,
            vcpu_count: 1,
            cpus: vec![0x0],
            memory_size: 0x10_0000,
            kernel_ipa: 0x1000_0000,
            boot_address: None,
            gic_ipa: None,
            smc_whitelist: Vec::new(),
            smc_whitelist_permissive: false,
            interrupts: Vec::new(),
        }
    }

    pub fn secondary(id: u16) -> Self {
        Self {
            id,
            name: "secondary",
            is_primary: false,
            vcpu_count: 1,
            cpus: vec![id as u32 - 1],
            memory_size: 0x8_0000,
            kernel_ipa: 0x2000_0000 + (id as u64) * 0x100_0000,
            boot_address: None,
            gic_ipa: None,
            smc_whitelist: Vec::new(),
            smc_whitelist_permissive: false,
            interrupts: Vec::new(),
        }
    }
}

/// Builds a manifest blob describing `vms`.
pub fn build_manifest(vms: &[TestVm]) -> Vec<u8> {
    let mut b = FdtBuilder::new();
    b.begin_node("hypervisor");
    b.prop_str("compatible", "peregrine,peregrine");

    for vm in vms {
        let mut node_name = String::from("vm");
        node_name.push_str(&vm.id.to_string());
        b.begin_node(&node_name);

        b.prop_str("debug_name", vm.name);
        b.prop_str("kernel_filename", &format!("{}_kernel", vm.name));
        b.prop_str("fdt_filename", &format!("{}_fdt", vm.name));
        if vm.is_primary {
            b.prop_empty("is_primary");
        }
        b.prop_u32("vcpu_count", vm.vcpu_count as u32);
        b.prop_u32_list("cpus", &vm.cpus);
        b.prop_u64("memory_size", vm.memory_size);
        if !vm.smc_whitelist.is_empty() {
            b.prop_u32_list("smc_whitelist", &vm.smc_whitelist);
        }
        if vm.smc_whitelist_permissive {
            b.prop_empty("smc_whitelist_permissive");
        }
        if let Some(addr) = vm.boot_address {
            b.prop_u64("boot_address", addr);
        }

        b.begin_node("ipa-memory-layout");
        b.prop_u64("kernel", vm.kernel_ipa);
        if let Some(gic) = vm.gic_ipa {
            b.prop_u64("gic", gic);
        }
        b.end_node();

        if !vm.interrupts.is_empty() {
            b.begin_node("device-regions");
            b.begin_node("dev0");
            b.prop_u64("base-address", 0x6000_0000);
            b.prop_u32("pages-count", 1);
            b.prop_u32("attributes", 3);
            b.prop_empty("exclusive-access");
            let flat: Vec<u32> = vm
                .interrupts
                .iter()
                .flat_map(|&(a, b)| [a, b])
                .collect();
            b.prop_u32_list("interrupts", &flat);
            b.end_node();
            b.end_node();
        }

        b.end_node();
    }

    b.end_node();
    b.finish()
}

/// Assembles a boot archive with the manifest and dummy images for each
/// VM.
pub fn build_archive(vms: &[TestVm]) -> Vec<u8> {
    let manifest = build_manifest(vms);
    let mut files: Vec<(String, Vec<u8>)> = vec![("manifest.dtb".into(), manifest)];
    for vm in vms {
        // A page of recognizable kernel bytes and a small fdt.
        files.push((format!("{}_kernel", vm.name), vec![0xAB; 4096]));
        files.push((format!("{}_fdt", vm.name), vec![0xCD; 1024]));
    }

    let refs: Vec<(&str, &[u8])> = files
        .iter()
        .map(|(n, d)| (n.as_str(), d.as_slice()))
        .collect();
    let mut buf = vec![0u8; 64 * 1024];
    let len = cpio::write_archive(&mut buf, &refs).expect("archive fits");
    buf.truncate(len);
    buf
}
