//! Manifest parsing and validation.

mod common;

use common::{FdtBuilder, TestVm};
use peregrine::manifest::{self, ManifestError};

#[test]
fn parses_a_two_vm_manifest() {
    let mut primary = TestVm::primary();
    primary.boot_address = Some(0x4000_0000);
    primary.smc_whitelist = vec![0x8400_0000, 0xC200_0042];
    primary.gic_ipa = Some(0x0800_0000);
    let mut secondary = TestVm::secondary(2);
    secondary.vcpu_count = 1;
    secondary.interrupts = vec![(72, 0x3), (73, 0x1)];
    secondary.smc_whitelist_permissive = true;

    let blob = common::build_manifest(&[primary, secondary]);
    let parsed = manifest::parse(&blob).expect("valid manifest");

    assert_eq!(parsed.vms.len(), 2);
    let p = parsed.primary().expect("primary present");
    assert_eq!(p.id, 1);
    assert_eq!(p.debug_name, "primary");
    assert_eq!(p.kernel_filename, "primary_kernel");
    assert_eq!(p.fdt_filename, "primary_fdt");
    assert!(p.ramdisk_filename.is_none());
    assert_eq!(p.vcpu_count, 1);
    assert_eq!(p.cpus.as_slice(), &[0x0]);
    assert_eq!(p.memory_size, 0x10_0000);
    assert_eq!(p.boot_address, Some(0x4000_0000));
    assert_eq!(p.ipa_layout.kernel, 0x1000_0000);
    assert_eq!(p.ipa_layout.gic, Some(0x0800_0000));
    assert_eq!(p.smc_whitelist.as_slice(), &[0x8400_0000, 0xC200_0042]);
    assert!(!p.smc_whitelist_permissive);

    let s = &parsed.vms[1];
    assert_eq!(s.id, 2);
    assert!(!s.is_primary);
    assert!(s.smc_whitelist_permissive);
    assert_eq!(s.device_regions.len(), 1);
    let region = &s.device_regions[0];
    assert_eq!(region.base_address, 0x6000_0000);
    assert_eq!(region.pages_count, 1);
    assert!(region.exclusive_access);
    assert_eq!(region.interrupts.as_slice(), &[(72, 0x3), (73, 0x1)]);
}

#[test]
fn rejects_wrong_compatible() {
    let mut b = FdtBuilder::new();
    b.begin_node("hypervisor");
    b.prop_str("compatible", "someone,else");
    b.end_node();
    let blob = b.finish();

    assert_eq!(
        manifest::parse(&blob).unwrap_err(),
        ManifestError::NotCompatible
    );
}

#[test]
fn rejects_missing_hypervisor_node() {
    let mut b = FdtBuilder::new();
    b.begin_node("chosen");
    b.end_node();
    let blob = b.finish();

    assert_eq!(
        manifest::parse(&blob).unwrap_err(),
        ManifestError::NoHypervisorNode
    );
}

#[test]
fn rejects_reserved_vm_ids() {
    let mut vm = TestVm::primary();
    vm.id = 0; // the hypervisor's own id
    let blob = common::build_manifest(&[vm]);
    assert_eq!(
        manifest::parse(&blob).unwrap_err(),
        ManifestError::ReservedVmId
    );
}

#[test]
fn rejects_sparse_vm_ids() {
    let primary = TestVm::primary();
    let mut other = TestVm::secondary(4); // gap: no vm2/vm3
    other.cpus = vec![1];
    let blob = common::build_manifest(&[primary, other]);
    assert_eq!(
        manifest::parse(&blob).unwrap_err(),
        ManifestError::ReservedVmId
    );
}

#[test]
fn requires_exactly_one_primary() {
    let mut a = TestVm::primary();
    a.is_primary = false;
    let blob = common::build_manifest(&[a]);
    assert_eq!(
        manifest::parse(&blob).unwrap_err(),
        ManifestError::NoPrimaryVm
    );

    let a = TestVm::primary();
    let mut b = TestVm::secondary(2);
    b.is_primary = true;
    let blob = common::build_manifest(&[a, b]);
    assert_eq!(
        manifest::parse(&blob).unwrap_err(),
        ManifestError::NoPrimaryVm
    );
}

#[test]
fn requires_enough_cpus_for_the_vcpus() {
    let mut vm = TestVm::primary();
    vm.vcpu_count = 2;
    vm.cpus = vec![0]; // one CPU for two vCPUs
    let blob = common::build_manifest(&[vm]);
    assert_eq!(manifest::parse(&blob).unwrap_err(), ManifestError::CpuCount);
}

#[test]
fn requires_the_kernel_placement() {
    let mut b = FdtBuilder::new();
    b.begin_node("hypervisor");
    b.prop_str("compatible", "peregrine,peregrine");
    b.begin_node("vm1");
    b.prop_str("kernel_filename", "k");
    b.prop_str("fdt_filename", "f");
    b.prop_empty("is_primary");
    b.prop_u32("vcpu_count", 1);
    b.prop_u32_list("cpus", &[0]);
    b.prop_u64("memory_size", 0x10000);
    // No ipa-memory-layout node at all.
    b.end_node();
    b.end_node();
    let blob = b.finish();

    assert_eq!(
        manifest::parse(&blob).unwrap_err(),
        ManifestError::MissingProperty("ipa-memory-layout")
    );
}
