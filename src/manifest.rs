//! System manifest parser.
//!
//! The manifest is an FDT blob (`manifest.dtb` in the boot archive) with a
//! `/hypervisor` root node, compatible `"peregrine,peregrine"`, and one
//! child per VM (`vm1`, `vm2`, ...). It is parsed once during init into
//! plain descriptors; all strings borrow from the blob, which stays mapped
//! for the hypervisor's lifetime.

use arrayvec::ArrayVec;
use uuid::Uuid;

use crate::platform::{MAX_CPUS, MAX_VCPUS, MAX_VMS};
use crate::vm::{MAX_SECURITY_SERVICES, MAX_SMCS, PRIMARY_VM_ID};

pub const COMPATIBLE: &str = "peregrine,peregrine";

/// Interrupt assignments per device region.
pub const MAX_REGION_INTERRUPTS: usize = 8;
/// Device regions per VM.
pub const MAX_DEVICE_REGIONS: usize = 16;
/// Stream ids per device region.
pub const MAX_STREAM_IDS: usize = 4;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ManifestError {
    NoHypervisorNode,
    NotCompatible,
    MalformedBlob,
    ReservedVmId,
    NoPrimaryVm,
    TooManyVms,
    MissingProperty(&'static str),
    MalformedProperty(&'static str),
    CpuCount,
}

/// One MMIO assignment from a `device-regions` grandchild.
#[derive(Clone, Debug, Default)]
pub struct DeviceRegion {
    pub base_address: u64,
    pub pages_count: u32,
    pub attributes: u32,
    /// (id, attributes) pairs.
    pub interrupts: ArrayVec<(u32, u32), MAX_REGION_INTERRUPTS>,
    pub smmu_id: Option<u32>,
    pub stream_ids: ArrayVec<u32, MAX_STREAM_IDS>,
    pub exclusive_access: bool,
}

/// IPA placement of the boot images.
#[derive(Clone, Copy, Debug)]
pub struct IpaMemoryLayout {
    pub kernel: u64,
    pub fdt: Option<u64>,
    pub ramdisk: Option<u64>,
    pub gic: Option<u64>,
}

/// Everything the loader needs to build one VM.
#[derive(Debug)]
pub struct VmManifest<'a> {
    pub id: u16,
    pub debug_name: &'a str,
    pub kernel_filename: &'a str,
    pub fdt_filename: &'a str,
    pub ramdisk_filename: Option<&'a str>,
    pub is_primary: bool,
    pub vcpu_count: u16,
    pub cpus: ArrayVec<u64, MAX_CPUS>,
    pub memory_size: u64,
    pub requires_identity_mapping: bool,
    pub smc_whitelist: ArrayVec<u32, MAX_SMCS>,
    pub smc_whitelist_permissive: bool,
    pub security_services: ArrayVec<Uuid, MAX_SECURITY_SERVICES>,
    pub boot_address: Option<u64>,
    pub ipa_layout: IpaMemoryLayout,
    pub device_regions: ArrayVec<DeviceRegion, MAX_DEVICE_REGIONS>,
}

#[derive(Debug)]
pub struct Manifest<'a> {
    pub vms: ArrayVec<VmManifest<'a>, MAX_VMS>,
}

impl<'a> Manifest<'a> {
    pub fn primary(&self) -> Option<&VmManifest<'a>> {
        self.vms.iter().find(|vm| vm.is_primary)
    }
}

fn prop_u64(node: &fdt::node::FdtNode, name: &'static str) -> Result<Option<u64>, ManifestError> {
    let Some(prop) = node.property(name) else {
        return Ok(None);
    };
    match prop.value.len() {
        8 => {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(prop.value);
            Ok(Some(u64::from_be_bytes(bytes)))
        }
        4 => {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(prop.value);
            Ok(Some(u32::from_be_bytes(bytes) as u64))
        }
        _ => Err(ManifestError::MalformedProperty(name)),
    }
}

fn prop_u64_required(node: &fdt::node::FdtNode, name: &'static str) -> Result<u64, ManifestError> {
    prop_u64(node, name)?.ok_or(ManifestError::MissingProperty(name))
}

fn prop_str<'a>(
    node: &fdt::node::FdtNode<'_, 'a>,
    name: &'static str,
) -> Result<Option<&'a str>, ManifestError> {
    let Some(prop) = node.property(name) else {
        return Ok(None);
    };
    prop.as_str()
        .map(|s| Some(s.trim_end_matches('\0')))
        .ok_or(ManifestError::MalformedProperty(name))
}

fn prop_str_required<'a>(
    node: &fdt::node::FdtNode<'_, 'a>,
    name: &'static str,
) -> Result<&'a str, ManifestError> {
    prop_str(node, name)?.ok_or(ManifestError::MissingProperty(name))
}

fn prop_bool(node: &fdt::node::FdtNode, name: &str) -> bool {
    node.property(name).is_some()
}

fn prop_u32_list<const N: usize>(
    node: &fdt::node::FdtNode,
    name: &'static str,
) -> Result<ArrayVec<u32, N>, ManifestError> {
    let mut out = ArrayVec::new();
    let Some(prop) = node.property(name) else {
        return Ok(out);
    };
    if prop.value.len() % 4 != 0 {
        return Err(ManifestError::MalformedProperty(name));
    }
    for chunk in prop.value.chunks_exact(4) {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(chunk);
        if out.try_push(u32::from_be_bytes(bytes)).is_err() {
            return Err(ManifestError::MalformedProperty(name));
        }
    }
    Ok(out)
}

/// VM ids come from the node names: `vm1` is the primary slot.
fn vm_id_from_node_name(name: &str) -> Result<u16, ManifestError> {
    let digits = name.strip_prefix("vm").ok_or(ManifestError::MalformedBlob)?;
    let id: u16 = digits
        .split('@')
        .next()
        .and_then(|d| d.parse().ok())
        .ok_or(ManifestError::MalformedBlob)?;
    if id < PRIMARY_VM_ID {
        return Err(ManifestError::ReservedVmId);
    }
    Ok(id)
}

fn parse_ipa_layout(vm_node: &fdt::node::FdtNode) -> Result<IpaMemoryLayout, ManifestError> {
    let layout = vm_node
        .children()
        .find(|c| c.name.starts_with("ipa-memory-layout"))
        .ok_or(ManifestError::MissingProperty("ipa-memory-layout"))?;

    Ok(IpaMemoryLayout {
        kernel: prop_u64_required(&layout, "kernel")?,
        fdt: prop_u64(&layout, "fdt")?,
        ramdisk: prop_u64(&layout, "ramdisk")?,
        gic: prop_u64(&layout, "gic")?,
    })
}

fn parse_device_regions(
    vm_node: &fdt::node::FdtNode,
) -> Result<ArrayVec<DeviceRegion, MAX_DEVICE_REGIONS>, ManifestError> {
    let mut out = ArrayVec::new();
    let Some(regions) = vm_node
        .children()
        .find(|c| c.name.starts_with("device-regions"))
    else {
        return Ok(out);
    };

    for region in regions.children() {
        let mut dev = DeviceRegion {
            base_address: prop_u64_required(&region, "base-address")?,
            pages_count: prop_u64_required(&region, "pages-count")? as u32,
            attributes: prop_u64(&region, "attributes")?.unwrap_or(0) as u32,
            smmu_id: prop_u64(&region, "smmu-id")?.map(|v| v as u32),
            stream_ids: prop_u32_list::<MAX_STREAM_IDS>(&region, "stream-ids")?,
            exclusive_access: prop_bool(&region, "exclusive-access"),
            ..Default::default()
        };

        let ints = prop_u32_list::<{ MAX_REGION_INTERRUPTS * 2 }>(&region, "interrupts")?;
        for pair in ints.chunks(2) {
            if pair.len() == 2 {
                let _ = dev.interrupts.try_push((pair[0], pair[1]));
            }
        }

        if out.try_push(dev).is_err() {
            return Err(ManifestError::MalformedProperty("device-regions"));
        }
    }
    Ok(out)
}

fn parse_vm<'a>(node: &fdt::node::FdtNode<'_, 'a>) -> Result<VmManifest<'a>, ManifestError> {
    let id = vm_id_from_node_name(node.name)?;
    let vcpu_count = prop_u64_required(node, "vcpu_count")? as u16;
    let mut cpus = ArrayVec::new();
    for c in prop_u32_list::<MAX_CPUS>(node, "cpus")? {
        let _ = cpus.try_push(c as u64);
    }

    if vcpu_count == 0 || vcpu_count as usize > MAX_VCPUS || (cpus.len() as u16) < vcpu_count {
        return Err(ManifestError::CpuCount);
    }

    let mut security_services = ArrayVec::new();
    if let Some(prop) = node.property("security_services") {
        // A list of NUL-separated UUID strings.
        for part in prop.value.split(|&b| b == 0) {
            if part.is_empty() {
                continue;
            }
            let s = core::str::from_utf8(part)
                .map_err(|_| ManifestError::MalformedProperty("security_services"))?;
            let uuid = Uuid::try_parse(s)
                .map_err(|_| ManifestError::MalformedProperty("security_services"))?;
            if security_services.try_push(uuid).is_err() {
                break;
            }
        }
    }

    Ok(VmManifest {
        id,
        debug_name: prop_str(node, "debug_name")?.unwrap_or(""),
        kernel_filename: prop_str_required(node, "kernel_filename")?,
        fdt_filename: prop_str_required(node, "fdt_filename")?,
        ramdisk_filename: prop_str(node, "ramdisk_filename")?.filter(|s| !s.is_empty()),
        is_primary: prop_bool(node, "is_primary"),
        vcpu_count,
        cpus,
        memory_size: prop_u64_required(node, "memory_size")?,
        requires_identity_mapping: prop_bool(node, "requires_identity_mapping"),
        smc_whitelist: prop_u32_list::<MAX_SMCS>(node, "smc_whitelist")?,
        smc_whitelist_permissive: prop_bool(node, "smc_whitelist_permissive"),
        security_services,
        boot_address: prop_u64(node, "boot_address")?,
        ipa_layout: parse_ipa_layout(node)?,
        device_regions: parse_device_regions(node)?,
    })
}

/// Parses and validates the manifest blob.
pub fn parse(blob: &[u8]) -> Result<Manifest<'_>, ManifestError> {
    let fdt = fdt::Fdt::new(blob).map_err(|_| ManifestError::MalformedBlob)?;

    let hyp = fdt
        .find_node("/hypervisor")
        .ok_or(ManifestError::NoHypervisorNode)?;

    let compatible = hyp
        .property("compatible")
        .and_then(|p| p.as_str())
        .map(|s| s.trim_end_matches('\0'))
        .ok_or(ManifestError::NotCompatible)?;
    if compatible != COMPATIBLE {
        return Err(ManifestError::NotCompatible);
    }

    let mut vms: ArrayVec<VmManifest, MAX_VMS> = ArrayVec::new();
    for child in hyp.children() {
        if !child.name.starts_with("vm") {
            continue;
        }
        let vm = parse_vm(&child)?;
        log::debug!(
            "manifest VM {} \"{}\": {} vCPUs, {:#x} bytes",
            vm.id,
            vm.debug_name,
            vm.vcpu_count,
            vm.memory_size
        );
        if vms.try_push(vm).is_err() {
            return Err(ManifestError::TooManyVms);
        }
    }

    // Exactly one primary, and the id space must be dense from the
    // primary id so arena indices line up.
    if vms.iter().filter(|vm| vm.is_primary).count() != 1 {
        return Err(ManifestError::NoPrimaryVm);
    }
    let mut seen = [false; MAX_VMS + 1];
    for vm in &vms {
        let idx = (vm.id - PRIMARY_VM_ID) as usize;
        if idx >= vms.len() || seen[idx] {
            return Err(ManifestError::ReservedVmId);
        }
        seen[idx] = true;
    }

    Ok(Manifest { vms })
}
