//! VM image placement.
//!
//! For each manifest entry: pull the kernel, device tree and optional
//! ramdisk out of the boot archive, allocate their backing pages at the
//! configured IPAs, copy the images into place, then fill the rest of the
//! VM's memory window with free RAM mappings (split allocations allowed;
//! free RAM has no contiguity requirement). Finally the vGIC shadow is
//! allocated and the manifest's device regions are applied.

use crate::addr::{round_up_to_page, Ipaddr, Paddr};
use crate::cpio;
use crate::manifest::VmManifest;
use crate::mm::pma::{PmaError, ALIGN_AUTO, HYPERVISOR_OWNER};
use crate::mm::{Mode, PAGE_SIZE};
use crate::state::SystemState;
use crate::vgic::VirtGic;
use crate::vm::{InterruptDescriptor, Vm};

/// Recursion depth for split allocations of free RAM.
const FREERAM_MAX_SPLITS: u8 = 4;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LoadError {
    MissingFile,
    Pma(PmaError),
    LayoutOverlap,
    NoVgicMemory,
    #[cfg(feature = "measured_boot")]
    MissingSignature,
}

impl From<PmaError> for LoadError {
    fn from(e: PmaError) -> Self {
        LoadError::Pma(e)
    }
}

/// One placed image: where it sits in the guest and how many bytes the
/// file occupied.
struct PlacedImage {
    ipa: u64,
    size: usize,
}

/// Allocates backing for `data` in the VM's stage-2 and copies the image
/// into it. `ipa` of `None` requests an identity placement (IPA == PA);
/// the returned span records where the image actually sits in the guest.
fn place_image(
    state: &SystemState,
    vm: &Vm,
    ipa: Option<u64>,
    data: &[u8],
    mode: Mode,
) -> Result<PlacedImage, LoadError> {
    let size = round_up_to_page(data.len() as u64) as usize;
    let mut inner = vm.lock();
    let ptable = inner.ptable.as_mut().expect("VM has a stage-2 table");

    let pa = state.pma.aligned_alloc(
        ptable,
        ipa.map(Ipaddr::new),
        size,
        ALIGN_AUTO,
        mode,
        vm.id() as u8,
        &state.ppool,
    )?;

    // The hypervisor runs identity-mapped over the whole window, so the
    // chunk is directly addressable for the copy.
    unsafe {
        core::ptr::copy_nonoverlapping(data.as_ptr(), pa as *mut u8, data.len());
        core::ptr::write_bytes((pa as usize + data.len()) as *mut u8, 0, size - data.len());
    }

    Ok(PlacedImage {
        ipa: ipa.unwrap_or(pa),
        size,
    })
}

/// Maps every gap of `[mem_begin, mem_end)` not taken by an image as free
/// RAM. Contiguity of the backing does not matter here, so failed
/// allocations retry in halves.
fn map_freeram(
    state: &SystemState,
    vm: &Vm,
    mem_begin: u64,
    mem_end: u64,
    images: &[&PlacedImage],
) -> Result<(), LoadError> {
    let mut inner = vm.lock();
    let ptable = inner.ptable.as_mut().expect("VM has a stage-2 table");

    // Walk the window low to high, hopping over the placed images.
    let mut cursor = mem_begin;
    while cursor < mem_end {
        let mut gap_end = mem_end;
        let mut hop = None;
        for img in images {
            let begin = img.ipa;
            let end = img.ipa + img.size as u64;
            if cursor >= begin && cursor < end {
                hop = Some(end);
                break;
            }
            if begin > cursor && begin < gap_end {
                gap_end = begin;
            }
        }
        if let Some(next) = hop {
            cursor = next;
            continue;
        }
        if gap_end > cursor {
            state.pma.aligned_alloc_with_split(
                ptable,
                Some(Ipaddr::new(cursor)),
                (gap_end - cursor) as usize,
                ALIGN_AUTO,
                Mode::R | Mode::W | Mode::X,
                vm.id() as u8,
                &state.ppool,
                FREERAM_MAX_SPLITS,
            )?;
        }
        cursor = gap_end;
    }
    Ok(())
}

/// Builds the per-VM GIC shadow and records it on the VM.
fn setup_vgic(state: &SystemState, vm: &Vm, gic_ipa: u64) -> Result<(), LoadError> {
    let size = VirtGic::region_size(&state.gic, vm.vcpu_count() as u32);
    let base = state
        .hypervisor_alloc(size, Mode::R | Mode::W)
        .map_err(|_| LoadError::NoVgicMemory)?;

    let vgic = VirtGic::new(base, gic_ipa, &state.gic, vm.vcpu_count() as u32);
    vm.lock().vgic = Some(vgic);
    Ok(())
}

/// Applies the manifest's device regions: exclusive MMIO ranges map
/// straight into the VM's stage-2, and every listed interrupt is recorded
/// as owned by the VM and routed to its boot CPU.
fn apply_device_regions(
    state: &SystemState,
    vm: &Vm,
    manifest: &VmManifest,
) -> Result<(), LoadError> {
    for region in &manifest.device_regions {
        if region.exclusive_access {
            let begin = Paddr::new(region.base_address);
            let end = begin.add(region.pages_count as u64 * PAGE_SIZE as u64);
            let mut inner = vm.lock();
            let ptable = inner.ptable.as_mut().expect("VM has a stage-2 table");
            ptable
                .map(
                    begin,
                    end,
                    Ipaddr::new(begin.addr()),
                    Mode::R | Mode::W | Mode::D,
                    &state.ppool,
                )
                .map_err(|_| LoadError::Pma(PmaError::MapFailed))?;
        }

        let boot_cpu = vm.config().cpus[0];
        {
            let mut inner = vm.lock();
            for &(id, attributes) in &region.interrupts {
                if inner
                    .interrupt_desc
                    .try_push(InterruptDescriptor {
                        interrupt_id: id,
                        attributes,
                    })
                    .is_err()
                {
                    log::warn!("too many interrupt descriptors for VM {:#x}", vm.id());
                    break;
                }
                state.interrupts.set_owner(id, vm.id());
            }
        }
        let _vgic = state.vgic_lock.lock();
        for &(id, _) in &region.interrupts {
            crate::vgic::route_intid_to_cpu(state, id, boot_cpu, vm.id());
        }
    }
    Ok(())
}

/// Loads one VM's images and wires up its memory map. The first vCPU is
/// programmed to enter at the configured boot address with the device
/// tree's IPA in x0, and the VM joins the boot list.
pub fn load_vm(
    state: &SystemState,
    vm: &Vm,
    manifest: &VmManifest,
    archive: &[u8],
) -> Result<(), LoadError> {
    #[cfg(feature = "measured_boot")]
    if cpio::find_file(archive, "manifest_signature.sig").is_none() {
        return Err(LoadError::MissingSignature);
    }

    let kernel = cpio::find_file(archive, manifest.kernel_filename).ok_or(LoadError::MissingFile)?;
    let fdt_blob = cpio::find_file(archive, manifest.fdt_filename).ok_or(LoadError::MissingFile)?;
    let ramdisk = match manifest.ramdisk_filename {
        Some(name) => Some(cpio::find_file(archive, name).ok_or(LoadError::MissingFile)?),
        None => None,
    };

    let layout = &manifest.ipa_layout;
    let identity = manifest.requires_identity_mapping;

    // Identity VMs take their placements from wherever the allocator puts
    // the backing; everyone else gets the manifest's IPAs, with the fdt
    // and ramdisk trailing the kernel when the manifest is silent.
    let fdt_ipa = layout
        .fdt
        .unwrap_or(layout.kernel + round_up_to_page(kernel.len() as u64));
    let ramdisk_ipa = layout
        .ramdisk
        .unwrap_or(fdt_ipa + round_up_to_page(fdt_blob.len() as u64));

    let kernel_img = place_image(
        state,
        vm,
        (!identity).then_some(layout.kernel),
        kernel,
        Mode::R | Mode::W | Mode::X,
    )?;
    let fdt_img = place_image(
        state,
        vm,
        (!identity).then_some(fdt_ipa),
        fdt_blob,
        Mode::R | Mode::W,
    )?;
    let ramdisk_img = match ramdisk {
        Some(data) => Some(place_image(
            state,
            vm,
            (!identity).then_some(ramdisk_ipa),
            data,
            Mode::R | Mode::W,
        )?),
        None => None,
    };

    let mut images: arrayvec::ArrayVec<&PlacedImage, 3> = arrayvec::ArrayVec::new();
    images.push(&kernel_img);
    images.push(&fdt_img);
    if let Some(r) = ramdisk_img.as_ref() {
        images.push(r);
    }

    // Overlapping placements would double-map; refuse them.
    for (i, a) in images.iter().enumerate() {
        for b in images.iter().skip(i + 1) {
            let a_end = a.ipa + a.size as u64;
            let b_end = b.ipa + b.size as u64;
            if a.ipa < b_end && b.ipa < a_end {
                return Err(LoadError::LayoutOverlap);
            }
        }
    }

    if identity {
        // The rest of the VM's memory is identity-allocated wherever it
        // fits; contiguity does not matter for free RAM.
        let used: usize = images.iter().map(|i| i.size).sum();
        let remaining = manifest.memory_size as usize - core::cmp::min(used, manifest.memory_size as usize);
        if remaining > 0 {
            let mut inner = vm.lock();
            let ptable = inner.ptable.as_mut().expect("VM has a stage-2 table");
            state.pma.aligned_alloc_with_split(
                ptable,
                None,
                remaining,
                ALIGN_AUTO,
                Mode::R | Mode::W | Mode::X,
                vm.id() as u8,
                &state.ppool,
                FREERAM_MAX_SPLITS,
            )?;
        }
    } else {
        let mem_begin = layout.kernel;
        let mem_end = mem_begin + manifest.memory_size;
        map_freeram(state, vm, mem_begin, mem_end, &images)?;
    }

    let gic_ipa = layout.gic.unwrap_or(state.gic.gicd_base);
    setup_vgic(state, vm, gic_ipa)?;
    apply_device_regions(state, vm, manifest)?;

    // Boot register state: entry point in pc, device tree address in x0.
    let entry = manifest.boot_address.unwrap_or(kernel_img.ipa);
    if let Some(vcpu) = vm.vcpu(0) {
        let mut g = vcpu.lock();
        vcpu.on(&mut g, Ipaddr::new(entry), fdt_img.ipa);
    }

    state.vm_update_boot(vm);
    log::info!(
        "loaded VM {:#x} \"{}\": kernel {:#x}+{:#x}, fdt {:#x}, entry {:#x}",
        vm.id(),
        manifest.debug_name,
        kernel_img.ipa,
        kernel_img.size,
        fdt_img.ipa,
        entry
    );
    Ok(())
}
