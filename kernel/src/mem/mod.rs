//! Memory objects and address spaces
//!
//! ## Components
//!
//! - [`Pmo`]: physical memory object, the backing store for mappings
//! - [`VmSpace`]: a page table root plus the regions mapped into it
//! - The length-checked user-copy boundary (`copy_from_user` /
//!   `copy_to_user`) used by IPC staging and the recycle ring
//!
//! Page tables themselves belong to the platform's [`Mmu`](crate::platform::Mmu);
//! the vmspace only records what was mapped so user copies can be checked.

mod pmo;

pub use pmo::{Pmo, PmoKind};

use crate::cap::{CapRights, VMSPACE_SLOT};
use crate::error::{KResult, KernelError};
use crate::object::{Object, ObjectBody, ObjectType};
use crate::platform::PhysAddr;
use crate::sync::MemoryLock;
use crate::{CpuId, Kernel};
use bitflags::bitflags;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Page size constants
pub const PAGE_SIZE: usize = 4096;

/// Round `len` up to a whole number of pages.
pub const fn page_align_up(len: usize) -> usize {
    (len + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

pub const fn is_page_aligned(value: u64) -> bool {
    value & (PAGE_SIZE as u64 - 1) == 0
}

bitflags! {
    /// Mapping permissions
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VmPerm: u64 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

impl VmPerm {
    /// The capability rights needed to map with these permissions.
    pub fn as_rights(self) -> CapRights {
        CapRights::from_bits_truncate(self.bits())
    }
}

/// A user buffer: start address and length in the caller's vmspace
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct UserBuf {
    pub va: u64,
    pub len: usize,
}

impl UserBuf {
    pub const fn new(va: u64, len: usize) -> Self {
        Self { va, len }
    }

    pub const fn empty() -> Self {
        Self { va: 0, len: 0 }
    }
}

/// A mapped range of a PMO
pub struct VmRegion {
    pub start: u64,
    pub len: usize,
    pub perm: VmPerm,
    /// Holds one reference for the lifetime of the mapping
    pub pmo: Arc<Object>,
    /// Offset into the PMO
    pub offset: usize,
}

impl VmRegion {
    fn end(&self) -> u64 {
        self.start + self.len as u64
    }
}

/// Address space
pub struct VmSpace {
    pgtbl: PhysAddr,
    regions: MemoryLock<BTreeMap<u64, VmRegion>>,
}

impl VmSpace {
    /// Root of this space's page table.
    pub fn pgtbl(&self) -> PhysAddr {
        self.pgtbl
    }

    pub fn region_count(&self) -> usize {
        self.regions.read().len()
    }

    /// Is `[va, va + len)` covered by mappings allowing `perm`?
    pub fn check_access(&self, va: u64, len: usize, perm: VmPerm) -> KResult<()> {
        self.walk(va, len, perm, |_, _, _| Ok(()))
    }

    /// Copy `len` bytes out of user memory. Needs `READ` on every byte.
    pub fn copy_from_user(&self, va: u64, len: usize) -> KResult<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        self.walk(va, len, VmPerm::READ, |pmo, offset, n| {
            let data = pmo.data.read();
            out.extend_from_slice(&data[offset..offset + n]);
            Ok(())
        })?;
        Ok(out)
    }

    /// Copy `bytes` into user memory. Needs `WRITE` on every byte.
    ///
    /// The whole range is checked before anything is written.
    pub fn copy_to_user(&self, va: u64, bytes: &[u8]) -> KResult<()> {
        self.check_access(va, bytes.len(), VmPerm::WRITE)?;
        let mut copied = 0usize;
        self.walk(va, bytes.len(), VmPerm::WRITE, |pmo, offset, n| {
            let mut data = pmo.data.write();
            data[offset..offset + n].copy_from_slice(&bytes[copied..copied + n]);
            copied += n;
            Ok(())
        })
    }

    /// Visit the PMO pieces backing `[va, va + len)` in address order.
    fn walk<F>(&self, va: u64, len: usize, perm: VmPerm, mut visit: F) -> KResult<()>
    where
        F: FnMut(&Pmo, usize, usize) -> KResult<()>,
    {
        let end = va.checked_add(len as u64).ok_or(KernelError::BadAddress)?;
        let regions = self.regions.read();
        let mut cursor = va;
        while cursor < end {
            let region = regions
                .range(..=cursor)
                .next_back()
                .map(|(_, r)| r)
                .filter(|r| cursor < r.end())
                .ok_or(KernelError::BadAddress)?;
            if !region.perm.contains(perm) {
                return Err(KernelError::BadAddress);
            }
            let pmo = region.pmo.as_pmo().ok_or(KernelError::BadAddress)?;
            let n = (end.min(region.end()) - cursor) as usize;
            let offset = region.offset + (cursor - region.start) as usize;
            if offset + n > pmo.size() {
                return Err(KernelError::BadAddress);
            }
            visit(pmo, offset, n)?;
            cursor += n as u64;
        }
        Ok(())
    }
}

impl Kernel {
    /// Allocate a vmspace with a fresh page-table root.
    pub(crate) fn new_vmspace(&self) -> KResult<Arc<Object>> {
        let pgtbl = self.platform.get_pages(0)?;
        let body = ObjectBody::VmSpace(VmSpace {
            pgtbl,
            regions: MemoryLock::new(BTreeMap::new(), "vmspace_regions"),
        });
        self.obj_alloc(body).inspect_err(|_| self.platform.free_pages(pgtbl, 0))
    }

    /// The vmspace held in slot 1 of `group`.
    pub fn group_vmspace(&self, group: &Arc<Object>) -> KResult<Arc<Object>> {
        let guard = self.obj_get(group, VMSPACE_SLOT, ObjectType::VmSpace)?;
        Ok(guard.arc().clone())
    }

    /// Map `len` bytes of a PMO at `addr` in the target group's vmspace.
    pub fn sys_map_pmo(
        &self,
        cpu: CpuId,
        target_group_cap: crate::cap::Cap,
        pmo_cap: crate::cap::Cap,
        addr: u64,
        perm: VmPerm,
        len: usize,
    ) -> KResult<()> {
        let (_, current) = self.current_group(cpu)?;
        let target = self.obj_get(&current, target_group_cap, ObjectType::CapGroup)?;
        let (pmo_obj, rights) = self.obj_get_with_rights(&current, pmo_cap, ObjectType::Pmo)?;
        rights.require(perm.as_rights())?;

        if !is_page_aligned(addr) || len == 0 || len % PAGE_SIZE != 0 {
            return Err(KernelError::InvalidArgument);
        }
        let pmo = pmo_obj.as_pmo().ok_or(KernelError::BadCapability)?;
        if len > page_align_up(pmo.size()) {
            return Err(KernelError::InvalidArgument);
        }
        let end = addr.checked_add(len as u64).ok_or(KernelError::InvalidArgument)?;

        let vm_obj = self.group_vmspace(target.arc())?;
        let vmspace = vm_obj.as_vmspace().ok_or(KernelError::BadCapability)?;
        let mut regions = vmspace.regions.write();
        let overlaps = regions
            .range(..end)
            .next_back()
            .is_some_and(|(_, r)| r.end() > addr);
        if overlaps {
            return Err(KernelError::InvalidArgument);
        }

        let pa = pmo.phys_base().unwrap_or(PhysAddr(0));
        self.platform.map_range(vmspace.pgtbl, addr, pa, len, perm)?;
        self.platform.flush_tlb_by_range(vmspace.pgtbl, addr, len);

        self.obj_ref(pmo_obj.arc());
        regions.insert(
            addr,
            VmRegion {
                start: addr,
                len,
                perm,
                pmo: pmo_obj.arc().clone(),
                offset: 0,
            },
        );
        log::trace!("map {:?} at {:#x}+{:#x} {:?}", pmo_obj.id(), addr, len, perm);
        Ok(())
    }

    /// Remove the mapping of `pmo_cap` that starts at `addr`.
    pub fn sys_unmap_pmo(
        &self,
        cpu: CpuId,
        target_group_cap: crate::cap::Cap,
        pmo_cap: crate::cap::Cap,
        addr: u64,
    ) -> KResult<()> {
        let (_, current) = self.current_group(cpu)?;
        let target = self.obj_get(&current, target_group_cap, ObjectType::CapGroup)?;
        let pmo = self.obj_get(&current, pmo_cap, ObjectType::Pmo)?;
        let vm_obj = self.group_vmspace(target.arc())?;
        let vmspace = vm_obj.as_vmspace().ok_or(KernelError::BadCapability)?;

        let region = {
            let mut regions = vmspace.regions.write();
            match regions.get(&addr) {
                Some(r) if Arc::ptr_eq(&r.pmo, pmo.arc()) => regions.remove(&addr),
                _ => None,
            }
        }
        .ok_or(KernelError::InvalidArgument)?;

        self.platform.unmap_range(vmspace.pgtbl, region.start, region.len);
        self.platform.flush_tlb_by_range(vmspace.pgtbl, region.start, region.len);
        self.obj_put(&region.pmo);
        Ok(())
    }

    pub(crate) fn vmspace_deinit(&self, vmspace: &VmSpace) {
        let regions = core::mem::take(&mut *vmspace.regions.write());
        for region in regions.into_values() {
            self.platform.unmap_range(vmspace.pgtbl, region.start, region.len);
            self.obj_put(&region.pmo);
        }
        self.platform.free_pages(vmspace.pgtbl, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cap::CAP_GROUP_SLOT;
    use crate::testutil::boot;

    const RW: VmPerm = VmPerm::READ.union(VmPerm::WRITE);

    #[test]
    fn test_map_and_copy() {
        let (kernel, root) = boot(1);
        let pmo = kernel
            .sys_create_pmo(0, 2 * PAGE_SIZE, PmoKind::Anonymous, CapRights::ALL)
            .unwrap();
        kernel
            .sys_map_pmo(0, CAP_GROUP_SLOT, pmo, 0x10000, RW, 2 * PAGE_SIZE)
            .unwrap();
        let vm = kernel.group_vmspace(&root.group).unwrap();
        let vmspace = vm.as_vmspace().unwrap();

        // Crosses the page boundary inside one region.
        let va = 0x10000 + PAGE_SIZE as u64 - 2;
        vmspace.copy_to_user(va, &[1, 2, 3, 4]).unwrap();
        assert_eq!(vmspace.copy_from_user(va, 4).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(vmspace.copy_from_user(0x10000, 1).unwrap(), vec![0]);

        let record = root.plat.record();
        assert_eq!(record.mappings.len(), 1);
        assert_eq!(record.tlb_flushes, 1);
    }

    #[test]
    fn test_copy_outside_mapping_is_bad_address() {
        let (kernel, root) = boot(1);
        let pmo = kernel
            .sys_create_pmo(0, PAGE_SIZE, PmoKind::Anonymous, CapRights::ALL)
            .unwrap();
        kernel
            .sys_map_pmo(0, CAP_GROUP_SLOT, pmo, 0x20000, VmPerm::READ, PAGE_SIZE)
            .unwrap();
        let vm = kernel.group_vmspace(&root.group).unwrap();
        let vmspace = vm.as_vmspace().unwrap();
        let end = 0x20000 + PAGE_SIZE as u64;
        assert_eq!(vmspace.copy_from_user(end - 1, 2), Err(KernelError::BadAddress));
        assert_eq!(vmspace.copy_to_user(0x20000, &[1]), Err(KernelError::BadAddress));
        assert_eq!(vmspace.copy_from_user(0x1000, 1), Err(KernelError::BadAddress));
    }

    #[test]
    fn test_map_rules() {
        let (kernel, _root) = boot(1);
        let ro = kernel
            .sys_create_pmo(0, PAGE_SIZE, PmoKind::Anonymous, CapRights::READ)
            .unwrap();
        assert_eq!(
            kernel.sys_map_pmo(0, CAP_GROUP_SLOT, ro, 0x1000, RW, PAGE_SIZE),
            Err(KernelError::PermissionDenied)
        );
        assert_eq!(
            kernel.sys_map_pmo(0, CAP_GROUP_SLOT, ro, 0x1001, VmPerm::READ, PAGE_SIZE),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            kernel.sys_map_pmo(0, CAP_GROUP_SLOT, ro, 0x1000, VmPerm::READ, 2 * PAGE_SIZE),
            Err(KernelError::InvalidArgument)
        );
        kernel
            .sys_map_pmo(0, CAP_GROUP_SLOT, ro, 0x1000, VmPerm::READ, PAGE_SIZE)
            .unwrap();
        assert_eq!(
            kernel.sys_map_pmo(0, CAP_GROUP_SLOT, ro, 0x1000, VmPerm::READ, PAGE_SIZE),
            Err(KernelError::InvalidArgument)
        );
    }

    #[test]
    fn test_unmap_releases_pmo() {
        let (kernel, root) = boot(1);
        let cap = kernel
            .sys_create_pmo(0, PAGE_SIZE, PmoKind::Shared, CapRights::ALL)
            .unwrap();
        kernel
            .sys_map_pmo(0, CAP_GROUP_SLOT, cap, 0x4000, RW, PAGE_SIZE)
            .unwrap();
        let pmo = kernel.obj_get(&root.group, cap, ObjectType::Pmo).unwrap().arc().clone();
        assert_eq!(pmo.refcount(), 2);
        kernel.sys_unmap_pmo(0, CAP_GROUP_SLOT, cap, 0x4000).unwrap();
        assert_eq!(pmo.refcount(), 1);
        assert_eq!(
            kernel.sys_unmap_pmo(0, CAP_GROUP_SLOT, cap, 0x4000),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(root.plat.record().unmappings.len(), 1);
    }
}
