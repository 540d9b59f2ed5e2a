//! Physical memory objects

use super::{page_align_up, PAGE_SIZE};
use crate::cap::{Cap, CapRights};
use crate::error::{KResult, KernelError};
use crate::object::ObjectBody;
use crate::platform::PhysAddr;
use crate::sync::MemoryLock;
use crate::{CpuId, Kernel};

/// What backs a PMO
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum PmoKind {
    /// Private zero-filled pages
    Anonymous = 0,
    /// Pages meant to be mapped into several groups
    Shared = 1,
    /// Device registers; no allocator pages behind it
    Device = 2,
}

impl PmoKind {
    pub fn from_u64(value: u64) -> Option<Self> {
        match value {
            0 => Some(PmoKind::Anonymous),
            1 => Some(PmoKind::Shared),
            2 => Some(PmoKind::Device),
            _ => None,
        }
    }
}

/// Physical memory object
pub struct Pmo {
    kind: PmoKind,
    size: usize,
    backing: Option<(PhysAddr, u32)>,
    pub(super) data: MemoryLock<Vec<u8>>,
}

impl Pmo {
    pub fn kind(&self) -> PmoKind {
        self.kind
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub(super) fn phys_base(&self) -> Option<PhysAddr> {
        self.backing.map(|(pa, _)| pa)
    }
}

/// Smallest order whose block holds `pages` pages.
fn order_for(pages: usize) -> u32 {
    pages.next_power_of_two().trailing_zeros()
}

impl Kernel {
    /// Create a PMO of `size` bytes and return a cap to it with `rights`.
    pub fn sys_create_pmo(&self, cpu: CpuId, size: usize, kind: PmoKind, rights: CapRights) -> KResult<Cap> {
        if size == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let (_, group) = self.current_group(cpu)?;
        let pages = page_align_up(size) / PAGE_SIZE;
        let backing = match kind {
            PmoKind::Device => None,
            PmoKind::Anonymous | PmoKind::Shared => {
                let order = order_for(pages);
                Some((self.platform.get_pages(order)?, order))
            }
        };
        let pmo = Pmo {
            kind,
            size,
            backing,
            data: MemoryLock::new(vec![0; size], "pmo_data"),
        };
        let obj = match self.obj_alloc(ObjectBody::Pmo(pmo)) {
            Ok(obj) => obj,
            Err(e) => {
                if let Some((pa, order)) = backing {
                    self.platform.free_pages(pa, order);
                }
                return Err(e);
            }
        };
        log::debug!("pmo {:?}: {:?} {} bytes", obj.id(), kind, size);
        self.cap_alloc(&group, obj, rights)
    }

    pub(crate) fn pmo_deinit(&self, pmo: &Pmo) {
        if let Some((pa, order)) = pmo.backing {
            self.platform.free_pages(pa, order);
        }
    }
}
