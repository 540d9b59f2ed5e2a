//! # Platform Collaborators
//!
//! The kernel core never touches hardware. Physical pages, page tables, the
//! timer and inter-processor interrupts are reached through the traits in
//! this module, bundled as [`Platform`].
//!
//! ## Testing Strategy
//!
//! [`SimPlatform`] implements every trait in memory: a manually advanced
//! clock, a page budget for exercising out-of-memory paths, and a record of
//! the IPIs, page-table switches and TLB flushes the kernel requested.

use crate::error::{KResult, KernelError};
use crate::mem::{VmPerm, PAGE_SIZE};
use crate::CpuId;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use core::time::Duration;
use spin::Mutex;

/// Physical address handed out by the page allocator
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysAddr(pub u64);

/// Vector used for reschedule requests
pub const RESCHED_IPI_VECTOR: u8 = 0xFE;

/// Physically contiguous page allocation
pub trait PhysAllocator {
    /// Allocate `2^order` contiguous pages.
    fn get_pages(&self, order: u32) -> KResult<PhysAddr>;

    /// Return pages obtained from [`get_pages`](Self::get_pages).
    fn free_pages(&self, addr: PhysAddr, order: u32);
}

/// Page-table manipulation
pub trait Mmu {
    /// Install `pgtbl` as the active address space on `cpu`.
    fn set_page_table(&self, cpu: CpuId, pgtbl: PhysAddr);

    fn map_range(&self, pgtbl: PhysAddr, va: u64, pa: PhysAddr, len: usize, perm: VmPerm)
        -> KResult<()>;

    fn unmap_range(&self, pgtbl: PhysAddr, va: u64, len: usize);

    fn flush_tlb_by_range(&self, pgtbl: PhysAddr, va: u64, len: usize);
}

/// Per-core timer
pub trait TimerDevice {
    /// Monotonic tick counter shared by all cores.
    fn current_tick(&self) -> u64;

    fn ticks_per_us(&self) -> u64;

    /// Arm the next timer interrupt on `cpu`, `ticks` from now.
    fn plat_set_next_timer(&self, cpu: CpuId, ticks: u64);
}

/// Inter-processor interrupts
pub trait IpiController {
    fn arch_send_ipi(&self, cpu: CpuId, vector: u8);
}

/// Everything the kernel core needs from the machine.
pub trait Platform: PhysAllocator + Mmu + TimerDevice + IpiController + Send + Sync {}

impl<T> Platform for T where T: PhysAllocator + Mmu + TimerDevice + IpiController + Send + Sync {}

/// Requests the simulated machine has seen
#[derive(Debug, Default, Clone)]
pub struct SimRecord {
    pub ipis: Vec<(CpuId, u8)>,
    pub page_table_switches: Vec<(CpuId, PhysAddr)>,
    pub mappings: Vec<(PhysAddr, u64, usize, VmPerm)>,
    pub unmappings: Vec<(PhysAddr, u64, usize)>,
    pub tlb_flushes: usize,
    pub timer_programs: Vec<(CpuId, u64)>,
}

/// In-memory machine used by tests and the simulator
pub struct SimPlatform {
    clock: AtomicU64,
    ticks_per_us: u64,
    page_limit: usize,
    pages_in_use: AtomicUsize,
    next_frame: AtomicU64,
    record: Mutex<SimRecord>,
}

impl SimPlatform {
    /// Base of the simulated physical address range.
    const PHYS_BASE: u64 = 0x8000_0000;

    /// A machine with `page_limit` allocatable pages and a 1 tick/us clock.
    pub fn new(page_limit: usize) -> Self {
        Self {
            clock: AtomicU64::new(0),
            ticks_per_us: 1,
            page_limit,
            pages_in_use: AtomicUsize::new(0),
            next_frame: AtomicU64::new(Self::PHYS_BASE),
            record: Mutex::new(SimRecord::default()),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let ticks = by.as_micros() as u64 * self.ticks_per_us;
        self.clock.fetch_add(ticks, Ordering::SeqCst);
    }

    pub fn pages_in_use(&self) -> usize {
        self.pages_in_use.load(Ordering::SeqCst)
    }

    /// Snapshot of the recorded requests.
    pub fn record(&self) -> SimRecord {
        self.record.lock().clone()
    }

    /// IPIs sent to `cpu` so far.
    pub fn ipis_to(&self, cpu: CpuId) -> usize {
        self.record.lock().ipis.iter().filter(|(c, _)| *c == cpu).count()
    }

    pub fn clear_record(&self) {
        *self.record.lock() = SimRecord::default();
    }
}

impl Default for SimPlatform {
    fn default() -> Self {
        Self::new(16 * 1024)
    }
}

impl PhysAllocator for SimPlatform {
    fn get_pages(&self, order: u32) -> KResult<PhysAddr> {
        let count = 1usize.checked_shl(order).ok_or(KernelError::InvalidArgument)?;
        let mut in_use = self.pages_in_use.load(Ordering::SeqCst);
        loop {
            let wanted = in_use.checked_add(count).ok_or(KernelError::OutOfMemory)?;
            if wanted > self.page_limit {
                return Err(KernelError::OutOfMemory);
            }
            match self.pages_in_use.compare_exchange(
                in_use,
                wanted,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => in_use = actual,
            }
        }
        let bytes = (count * PAGE_SIZE) as u64;
        Ok(PhysAddr(self.next_frame.fetch_add(bytes, Ordering::SeqCst)))
    }

    fn free_pages(&self, _addr: PhysAddr, order: u32) {
        self.pages_in_use.fetch_sub(1usize << order, Ordering::SeqCst);
    }
}

impl Mmu for SimPlatform {
    fn set_page_table(&self, cpu: CpuId, pgtbl: PhysAddr) {
        self.record.lock().page_table_switches.push((cpu, pgtbl));
    }

    fn map_range(
        &self,
        pgtbl: PhysAddr,
        va: u64,
        _pa: PhysAddr,
        len: usize,
        perm: VmPerm,
    ) -> KResult<()> {
        self.record.lock().mappings.push((pgtbl, va, len, perm));
        Ok(())
    }

    fn unmap_range(&self, pgtbl: PhysAddr, va: u64, len: usize) {
        self.record.lock().unmappings.push((pgtbl, va, len));
    }

    fn flush_tlb_by_range(&self, _pgtbl: PhysAddr, _va: u64, _len: usize) {
        self.record.lock().tlb_flushes += 1;
    }
}

impl TimerDevice for SimPlatform {
    fn current_tick(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }

    fn ticks_per_us(&self) -> u64 {
        self.ticks_per_us
    }

    fn plat_set_next_timer(&self, cpu: CpuId, ticks: u64) {
        self.record.lock().timer_programs.push((cpu, ticks));
    }
}

impl IpiController for SimPlatform {
    fn arch_send_ipi(&self, cpu: CpuId, vector: u8) {
        self.record.lock().ipis.push((cpu, vector));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_budget() {
        let plat = SimPlatform::new(4);
        let a = plat.get_pages(1).unwrap();
        let b = plat.get_pages(1).unwrap();
        assert_ne!(a, b);
        assert_eq!(plat.pages_in_use(), 4);
        assert_eq!(plat.get_pages(0), Err(KernelError::OutOfMemory));
        plat.free_pages(a, 1);
        assert!(plat.get_pages(0).is_ok());
    }

    #[test]
    fn test_clock_and_record() {
        let plat = SimPlatform::default();
        plat.advance(Duration::from_millis(3));
        assert_eq!(plat.current_tick(), 3_000);
        plat.arch_send_ipi(2, RESCHED_IPI_VECTOR);
        plat.arch_send_ipi(1, RESCHED_IPI_VECTOR);
        plat.arch_send_ipi(2, RESCHED_IPI_VECTOR);
        assert_eq!(plat.ipis_to(2), 2);
        plat.clear_record();
        assert_eq!(plat.ipis_to(2), 0);
    }
}
