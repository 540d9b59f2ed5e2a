//! cap_group: the unit of capability ownership
//!
//! Roughly "a process". A group owns its slot table, a badge that IPC peers
//! use to identify it, and the threads that run under it. Every group holds
//! itself in slot 0 and its address space in slot 1.

use super::{unlink_copy, Cap, CapRights, SlotTable};
use crate::error::{KResult, KernelError};
use crate::ipc::futex::FutexTable;
use crate::object::{Object, ObjectBody};
use crate::sync::{ObjectLock, TableLock};
use crate::{CpuId, Kernel};
use core::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

/// Slot of a group's own capability
pub const CAP_GROUP_SLOT: Cap = Cap::from_raw(0);
/// Slot of a group's vmspace
pub const VMSPACE_SLOT: Cap = Cap::from_raw(1);

/// Stable identity of a cap_group as seen by IPC peers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Badge(pub u64);

/// Parameters for a new cap_group
#[derive(Clone, Debug)]
pub struct CapGroupArgs {
    pub name: String,
    pub badge: Badge,
    pub pid: u64,
}

/// Capability table owner
pub struct CapGroup {
    name: String,
    badge: Badge,
    pid: u64,
    pub(crate) table: TableLock<SlotTable>,
    pub(crate) threads: ObjectLock<Vec<Arc<Object>>>,
    pub(crate) futex: FutexTable,
    live_threads: AtomicUsize,
    exited: AtomicBool,
    exit_code: AtomicI64,
    next_tid: AtomicU32,
}

impl CapGroup {
    fn new(args: CapGroupArgs, chunk: usize, max_slots: usize) -> Self {
        Self {
            name: args.name,
            badge: args.badge,
            pid: args.pid,
            table: TableLock::new(SlotTable::new(chunk, max_slots), "cap_group_table"),
            threads: ObjectLock::new(Vec::new(), "cap_group_threads"),
            futex: FutexTable::new(),
            live_threads: AtomicUsize::new(0),
            exited: AtomicBool::new(false),
            exit_code: AtomicI64::new(0),
            next_tid: AtomicU32::new(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn badge(&self) -> Badge {
        self.badge
    }

    pub fn pid(&self) -> u64 {
        self.pid
    }

    /// Threads that have not yet exited.
    pub fn live_threads(&self) -> usize {
        self.live_threads.load(Ordering::Acquire)
    }

    /// Threads still linked to the group, exited or not.
    pub fn thread_list(&self) -> Vec<Arc<Object>> {
        self.threads.lock().clone()
    }

    pub fn futexes(&self) -> &FutexTable {
        &self.futex
    }

    /// Slots in use.
    pub fn slot_count(&self) -> usize {
        self.table.read().len()
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    pub fn exit_code(&self) -> i64 {
        self.exit_code.load(Ordering::Acquire)
    }

    pub(crate) fn next_tid(&self) -> u32 {
        self.next_tid.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn link_thread(&self, thread: Arc<Object>) {
        self.threads.lock().push(thread);
        self.live_threads.fetch_add(1, Ordering::AcqRel);
    }

    /// Unlink an exited thread. Returns true if it was the last live one.
    pub(crate) fn unlink_thread(&self, thread: &Arc<Object>) -> bool {
        let mut threads = self.threads.lock();
        let before = threads.len();
        threads.retain(|t| !Arc::ptr_eq(t, thread));
        if threads.len() == before {
            return false;
        }
        self.live_threads.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Mark the group exited. Only the first caller gets `true`.
    pub(crate) fn mark_exited(&self, code: i64) -> bool {
        if self
            .exited
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.exit_code.store(code, Ordering::Release);
            true
        } else {
            false
        }
    }
}

impl Kernel {
    /// Build a group with slot 0 (itself) and slot 1 (a fresh vmspace).
    ///
    /// The returned object carries one reference for the caller.
    pub(crate) fn new_cap_group(&self, args: CapGroupArgs) -> KResult<Arc<Object>> {
        let cap = &self.config.cap;
        let group = self.obj_alloc(ObjectBody::CapGroup(CapGroup::new(
            args,
            cap.slot_chunk,
            cap.max_slots,
        )))?;

        self.obj_ref(&group);
        if let Err(e) = self.cap_alloc(&group, group.clone(), CapRights::ALL) {
            self.obj_put(&group);
            return Err(e);
        }
        let vmspace = match self.new_vmspace() {
            Ok(vmspace) => vmspace,
            Err(e) => {
                self.release_group(&group);
                return Err(e);
            }
        };
        if let Err(e) = self.cap_alloc(&group, vmspace, CapRights::ALL) {
            self.release_group(&group);
            return Err(e);
        }
        log::debug!("created cap_group {:?}", group.id());
        Ok(group)
    }

    /// Undo a partially built group.
    fn release_group(&self, group: &Arc<Object>) {
        if let Err(e) = self.cap_free(group, CAP_GROUP_SLOT) {
            log::warn!("releasing self slot of {:?} failed: {}", group.id(), e);
        }
        self.obj_put(group);
    }

    /// Create a cap_group and return a capability to it in the caller's table.
    pub fn sys_create_cap_group(&self, cpu: CpuId, args: CapGroupArgs) -> KResult<Cap> {
        let (_, current) = self.current_group(cpu)?;
        let group = self.new_cap_group(args)?;
        self.cap_alloc(&current, group, CapRights::ALL)
    }

    /// Release whatever slots remain when the group itself is freed.
    pub(crate) fn cap_group_deinit(&self, obj: &Arc<Object>) {
        let Some(group) = obj.as_cap_group() else {
            return;
        };
        let drained: Vec<Arc<Object>> = {
            let mut table = group.table.write();
            let caps: Vec<Cap> = table.iter().map(|(cap, _)| cap).collect();
            caps.into_iter()
                .filter_map(|cap| {
                    let slot = table.remove(cap)?;
                    unlink_copy(&slot.object, obj, cap);
                    Some(slot.object)
                })
                .collect()
        };
        for object in &drained {
            self.obj_put(object);
        }
        self.futex_deinit(&group.futex);
        group.threads.lock().clear();
        log::debug!(
            "cap_group {} ({:?}) freed, {} slots drained",
            group.name(),
            group.badge(),
            drained.len()
        );
    }

    /// The group behind a cap of the caller.
    pub(crate) fn group_by_cap(&self, cpu: CpuId, cap: Cap) -> KResult<Arc<Object>> {
        let (_, current) = self.current_group(cpu)?;
        let guard = self.obj_get(&current, cap, crate::object::ObjectType::CapGroup)?;
        Ok(guard.arc().clone())
    }
}
