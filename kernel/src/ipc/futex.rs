//! Futexes
//!
//! A cap_group keeps one wait queue per user address that currently has
//! waiters. A queue is a kernel-private notification that never banks a
//! signal: waking only ever releases threads already linked in, so the
//! value check in `wait` and the link happen under the group's futex lock
//! and no wakeup is lost in between.

use super::{Blocking, Notification};
use crate::error::{KResult, KernelError};
use crate::object::{Object, ObjectBody};
use crate::sync::FutexLock;
use crate::{CpuId, Kernel};
use core::time::Duration;
use hashbrown::HashMap;
use std::sync::Arc;

/// Per-group futex wait queues keyed by user address
pub struct FutexTable {
    entries: FutexLock<HashMap<u64, Arc<Object>>>,
}

impl FutexTable {
    pub(crate) fn new() -> Self {
        Self {
            entries: FutexLock::new(HashMap::new(), "futex_table"),
        }
    }

    /// Addresses with a live queue.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Threads queued on `uaddr`.
    pub fn waiters(&self, uaddr: u64) -> usize {
        self.entries
            .lock()
            .get(&uaddr)
            .and_then(|o| o.as_notification())
            .map_or(0, Notification::waiter_count)
    }
}

fn check_uaddr(uaddr: u64) -> KResult<()> {
    if uaddr == 0 || uaddr % 4 != 0 {
        return Err(KernelError::InvalidArgument);
    }
    Ok(())
}

fn new_queue() -> Arc<Object> {
    Object::new(ObjectBody::Notification(Notification::new()))
}

/// Drop the queue of `uaddr` once nobody waits on it.
fn prune(table: &mut HashMap<u64, Arc<Object>>, uaddr: u64) {
    let idle = table
        .get(&uaddr)
        .and_then(|o| o.as_notification())
        .is_some_and(|n| n.waiter_count() == 0);
    if idle {
        table.remove(&uaddr);
    }
}

impl Kernel {
    /// Block on `uaddr` while it still holds `val`.
    ///
    /// Fails with `WouldBlock` when the word already changed.
    pub fn sys_futex_wait(
        &self,
        cpu: CpuId,
        uaddr: u64,
        val: u32,
        timeout: Option<Duration>,
    ) -> KResult<Blocking<()>> {
        check_uaddr(uaddr)?;
        let (_, group) = self.current_group(cpu)?;
        let cap_group = group.as_cap_group().ok_or(KernelError::BadState)?;
        let vmspace = self.group_vmspace(&group)?;
        let vm = vmspace.as_vmspace().ok_or(KernelError::BadState)?;

        let mut table = cap_group.futex.entries.lock();
        let word = vm.copy_from_user(uaddr, 4)?;
        let current = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
        if current != val || timeout.is_some_and(|d| d.is_zero()) {
            return Err(KernelError::WouldBlock);
        }
        let queue = table.entry(uaddr).or_insert_with(new_queue).clone();
        log::trace!("futex wait {:#x} on {:?}", uaddr, queue.id());
        self.wait_notification_with(cpu, &queue, true, timeout, move || drop(table))
    }

    /// Wake up to `count` threads waiting on `uaddr`.
    pub fn sys_futex_wake(&self, cpu: CpuId, uaddr: u64, count: usize) -> KResult<usize> {
        check_uaddr(uaddr)?;
        let (_, group) = self.current_group(cpu)?;
        let cap_group = group.as_cap_group().ok_or(KernelError::BadState)?;
        let mut table = cap_group.futex.entries.lock();
        let Some(queue) = table.get(&uaddr).cloned() else {
            return Ok(0);
        };
        let notif = queue.as_notification().ok_or(KernelError::BadState)?;
        let woken = self.wake_notification_waiters(Some(cpu), notif, count)?;
        prune(&mut table, uaddr);
        Ok(woken)
    }

    /// Wake `nr_wake` waiters of `uaddr` and move up to `nr_requeue` of
    /// the rest to `uaddr2`. Returns woken plus moved.
    pub fn sys_futex_requeue(
        &self,
        cpu: CpuId,
        uaddr: u64,
        uaddr2: u64,
        nr_wake: usize,
        nr_requeue: usize,
    ) -> KResult<usize> {
        check_uaddr(uaddr)?;
        check_uaddr(uaddr2)?;
        if uaddr == uaddr2 {
            return Err(KernelError::InvalidArgument);
        }
        let (_, group) = self.current_group(cpu)?;
        let cap_group = group.as_cap_group().ok_or(KernelError::BadState)?;
        let mut table = cap_group.futex.entries.lock();
        let Some(src) = table.get(&uaddr).cloned() else {
            return Ok(0);
        };
        let notif = src.as_notification().ok_or(KernelError::BadState)?;
        let woken = self.wake_notification_waiters(Some(cpu), notif, nr_wake)?;
        let mut moved = 0;
        if nr_requeue > 0 && notif.waiter_count() > 0 {
            let dst = table.entry(uaddr2).or_insert_with(new_queue).clone();
            moved = self.requeue_notification(&src, &dst, nr_requeue)?;
        }
        prune(&mut table, uaddr);
        prune(&mut table, uaddr2);
        log::trace!("futex requeue {:#x} -> {:#x}: {} woken, {} moved", uaddr, uaddr2, woken, moved);
        Ok(woken + moved)
    }

    /// Tear down every queue of a dying group; leftover waiters fail with
    /// `BadCapability`.
    pub(crate) fn futex_deinit(&self, table: &FutexTable) {
        let queues: Vec<Arc<Object>> = table.entries.lock().drain().map(|(_, q)| q).collect();
        for queue in &queues {
            if let Some(notif) = queue.as_notification() {
                self.stop_notification(None, notif);
            }
        }
    }
}
