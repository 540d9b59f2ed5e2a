//! Process exit and cap_group recycling
//!
//! Exiting a group only flags its threads and tells the user-level
//! recycler, once per group, through a ring in the recycler's address space
//! plus a notification. The recycler then calls `cap_group_recycle`, which
//! stops the group's IPC endpoints, takes its threads off every scheduler
//! structure and finally releases its capabilities.
//!
//! Ring layout at `ring_va` (little endian):
//!
//! ```text
//! +0   u32 head       consumer index, advanced by the recycler
//! +4   u32 tail       producer index, advanced by the kernel
//! +8   [ring_entries] { u64 badge, i64 exit_code }
//! ```

use crate::cap::{Badge, Cap, CapRights};
use crate::error::{KResult, KernelError};
use crate::mem::VmPerm;
use crate::object::{Object, ObjectType};
use crate::{CpuId, Kernel};
use std::collections::VecDeque;
use std::sync::Arc;

/// Bytes before the first ring entry
pub const RING_HEADER_LEN: usize = 8;
/// Bytes per ring entry
pub const RING_ENTRY_LEN: usize = 16;

/// One exited group, as reported to the recycler
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExitRecord {
    pub badge: Badge,
    pub exit_code: i64,
}

impl ExitRecord {
    fn encode(&self) -> [u8; RING_ENTRY_LEN] {
        let mut bytes = [0u8; RING_ENTRY_LEN];
        bytes[..8].copy_from_slice(&self.badge.0.to_le_bytes());
        bytes[8..].copy_from_slice(&self.exit_code.to_le_bytes());
        bytes
    }

    /// Parse one ring entry.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let badge = u64::from_le_bytes(bytes.get(..8)?.try_into().ok()?);
        let exit_code = i64::from_le_bytes(bytes.get(8..RING_ENTRY_LEN)?.try_into().ok()?);
        Some(Self {
            badge: Badge(badge),
            exit_code,
        })
    }
}

/// The registered user-level recycler
pub(crate) struct Recycler {
    /// Counted reference
    notif: Arc<Object>,
    /// Counted reference on the registering group's vmspace
    vmspace: Arc<Object>,
    ring_va: u64,
    entries: u32,
    /// Records that did not fit in the ring yet
    overflow: VecDeque<ExitRecord>,
}

impl Recycler {
    fn ring_len(entries: u32) -> usize {
        RING_HEADER_LEN + entries as usize * RING_ENTRY_LEN
    }

    /// Move as many overflow records into the ring as it has room for.
    fn flush(&mut self) -> KResult<usize> {
        let vm = self.vmspace.as_vmspace().ok_or(KernelError::BadState)?;
        let header = vm.copy_from_user(self.ring_va, RING_HEADER_LEN)?;
        let head = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let mut tail = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        let mut written = 0;
        while let Some(record) = self.overflow.front() {
            if tail.wrapping_sub(head) >= self.entries {
                break;
            }
            let index = (tail % self.entries) as usize;
            let va = self.ring_va + (RING_HEADER_LEN + index * RING_ENTRY_LEN) as u64;
            vm.copy_to_user(va, &record.encode())?;
            tail = tail.wrapping_add(1);
            self.overflow.pop_front();
            written += 1;
        }
        vm.copy_to_user(self.ring_va + 4, &tail.to_le_bytes())?;
        Ok(written)
    }
}

impl Kernel {
    /// Install the caller as the recycler: exits are reported in the ring at
    /// `ring_va` and signalled on `notif_cap`.
    pub fn sys_register_recycle(&self, cpu: CpuId, notif_cap: Cap, ring_va: u64) -> KResult<()> {
        let (_, group) = self.current_group(cpu)?;
        let notif = self.obj_get(&group, notif_cap, ObjectType::Notification)?;
        let vmspace = self.group_vmspace(&group)?;
        let entries = self.config.recycle.ring_entries;
        let vm = vmspace.as_vmspace().ok_or(KernelError::BadState)?;
        vm.check_access(ring_va, Recycler::ring_len(entries), VmPerm::READ | VmPerm::WRITE)?;

        let mut slot = self.recycler.lock();
        if slot.is_some() {
            return Err(KernelError::BadState);
        }
        vm.copy_to_user(ring_va, &[0u8; RING_HEADER_LEN])?;
        self.obj_ref(&vmspace);
        *slot = Some(Recycler {
            notif: notif.into_counted(),
            vmspace,
            ring_va,
            entries,
            overflow: VecDeque::new(),
        });
        log::info!("recycler registered, ring at {:#x} with {} entries", ring_va, entries);
        Ok(())
    }

    /// Flag every thread of `group` to exit and report the exit once.
    ///
    /// Threads current on a core leave at that core's next scheduling
    /// point. Returns false when the group had already exited.
    pub(crate) fn exit_group_inner(&self, local: Option<CpuId>, group: &Arc<Object>, code: i64) -> bool {
        let Some(cap_group) = group.as_cap_group() else {
            return false;
        };
        if !cap_group.mark_exited(code) {
            return false;
        }
        for thread in cap_group.thread_list() {
            let Some(t) = thread.as_thread() else {
                continue;
            };
            let on_cpu = {
                let mut ctl = t.ctl.lock();
                ctl.exiting = true;
                ctl.on_cpu
            };
            if let Some(on) = on_cpu {
                self.kick(local, on);
            }
        }
        log::debug!("cap_group {} exits with {}", cap_group.name(), code);
        self.notify_recycler(
            local,
            ExitRecord {
                badge: cap_group.badge(),
                exit_code: code,
            },
        );
        true
    }

    fn notify_recycler(&self, local: Option<CpuId>, record: ExitRecord) {
        let notif = {
            let mut slot = self.recycler.lock();
            let Some(recycler) = slot.as_mut() else {
                log::debug!("no recycler registered, exit of {:?} unreported", record.badge);
                return;
            };
            recycler.overflow.push_back(record);
            if let Err(e) = recycler.flush() {
                log::warn!("recycle ring unwritable: {}", e);
            }
            recycler.notif.clone()
        };
        if let Some(n) = notif.as_notification() {
            if let Err(e) = self.signal_notification(local, n) {
                log::warn!("recycler notification dead: {}", e);
            }
        }
    }

    /// Records parked because the ring was full.
    pub fn recycle_backlog(&self) -> usize {
        self.recycler.lock().as_ref().map_or(0, |r| r.overflow.len())
    }

    /// Exit the caller's whole group.
    pub fn sys_exit_group(&self, cpu: CpuId, code: i64) -> KResult<()> {
        let (thread, group) = self.current_group(cpu)?;
        self.exit_group_inner(Some(cpu), &group, code);
        if let Some(t) = thread.as_thread() {
            t.ctl.lock().exiting = true;
        }
        self.sched(cpu);
        self.drain_retired(cpu);
        Ok(())
    }

    /// Make the group behind `group_cap` exit with code 0.
    pub fn sys_kill_group(&self, cpu: CpuId, group_cap: Cap) -> KResult<()> {
        let (_, current) = self.current_group(cpu)?;
        let target = self
            .obj_get(&current, group_cap, ObjectType::CapGroup)
            .map_err(|_| KernelError::InvalidArgument)?;
        self.exit_group_inner(Some(cpu), target.arc(), 0);
        Ok(())
    }

    /// Tear down the group behind `group_cap`.
    ///
    /// Returns `TryAgain` while one of its threads is still current on some
    /// core; those cores have been asked to reschedule and the call can be
    /// repeated.
    pub fn sys_cap_group_recycle(&self, cpu: CpuId, group_cap: Cap) -> KResult<()> {
        let (_, current) = self.current_group(cpu)?;
        let (guard, rights) = self.obj_get_with_rights(&current, group_cap, ObjectType::CapGroup)?;
        rights.require(CapRights::REVOKE_ALL)?;
        let group = guard.arc().clone();
        drop(guard);
        if Arc::ptr_eq(&group, &current) {
            return Err(KernelError::InvalidArgument);
        }
        let cap_group = group.as_cap_group().ok_or(KernelError::BadCapability)?;
        // No new threads from here on.
        cap_group.mark_exited(0);

        // Phase 1: stop IPC, then threads.
        let objects: Vec<Arc<Object>> = cap_group
            .table
            .read()
            .iter()
            .map(|(_, slot)| slot.object.clone())
            .collect();
        for obj in &objects {
            match obj.object_type() {
                ObjectType::Notification if held_only_by(obj, &group) => {
                    if let Some(n) = obj.as_notification() {
                        self.stop_notification(Some(cpu), n);
                    }
                }
                ObjectType::Channel => {
                    let Some(channel) = obj.as_channel() else {
                        continue;
                    };
                    if channel.created_by(&group) {
                        self.stop_channel_on_teardown(Some(cpu), channel);
                    } else {
                        self.close_channel(channel, &group);
                    }
                }
                _ => {}
            }
        }
        let mut busy = 0;
        for thread in cap_group.thread_list() {
            if !self.force_exit(Some(cpu), &thread) {
                busy += 1;
            }
        }
        if busy > 0 {
            log::warn!("recycle of {} deferred, {} threads still running", cap_group.name(), busy);
            return Err(KernelError::TryAgain);
        }

        // Phase 2: release every slot.
        for obj in objects.iter().filter(|o| owned_thread(o, &group)) {
            self.revoke_object(obj);
        }
        self.revoke_object(&group);
        self.flush_recycler();
        log::debug!("cap_group {} recycled", cap_group.name());
        Ok(())
    }

    /// Retry writing parked exit records.
    fn flush_recycler(&self) {
        if let Some(recycler) = self.recycler.lock().as_mut() {
            if let Err(e) = recycler.flush() {
                log::warn!("recycle ring unwritable: {}", e);
            }
        }
    }
}

/// True when every slot referencing `obj` lives in `group`.
fn held_only_by(obj: &Object, group: &Arc<Object>) -> bool {
    obj.copies
        .lock()
        .iter()
        .all(|c| c.group.as_ptr() == Arc::as_ptr(group))
}

fn owned_thread(obj: &Object, group: &Arc<Object>) -> bool {
    obj.as_thread()
        .and_then(|t| t.group())
        .is_some_and(|g| Arc::ptr_eq(&g, group))
}
