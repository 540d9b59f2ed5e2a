//! # Capability System
//!
//! A capability is a slot index in a cap_group's table. The slot names an
//! object and carries rights; nothing else in the kernel hands out access.
//!
//! ## Copies and revocation
//!
//! Every object keeps the list of slots that reference it. `cap_copy` adds
//! to the list while holding the source table (read) and destination table
//! (write) locks; `cap_free` removes from it while holding the owning
//! table's write lock. Revocation walks the list under the object's copies
//! lock and may only *try* table locks, because tables are normally taken
//! first. On contention it releases the list and retries, so a copy that
//! races with revocation either lands before the walk finishes (and is
//! freed by it) or finds its source slot already gone.

mod group;
mod rights;
mod table;

pub use group::{Badge, CapGroup, CapGroupArgs, CAP_GROUP_SLOT, VMSPACE_SLOT};
pub use rights::CapRights;
pub use table::{Slot, SlotTable};

use crate::error::{KResult, KernelError};
use crate::object::{CopyRef, Object};
use crate::{CpuId, Kernel};
use std::sync::Arc;

/// Index of a slot within a cap_group's table
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cap(u32);

impl Cap {
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }

    pub(crate) fn from_index(index: usize) -> Self {
        Self(index as u32)
    }
}

impl core::fmt::Debug for Cap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "cap:{}", self.0)
    }
}

impl core::fmt::Display for Cap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a copy's rights are chosen
#[derive(Clone, Copy, Debug)]
enum CopyRights {
    /// Same rights as the source slot
    Same,
    /// Rights derived through [`CapRights::derive`]
    Derive { restrict: bool, rights: CapRights },
}

pub(crate) fn unlink_copy(obj: &Object, group: &Arc<Object>, cap: Cap) {
    obj.copies
        .lock()
        .retain(|c| !(c.cap == cap && c.group.as_ptr() == Arc::as_ptr(group)));
}

impl Kernel {
    /// Install `obj` in a fresh slot of `group`.
    ///
    /// Consumes the caller's reference on `obj`; on failure that reference
    /// is released, so a failed allocation never leaves a dangling object.
    pub fn cap_alloc(&self, group: &Arc<Object>, obj: Arc<Object>, rights: CapRights) -> KResult<Cap> {
        let Some(cap_group) = group.as_cap_group() else {
            self.obj_put(&obj);
            return Err(KernelError::BadCapability);
        };
        let mut table = cap_group.table.write();
        let result = table.insert_next(Slot {
            object: obj.clone(),
            rights,
        });
        match result {
            Ok(cap) => {
                obj.copies.lock().push(CopyRef {
                    group: Arc::downgrade(group),
                    cap,
                });
                log::trace!("cap_alloc {:?} -> {:?} in {:?}", obj.id(), cap, group.id());
                Ok(cap)
            }
            Err(e) => {
                drop(table);
                self.obj_put(&obj);
                Err(e)
            }
        }
    }

    /// Copy `src_cap` of `src_group` into `dst_group`.
    ///
    /// With `restrict_rights`, `new_rights` must be a subset of the source
    /// rights. Without it, the copy may only differ from the source when the
    /// source holds `COPY`.
    pub fn cap_copy(
        &self,
        src_group: &Arc<Object>,
        dst_group: &Arc<Object>,
        src_cap: Cap,
        restrict_rights: bool,
        new_rights: CapRights,
    ) -> KResult<Cap> {
        self.cap_copy_inner(
            src_group,
            dst_group,
            src_cap,
            CopyRights::Derive {
                restrict: restrict_rights,
                rights: new_rights,
            },
        )
    }

    fn cap_copy_inner(
        &self,
        src_group: &Arc<Object>,
        dst_group: &Arc<Object>,
        src_cap: Cap,
        mode: CopyRights,
    ) -> KResult<Cap> {
        let src = src_group.as_cap_group().ok_or(KernelError::BadCapability)?;
        let dst = dst_group.as_cap_group().ok_or(KernelError::BadCapability)?;

        let install = |slot: Slot, dst_table: &mut SlotTable| -> KResult<Cap> {
            let rights = match mode {
                CopyRights::Same => slot.rights,
                CopyRights::Derive { restrict, rights } => {
                    CapRights::derive(slot.rights, restrict, rights)?
                }
            };
            let cap = dst_table.insert_next(Slot {
                object: slot.object.clone(),
                rights,
            })?;
            // The source slot keeps the object alive while its table is locked.
            self.obj_ref(&slot.object);
            slot.object.copies.lock().push(CopyRef {
                group: Arc::downgrade(dst_group),
                cap,
            });
            Ok(cap)
        };

        if Arc::ptr_eq(src_group, dst_group) {
            let mut table = src.table.write();
            let slot = table.get(src_cap).cloned().ok_or(KernelError::BadCapability)?;
            return install(slot, &mut table);
        }

        loop {
            let src_table = src.table.read();
            let Some(mut dst_table) = dst.table.try_write() else {
                drop(src_table);
                core::hint::spin_loop();
                continue;
            };
            let slot = src_table.get(src_cap).cloned().ok_or(KernelError::BadCapability)?;
            return install(slot, &mut dst_table);
        }
    }

    /// Empty one slot and drop its reference.
    pub fn cap_free(&self, group: &Arc<Object>, cap: Cap) -> KResult<()> {
        let cap_group = group.as_cap_group().ok_or(KernelError::BadCapability)?;
        let obj = {
            let mut table = cap_group.table.write();
            let slot = table.remove(cap).ok_or(KernelError::BadCapability)?;
            unlink_copy(&slot.object, group, cap);
            slot.object
        };
        log::trace!("cap_free {:?} of {:?}", cap, obj.id());
        self.obj_put(&obj);
        Ok(())
    }

    /// Free every slot, in every group, that references the object in `cap`.
    pub fn cap_free_all(&self, group: &Arc<Object>, cap: Cap) -> KResult<()> {
        let cap_group = group.as_cap_group().ok_or(KernelError::BadCapability)?;
        let obj = cap_group
            .table
            .read()
            .get(cap)
            .map(|slot| slot.object.clone())
            .ok_or(KernelError::BadCapability)?;
        self.revoke_object(&obj);
        Ok(())
    }

    pub(crate) fn revoke_object(&self, obj: &Arc<Object>) {
        let mut rounds = 0usize;
        loop {
            let mut released = 0usize;
            let mut contended = false;
            {
                let mut copies = obj.copies.lock();
                while let Some(entry) = copies.last().cloned() {
                    let Some(owner) = entry.group.upgrade() else {
                        copies.pop();
                        continue;
                    };
                    let Some(owner_group) = owner.as_cap_group() else {
                        copies.pop();
                        continue;
                    };
                    let Some(mut table) = owner_group.table.try_write() else {
                        contended = true;
                        break;
                    };
                    if table
                        .get(entry.cap)
                        .is_some_and(|slot| Arc::ptr_eq(&slot.object, obj))
                    {
                        table.remove(entry.cap);
                        released += 1;
                    }
                    copies.pop();
                }
            }
            // Deinit may take other object locks, so the list is released first.
            for _ in 0..released {
                self.obj_put(obj);
            }
            if !contended {
                break;
            }
            rounds += 1;
            core::hint::spin_loop();
        }
        log::debug!("revoked {:?} after {} retries", obj.id(), rounds);
    }

    /// Rights of `cap` in the caller's group.
    pub fn sys_get_rights(&self, cpu: CpuId, cap: Cap) -> KResult<CapRights> {
        let (_, group) = self.current_group(cpu)?;
        let cap_group = group.as_cap_group().ok_or(KernelError::BadCapability)?;
        let table = cap_group.table.read();
        table.get(cap).map(|slot| slot.rights).ok_or(KernelError::BadCapability)
    }

    /// Free `cap`, or with `revoke_copies` every copy of its object.
    pub fn sys_revoke_cap(&self, cpu: CpuId, cap: Cap, revoke_copies: bool) -> KResult<()> {
        let (thread, group) = self.current_group(cpu)?;
        let cap_group = group.as_cap_group().ok_or(KernelError::BadCapability)?;
        let slot = cap_group
            .table
            .read()
            .get(cap)
            .cloned()
            .ok_or(KernelError::BadCapability)?;

        // A group may not pull the floor out from under its running thread.
        let own_vmspace = thread
            .as_thread()
            .and_then(|t| t.vmspace())
            .is_some_and(|vm| Arc::ptr_eq(vm, &slot.object));
        if Arc::ptr_eq(&slot.object, &group) || Arc::ptr_eq(&slot.object, &thread) || own_vmspace {
            return Err(KernelError::InvalidArgument);
        }

        if revoke_copies {
            slot.rights.require(CapRights::REVOKE_ALL)?;
            self.revoke_object(&slot.object);
            Ok(())
        } else {
            self.cap_free(&group, cap)
        }
    }

    /// Copy caps of the caller into `dest_group_cap`'s table, keeping rights.
    ///
    /// Stops at the first failure; caps copied before it stay in place.
    pub fn sys_transfer_caps(&self, cpu: CpuId, dest_group_cap: Cap, caps: &[Cap]) -> KResult<Vec<Cap>> {
        if caps.len() > self.config.cap.max_transfer {
            return Err(KernelError::InvalidArgument);
        }
        let (_, group) = self.current_group(cpu)?;
        let dest = self.obj_get(&group, dest_group_cap, crate::object::ObjectType::CapGroup)?;
        caps.iter()
            .map(|&cap| self.cap_copy_inner(&group, dest.arc(), cap, CopyRights::Same))
            .collect()
    }

    /// Copy one cap into another group with explicit rights.
    pub fn sys_cap_copy(
        &self,
        cpu: CpuId,
        dest_group_cap: Cap,
        src_cap: Cap,
        restrict_rights: bool,
        new_rights: CapRights,
    ) -> KResult<Cap> {
        let (_, group) = self.current_group(cpu)?;
        let dest = self.obj_get(&group, dest_group_cap, crate::object::ObjectType::CapGroup)?;
        self.cap_copy(&group, dest.arc(), src_cap, restrict_rights, new_rights)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::notification::Notification;
    use crate::object::{ObjectBody, ObjectType};
    use crate::testutil::{boot, spawn_group};

    #[test]
    fn test_alloc_copy_free_refcount() {
        let (kernel, root) = boot(1);
        let other = spawn_group(&kernel, 0, "other", 7);
        let obj = kernel.obj_alloc(ObjectBody::Notification(Notification::new())).unwrap();
        let cap = kernel.cap_alloc(&root.group, obj.clone(), CapRights::ALL).unwrap();
        assert_eq!(obj.refcount(), 1);

        let copy = kernel.cap_copy(&root.group, &other.group, cap, false, CapRights::ALL).unwrap();
        assert_eq!(obj.refcount(), 2);
        assert_eq!(obj.copy_count(), 2);

        kernel.cap_free(&root.group, cap).unwrap();
        assert_eq!(obj.refcount(), 1);
        assert!(obj.is_alive());
        assert_eq!(kernel.cap_free(&root.group, cap), Err(KernelError::BadCapability));

        kernel.cap_free(&other.group, copy).unwrap();
        assert!(!obj.is_alive());
        assert_eq!(obj.copy_count(), 0);
    }

    #[test]
    fn test_copy_rights_rules() {
        let (kernel, root) = boot(1);
        let obj = kernel.obj_alloc(ObjectBody::Notification(Notification::new())).unwrap();
        let rw = CapRights::READ | CapRights::WRITE;
        let cap = kernel.cap_alloc(&root.group, obj, rw).unwrap();
        let g = &root.group;

        let ro = kernel.cap_copy(g, g, cap, true, CapRights::READ).unwrap();
        assert_eq!(kernel.sys_get_rights(0, ro), Ok(CapRights::READ));
        assert_eq!(
            kernel.cap_copy(g, g, ro, true, rw),
            Err(KernelError::PermissionDenied)
        );
        assert_eq!(
            kernel.cap_copy(g, g, cap, false, CapRights::EXEC),
            Err(KernelError::PermissionDenied)
        );
        let same = kernel.cap_copy(g, g, cap, false, rw).unwrap();
        assert_eq!(kernel.sys_get_rights(0, same), Ok(rw));
    }

    #[test]
    fn test_failed_alloc_releases_reference() {
        let mut config = crate::config::KernelConfig::default();
        config.sched.cpus = 1;
        config.cap.slot_chunk = 4;
        config.cap.max_slots = 4;
        let (kernel, root) = crate::testutil::boot_with(config);
        // Slots 0 and 1 hold the group and its vmspace, root thread takes 2.
        let obj = kernel.obj_alloc(ObjectBody::Notification(Notification::new())).unwrap();
        kernel.cap_alloc(&root.group, obj, CapRights::ALL).unwrap();
        let obj = kernel.obj_alloc(ObjectBody::Notification(Notification::new())).unwrap();
        assert_eq!(
            kernel.cap_alloc(&root.group, obj.clone(), CapRights::ALL),
            Err(KernelError::NoSlots)
        );
        assert!(!obj.is_alive());
    }

    #[test]
    fn test_free_all_reaches_every_group() {
        let (kernel, root) = boot(1);
        let a = spawn_group(&kernel, 0, "a", 2);
        let b = spawn_group(&kernel, 0, "b", 3);
        let cap = kernel.sys_create_notification(0).unwrap();
        let obj = kernel.obj_get(&root.group, cap, ObjectType::Notification).unwrap().arc().clone();
        kernel.cap_copy(&root.group, &a.group, cap, false, CapRights::ALL).unwrap();
        let in_b = kernel.cap_copy(&root.group, &b.group, cap, false, CapRights::ALL).unwrap();
        kernel.cap_copy(&b.group, &b.group, in_b, false, CapRights::ALL).unwrap();
        assert_eq!(obj.refcount(), 4);

        kernel.cap_free_all(&root.group, cap).unwrap();
        assert!(!obj.is_alive());
        assert_eq!(obj.copy_count(), 0);
        assert_eq!(kernel.objects().freed(ObjectType::Notification), 1);
    }

    #[test]
    fn test_revoke_cap_rules() {
        let (kernel, _root) = boot(1);
        assert_eq!(
            kernel.sys_revoke_cap(0, CAP_GROUP_SLOT, false),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            kernel.sys_revoke_cap(0, VMSPACE_SLOT, true),
            Err(KernelError::InvalidArgument)
        );

        let cap = kernel.sys_create_notification(0).unwrap();
        let weak = kernel
            .sys_cap_copy(0, CAP_GROUP_SLOT, cap, true, CapRights::READ)
            .unwrap();
        assert_eq!(
            kernel.sys_revoke_cap(0, weak, true),
            Err(KernelError::PermissionDenied)
        );
        kernel.sys_revoke_cap(0, cap, true).unwrap();
        assert_eq!(kernel.sys_get_rights(0, weak), Err(KernelError::BadCapability));
    }

    #[test]
    fn test_transfer_caps() {
        let (kernel, root) = boot(1);
        let child = spawn_group(&kernel, 0, "child", 9);
        let n1 = kernel.sys_create_notification(0).unwrap();
        let n2 = kernel.sys_create_channel(0).unwrap();
        let moved = kernel.sys_transfer_caps(0, child.cap, &[n1, n2]).unwrap();
        assert_eq!(moved.len(), 2);
        let child_group = child.group.as_cap_group().unwrap();
        let table = child_group.table.read();
        assert_eq!(table.get(moved[0]).unwrap().object.object_type(), ObjectType::Notification);
        assert_eq!(table.get(moved[1]).unwrap().object.object_type(), ObjectType::Channel);
        drop(table);

        let too_many = vec![n1; 17];
        assert_eq!(
            kernel.sys_transfer_caps(0, child.cap, &too_many),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            kernel.sys_transfer_caps(0, child.cap, &[Cap::from_raw(500)]),
            Err(KernelError::BadCapability)
        );
        let _ = root;
    }
}
