//! Lazy FPU ownership
//!
//! Each core remembers which thread's registers are live in its FPU. With
//! lazy switching the first FPU instruction after a switch traps and the
//! trap handler moves ownership to the current thread. A thread whose state
//! is still live on another core gives that ownership up before it runs
//! here, so its registers are never live on two cores.

use super::ThreadKind;
use crate::error::{KResult, KernelError};
use crate::object::Object;
use crate::{CpuId, Kernel};
use std::sync::Arc;

impl Kernel {
    /// FPU-disabled trap taken by the thread current on `cpu`.
    pub fn handle_fpu_trap(&self, cpu: CpuId) -> KResult<()> {
        let current = self.current_thread(cpu).ok_or(KernelError::InvalidArgument)?;
        let t = current.as_thread().ok_or(KernelError::BadState)?;
        if t.kind() == ThreadKind::Idle {
            return Err(KernelError::BadState);
        }
        self.take_fpu(cpu, &current);
        Ok(())
    }

    /// Make `thread` the FPU owner of `cpu`, evicting the previous owner.
    pub(super) fn take_fpu(&self, cpu: CpuId, thread: &Arc<Object>) {
        let prev = self.cores[cpu].fpu_owner.lock().replace(thread.clone());
        if let Some(prev) = prev.filter(|p| !Arc::ptr_eq(p, thread)) {
            if let Some(pt) = prev.as_thread() {
                let mut ctl = pt.ctl.lock();
                if ctl.fpu_cpu == Some(cpu) {
                    ctl.fpu_cpu = None;
                }
            }
            log::trace!("cpu {} fpu: {:?} -> {:?}", cpu, prev.id(), thread.id());
        }
        if let Some(t) = thread.as_thread() {
            t.ctl.lock().fpu_cpu = Some(cpu);
        }
    }

    /// Drop `cpu`'s ownership record if it still names `thread`.
    pub(super) fn clear_fpu_owner(&self, cpu: CpuId, thread: &Arc<Object>) {
        let mut owner = self.cores[cpu].fpu_owner.lock();
        if owner.as_ref().is_some_and(|o| Arc::ptr_eq(o, thread)) {
            *owner = None;
            log::trace!("cpu {} fpu state of {:?} migrated out", cpu, thread.id());
        }
    }

    /// Forget any FPU state held for a dying thread.
    pub(crate) fn release_fpu(&self, thread: &Arc<Object>) {
        let cpu = thread
            .as_thread()
            .and_then(|t| t.ctl.lock().fpu_cpu.take());
        if let Some(cpu) = cpu {
            self.clear_fpu_owner(cpu, thread);
        }
    }

    /// Thread whose FPU registers are live on `cpu`.
    pub fn fpu_owner(&self, cpu: CpuId) -> Option<Arc<Object>> {
        self.cores[cpu].fpu_owner.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectType;
    use crate::sched::ThreadArgs;
    use crate::testutil::boot;

    #[test]
    fn test_trap_takes_ownership() {
        let (kernel, root) = boot(1);
        assert!(kernel.fpu_owner(0).is_none());
        kernel.handle_fpu_trap(0).unwrap();
        assert!(Arc::ptr_eq(&kernel.fpu_owner(0).unwrap(), &root.thread));
    }

    #[test]
    fn test_idle_cannot_own_fpu() {
        let (kernel, _root) = boot(2);
        assert_eq!(kernel.handle_fpu_trap(1), Err(KernelError::BadState));
    }

    #[test]
    fn test_migration_releases_old_core() {
        let (kernel, root) = boot(2);
        let cap = kernel
            .sys_create_thread(0, ThreadArgs::own(0x1000, 50).with_affinity(0))
            .unwrap();
        let worker = kernel.obj_get(&root.group, cap, ObjectType::Thread).unwrap().arc().clone();
        kernel.return_to_user(0);
        assert!(Arc::ptr_eq(&kernel.current_thread(0).unwrap(), &worker));
        kernel.handle_fpu_trap(0).unwrap();

        // Root takes core 0 back; the worker keeps its FPU state there.
        kernel.sys_set_prio(0, cap, 1).unwrap();
        kernel.return_to_user(0);
        assert!(Arc::ptr_eq(&kernel.fpu_owner(0).unwrap(), &worker));

        // Moving it to core 1 releases core 0's record.
        kernel.sys_set_affinity(0, cap, Some(1)).unwrap();
        kernel.handle_ipi(1);
        assert!(Arc::ptr_eq(&kernel.current_thread(1).unwrap(), &worker));
        assert!(kernel.fpu_owner(0).is_none());
    }

    #[test]
    fn test_thread_free_clears_owner() {
        let (kernel, root) = boot(1);
        kernel.sys_create_thread(0, ThreadArgs::own(0x1000, 50)).unwrap();
        kernel.return_to_user(0);
        kernel.handle_fpu_trap(0).unwrap();
        let worker = kernel.current_thread(0).unwrap();
        assert!(!Arc::ptr_eq(&worker, &root.thread));
        kernel.release_fpu(&worker);
        assert!(kernel.fpu_owner(0).is_none());
    }
}
