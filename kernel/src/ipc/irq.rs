//! IRQ notifications
//!
//! A user driver binds an interrupt line to a notification it can wait on.
//! The line is masked when it fires and stays masked until the driver acks,
//! so an unacknowledged interrupt is never delivered twice. Firings that
//! arrive while masked are remembered and delivered on ack.

use super::{Blocking, Notification};
use crate::cap::{Cap, CapRights};
use crate::error::{KResult, KernelError};
use crate::object::{Object, ObjectBody, ObjectType};
use crate::{CpuId, Kernel};
use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Highest interrupt line that can be bound
pub const MAX_IRQ: u32 = 1024;

/// Interrupt line bound to a notification
pub struct IrqNotification {
    irq: u32,
    notif: Notification,
    masked: AtomicBool,
    /// Fired while masked
    pending: AtomicBool,
}

impl IrqNotification {
    pub fn irq(&self) -> u32 {
        self.irq
    }

    pub fn notification(&self) -> &Notification {
        &self.notif
    }

    pub fn is_masked(&self) -> bool {
        self.masked.load(Ordering::Acquire)
    }
}

impl Kernel {
    /// Bind `irq` to a new notification owned by the caller.
    pub fn sys_irq_register(&self, cpu: CpuId, irq: u32) -> KResult<Cap> {
        if irq >= MAX_IRQ {
            return Err(KernelError::InvalidArgument);
        }
        let (_, group) = self.current_group(cpu)?;
        let mut table = self.irqs.lock();
        if table.get(&irq).and_then(|w| w.upgrade()).is_some_and(|o| o.is_alive()) {
            return Err(KernelError::BadState);
        }
        let obj = self.obj_alloc(ObjectBody::Irq(IrqNotification {
            irq,
            notif: Notification::new(),
            masked: AtomicBool::new(false),
            pending: AtomicBool::new(false),
        }))?;
        table.insert(irq, Arc::downgrade(&obj));
        drop(table);
        log::debug!("irq {} bound to {:?}", irq, obj.id());
        self.cap_alloc(&group, obj, CapRights::ALL)
    }

    /// Wait for the bound interrupt.
    pub fn sys_irq_wait(&self, cpu: CpuId, irq_cap: Cap, is_block: bool) -> KResult<Blocking<()>> {
        let (_, group) = self.current_group(cpu)?;
        let obj = self.obj_get(&group, irq_cap, ObjectType::Irq)?;
        self.wait_notification(cpu, obj.arc(), is_block, None)
    }

    /// Unmask the line; a firing seen while masked is delivered now.
    pub fn sys_irq_ack(&self, cpu: CpuId, irq_cap: Cap) -> KResult<()> {
        let (_, group) = self.current_group(cpu)?;
        let obj = self.obj_get(&group, irq_cap, ObjectType::Irq)?;
        let irq = obj.as_irq().ok_or(KernelError::BadCapability)?;
        if irq.pending.swap(false, Ordering::AcqRel) {
            // Stays masked: the re-delivery needs its own ack.
            return self.signal_notification(Some(cpu), &irq.notif);
        }
        irq.masked.store(false, Ordering::Release);
        Ok(())
    }

    /// Interrupt `irq` arrived on `cpu`.
    ///
    /// Returns false for a line nobody has bound.
    pub fn handle_irq(&self, cpu: CpuId, irq: u32) -> bool {
        let obj: Option<Arc<Object>> = self.irqs.lock().get(&irq).and_then(|w| w.upgrade());
        let Some(obj) = obj.filter(|o| o.is_alive()) else {
            log::warn!("spurious irq {} on cpu {}", irq, cpu);
            return false;
        };
        let Some(binding) = obj.as_irq() else {
            return false;
        };
        if binding.masked.swap(true, Ordering::AcqRel) {
            binding.pending.store(true, Ordering::Release);
            log::trace!("irq {} fired while masked", irq);
        } else if let Err(e) = self.signal_notification(Some(cpu), &binding.notif) {
            log::debug!("irq {} dropped: {}", irq, e);
        }
        self.return_to_user(cpu);
        true
    }

    pub(crate) fn irq_deinit(&self, irq: &IrqNotification) {
        let mut table = self.irqs.lock();
        if table.get(&irq.irq).is_some_and(|w| w.upgrade().map_or(true, |o| !o.is_alive())) {
            table.remove(&irq.irq);
        }
        drop(table);
        self.stop_notification(None, &irq.notif);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::{ThreadArgs, ThreadState};
    use crate::testutil::boot;

    #[test]
    fn test_register_once_per_line() {
        let (kernel, _root) = boot(1);
        kernel.sys_irq_register(0, 33).unwrap();
        assert_eq!(kernel.sys_irq_register(0, 33), Err(KernelError::BadState));
        assert_eq!(kernel.sys_irq_register(0, MAX_IRQ), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn test_masked_until_ack() {
        let (kernel, _root) = boot(1);
        let cap = kernel.sys_irq_register(0, 7).unwrap();
        assert!(kernel.handle_irq(0, 7));
        assert!(kernel.handle_irq(0, 7));
        assert_eq!(kernel.sys_irq_wait(0, cap, false), Ok(Blocking::Done(())));
        // The second firing waits for the ack.
        assert_eq!(kernel.sys_irq_wait(0, cap, false), Err(KernelError::WouldBlock));
        kernel.sys_irq_ack(0, cap).unwrap();
        assert_eq!(kernel.sys_irq_wait(0, cap, false), Ok(Blocking::Done(())));
        kernel.sys_irq_ack(0, cap).unwrap();
        assert_eq!(kernel.sys_irq_wait(0, cap, false), Err(KernelError::WouldBlock));
        assert!(!kernel.handle_irq(0, 8));
    }

    #[test]
    fn test_irq_wakes_blocked_driver() {
        let (kernel, _root) = boot(1);
        let cap = kernel.sys_irq_register(0, 12).unwrap();
        kernel.sys_create_thread(0, ThreadArgs::own(0x1000, 200)).unwrap();
        kernel.return_to_user(0);
        let driver = kernel.current_thread(0).unwrap();
        assert!(kernel.sys_irq_wait(0, cap, true).unwrap().is_blocked());
        assert_eq!(driver.as_thread().unwrap().state(), ThreadState::Blocked);
        kernel.handle_irq(0, 12);
        assert!(Arc::ptr_eq(&kernel.current_thread(0).unwrap(), &driver));
        assert_eq!(kernel.take_wakeup(&driver).unwrap().status, Ok(0));
    }

    #[test]
    fn test_free_unbinds_line() {
        let (kernel, _root) = boot(1);
        let cap = kernel.sys_irq_register(0, 40).unwrap();
        kernel.sys_revoke_cap(0, cap, false).unwrap();
        assert!(!kernel.handle_irq(0, 40));
        kernel.sys_irq_register(0, 40).unwrap();
    }
}
