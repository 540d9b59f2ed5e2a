//! Notification objects
//!
//! A counting semaphore with a FIFO wait list. Signals that find no waiter
//! are banked in `pending` and consumed by later waits.

use super::{Blocking, Wakeup};
use crate::cap::{Cap, CapRights};
use crate::error::{KResult, KernelError};
use crate::object::{Object, ObjectBody, ObjectType};
use crate::sched::thread::BlockedOn;
use crate::sched::ThreadState;
use crate::sync::ObjectLock;
use crate::{CpuId, Kernel};
use core::time::Duration;
use std::collections::VecDeque;
use std::sync::Arc;

pub(crate) struct NotifState {
    /// Signals not yet consumed
    pending: u64,
    waiters: VecDeque<Arc<Object>>,
    /// Cleared once stopped; never set again
    valid: bool,
}

impl NotifState {
    pub(crate) fn remove_waiter(&mut self, thread: &Arc<Object>) -> bool {
        match self.waiters.iter().position(|w| Arc::ptr_eq(w, thread)) {
            Some(pos) => {
                self.waiters.remove(pos);
                true
            }
            None => false,
        }
    }
}

/// Notification - counting signal plus FIFO waiters
pub struct Notification {
    pub(crate) state: ObjectLock<NotifState>,
}

impl Notification {
    pub fn new() -> Self {
        Self {
            state: ObjectLock::new(
                NotifState {
                    pending: 0,
                    waiters: VecDeque::new(),
                    valid: true,
                },
                "notification",
            ),
        }
    }

    /// Signals banked for future waits.
    pub fn pending_signals(&self) -> u64 {
        self.state.lock().pending
    }

    pub fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Waiters in wake order.
    pub fn waiters(&self) -> Vec<Arc<Object>> {
        self.state.lock().waiters.iter().cloned().collect()
    }

    pub fn is_valid(&self) -> bool {
        self.state.lock().valid
    }
}

impl Default for Notification {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel {
    /// Wake the oldest waiter, or bank the signal.
    pub(crate) fn signal_notification(&self, local: Option<CpuId>, notif: &Notification) -> KResult<()> {
        let mut state = notif.state.lock();
        if !state.valid {
            return Err(KernelError::BadCapability);
        }
        match state.waiters.pop_front() {
            Some(waiter) => self.wake_waiter(local, &waiter, Wakeup::status(Ok(0))),
            None => state.pending += 1,
        }
        Ok(())
    }

    /// Wake up to `max` waiters in FIFO order without banking a signal.
    pub(crate) fn wake_notification_waiters(
        &self,
        local: Option<CpuId>,
        notif: &Notification,
        max: usize,
    ) -> KResult<usize> {
        let mut state = notif.state.lock();
        if !state.valid {
            return Err(KernelError::BadCapability);
        }
        let count = max.min(state.waiters.len());
        let woken: Vec<Arc<Object>> = state.waiters.drain(..count).collect();
        for waiter in &woken {
            self.wake_waiter(local, waiter, Wakeup::status(Ok(0)));
        }
        Ok(count)
    }

    /// Consume a signal or block the current thread on `obj`.
    ///
    /// A zero timeout never blocks.
    pub(crate) fn wait_notification(
        &self,
        cpu: CpuId,
        obj: &Arc<Object>,
        is_block: bool,
        timeout: Option<Duration>,
    ) -> KResult<Blocking<()>> {
        self.wait_notification_with(cpu, obj, is_block, timeout, || {})
    }

    /// [`Kernel::wait_notification`], running `linked` once the caller sits
    /// on the wait list and before it switches away.
    pub(crate) fn wait_notification_with(
        &self,
        cpu: CpuId,
        obj: &Arc<Object>,
        is_block: bool,
        timeout: Option<Duration>,
        linked: impl FnOnce(),
    ) -> KResult<Blocking<()>> {
        let notif = obj.as_notification().ok_or(KernelError::BadCapability)?;
        let (thread, _) = self.current_group(cpu)?;
        let mut state = notif.state.lock();
        if !state.valid {
            return Err(KernelError::BadCapability);
        }
        if state.pending > 0 {
            state.pending -= 1;
            return Ok(Blocking::Done(()));
        }
        if !is_block || timeout.is_some_and(|d| d.is_zero()) {
            return Err(KernelError::WouldBlock);
        }

        self.block_current(cpu, &thread, BlockedOn::Notification(Arc::downgrade(obj)), timeout);
        state.waiters.push_back(thread.clone());
        log::trace!("{:?} waits on {:?}", thread.id(), obj.id());
        linked();
        self.sched(cpu);
        drop(state);
        self.drain_retired(cpu);
        Ok(Blocking::Blocked)
    }

    /// Move up to `limit` waiters of `src`, oldest first, to the tail of
    /// `dst` without waking them.
    pub(crate) fn requeue_notification(
        &self,
        src: &Arc<Object>,
        dst: &Arc<Object>,
        limit: usize,
    ) -> KResult<usize> {
        let from = src.as_notification().ok_or(KernelError::BadCapability)?;
        let to = dst.as_notification().ok_or(KernelError::BadCapability)?;
        if Arc::ptr_eq(src, dst) {
            return Ok(0);
        }
        // Same lock level: take them in address order.
        let (mut from_state, mut to_state) = if Arc::as_ptr(src) < Arc::as_ptr(dst) {
            let a = from.state.lock();
            let b = to.state.lock();
            (a, b)
        } else {
            let b = to.state.lock();
            let a = from.state.lock();
            (a, b)
        };
        if !to_state.valid {
            return Err(KernelError::BadCapability);
        }
        let take = limit.min(from_state.waiters.len());
        let moved: Vec<Arc<Object>> = from_state.waiters.drain(..take).collect();
        for waiter in &moved {
            if let Some(t) = waiter.as_thread() {
                t.ctl.lock().blocked_on = Some(BlockedOn::Notification(Arc::downgrade(dst)));
            }
        }
        let count = moved.len();
        to_state.waiters.extend(moved);
        log::trace!("requeued {} waiters {:?} -> {:?}", count, src.id(), dst.id());
        Ok(count)
    }

    /// Invalidate `notif` and fail every waiter with `BadCapability`.
    pub(crate) fn stop_notification(&self, local: Option<CpuId>, notif: &Notification) {
        let mut state = notif.state.lock();
        if !state.valid {
            return;
        }
        state.valid = false;
        state.pending = 0;
        let waiters: Vec<Arc<Object>> = state.waiters.drain(..).collect();
        for waiter in &waiters {
            self.wake_waiter(local, waiter, Wakeup::status(Err(KernelError::BadCapability)));
        }
    }

    pub(crate) fn notification_deinit(&self, notif: &Notification) {
        self.stop_notification(None, notif);
    }

    pub fn sys_create_notification(&self, cpu: CpuId) -> KResult<Cap> {
        let (_, group) = self.current_group(cpu)?;
        let obj = self.obj_alloc(ObjectBody::Notification(Notification::new()))?;
        self.cap_alloc(&group, obj, CapRights::ALL)
    }

    /// Wait on a notification cap of the caller.
    pub fn sys_wait(
        &self,
        cpu: CpuId,
        cap: Cap,
        is_block: bool,
        timeout: Option<Duration>,
    ) -> KResult<Blocking<()>> {
        let (_, group) = self.current_group(cpu)?;
        let obj = self.obj_get(&group, cap, ObjectType::Notification)?;
        self.wait_notification(cpu, obj.arc(), is_block, timeout)
    }

    pub fn sys_notify(&self, cpu: CpuId, cap: Cap) -> KResult<()> {
        let (_, group) = self.current_group(cpu)?;
        let obj = self.obj_get(&group, cap, ObjectType::Notification)?;
        let notif = obj.as_notification().ok_or(KernelError::BadCapability)?;
        self.signal_notification(Some(cpu), notif)
    }

    /// Hand all waiters of `src_cap` over to `dst_cap`.
    pub fn sys_requeue(&self, cpu: CpuId, src_cap: Cap, dst_cap: Cap) -> KResult<usize> {
        let (_, group) = self.current_group(cpu)?;
        let src = self.obj_get(&group, src_cap, ObjectType::Notification)?;
        let dst = self.obj_get(&group, dst_cap, ObjectType::Notification)?;
        self.requeue_notification(src.arc(), dst.arc(), usize::MAX)
    }
}

/// True when `thread` is parked on a notification right now.
pub(crate) fn waits_on_notification(thread: &Object) -> bool {
    thread.as_thread().is_some_and(|t| {
        let ctl = t.ctl.lock();
        ctl.state == ThreadState::Blocked && matches!(ctl.blocked_on, Some(BlockedOn::Notification(_)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::ThreadArgs;
    use crate::testutil::boot;

    /// Park `count` extra threads of the root group on `cap`, in order.
    fn park_waiters(kernel: &Kernel, cap: Cap, count: usize) -> Vec<Arc<Object>> {
        (0..count)
            .map(|_| {
                kernel.sys_create_thread(0, ThreadArgs::own(0x1000, 100)).unwrap();
                kernel.return_to_user(0);
                let t = kernel.current_thread(0).unwrap();
                assert!(kernel.sys_wait(0, cap, true, None).unwrap().is_blocked());
                t
            })
            .collect()
    }

    #[test]
    fn test_signal_before_wait_is_banked() {
        let (kernel, _root) = boot(1);
        let cap = kernel.sys_create_notification(0).unwrap();
        kernel.sys_notify(0, cap).unwrap();
        kernel.sys_notify(0, cap).unwrap();
        assert_eq!(kernel.sys_wait(0, cap, false, None), Ok(Blocking::Done(())));
        assert_eq!(kernel.sys_wait(0, cap, true, None), Ok(Blocking::Done(())));
        assert_eq!(kernel.sys_wait(0, cap, false, None), Err(KernelError::WouldBlock));
        assert_eq!(
            kernel.sys_wait(0, cap, true, Some(Duration::ZERO)),
            Err(KernelError::WouldBlock)
        );
    }

    #[test]
    fn test_fifo_wakeup() {
        let (kernel, root) = boot(1);
        let cap = kernel.sys_create_notification(0).unwrap();
        let waiters = park_waiters(&kernel, cap, 3);
        assert!(Arc::ptr_eq(&kernel.current_thread(0).unwrap(), &root.thread));
        let obj = kernel.obj_get(&root.group, cap, ObjectType::Notification).unwrap();
        assert_eq!(obj.as_notification().unwrap().waiter_count(), 3);
        for expected in &waiters {
            kernel.sys_notify(0, cap).unwrap();
            let queued = kernel.ready_snapshot(0);
            assert!(Arc::ptr_eq(queued.last().unwrap(), expected));
            assert_eq!(kernel.take_wakeup(expected).unwrap().status, Ok(0));
        }
        assert_eq!(obj.as_notification().unwrap().pending_signals(), 0);
    }

    #[test]
    fn test_wait_timeout() {
        let (kernel, root) = boot(1);
        let cap = kernel.sys_create_notification(0).unwrap();
        let blocked = kernel
            .sys_wait(0, cap, true, Some(Duration::from_millis(2)))
            .unwrap();
        assert!(blocked.is_blocked());
        let t = root.thread.as_thread().unwrap();
        assert!(t.has_timer());
        root.plat.advance(Duration::from_millis(2));
        kernel.handle_timer_irq(0);
        assert_eq!(t.state(), ThreadState::Running);
        assert!(!t.is_waiting());
        assert_eq!(kernel.take_wakeup(&root.thread).unwrap().status, Err(KernelError::Timeout));

        // The late signal is banked, not delivered to the departed waiter.
        kernel.sys_notify(0, cap).unwrap();
        let obj = kernel.obj_get(&root.group, cap, ObjectType::Notification).unwrap();
        assert_eq!(obj.as_notification().unwrap().pending_signals(), 1);
    }

    #[test]
    fn test_signal_beats_timeout() {
        let (kernel, root) = boot(1);
        let cap = kernel.sys_create_notification(0).unwrap();
        kernel.sys_create_thread(0, ThreadArgs::own(0x1000, 100)).unwrap();
        kernel.return_to_user(0);
        let t = kernel.current_thread(0).unwrap();
        kernel.sys_wait(0, cap, true, Some(Duration::from_millis(1))).unwrap();
        kernel.sys_notify(0, cap).unwrap();
        assert!(!t.as_thread().unwrap().has_timer());
        assert_eq!(kernel.pending_timers(0), 0);
        root.plat.advance(Duration::from_millis(5));
        kernel.handle_timer_irq(0);
        assert_eq!(kernel.take_wakeup(&t).unwrap().status, Ok(0));
    }

    #[test]
    fn test_requeue_moves_waiters_without_waking() {
        let (kernel, root) = boot(1);
        let a = kernel.sys_create_notification(0).unwrap();
        let b = kernel.sys_create_notification(0).unwrap();
        let waiters = park_waiters(&kernel, a, 2);
        assert_eq!(kernel.sys_requeue(0, a, b), Ok(2));
        let b_obj = kernel.obj_get(&root.group, b, ObjectType::Notification).unwrap();
        assert_eq!(b_obj.as_notification().unwrap().waiter_count(), 2);
        assert!(waiters.iter().all(|w| waits_on_notification(w)));

        kernel.sys_notify(0, a).unwrap();
        assert!(waiters.iter().all(|w| waits_on_notification(w)));
        kernel.sys_notify(0, b).unwrap();
        assert!(!waits_on_notification(&waiters[0]));
        assert!(waits_on_notification(&waiters[1]));
    }

    #[test]
    fn test_free_wakes_waiters_with_bad_capability() {
        let (kernel, root) = boot(1);
        let cap = kernel.sys_create_notification(0).unwrap();
        let waiters = park_waiters(&kernel, cap, 2);
        kernel.sys_revoke_cap(0, cap, false).unwrap();
        for w in &waiters {
            assert_eq!(w.as_thread().unwrap().state(), ThreadState::Ready);
            assert_eq!(kernel.take_wakeup(w).unwrap().status, Err(KernelError::BadCapability));
        }
        assert!(Arc::ptr_eq(&kernel.current_thread(0).unwrap(), &root.thread));
    }
}
