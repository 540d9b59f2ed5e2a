//! Per-core timer queue
//!
//! Holds pure sleeps and the timeouts of blocked waits, keyed by deadline
//! tick. A registration is also recorded in the thread's control block;
//! whoever clears that record under the thread lock owns the wakeup, so a
//! timeout racing a signal resolves to exactly one winner.

use super::thread::{ThreadCtl, ThreadState};
use crate::config::SchedPolicy;
use crate::error::{KResult, KernelError};
use crate::ipc::{Blocking, Wakeup};
use crate::object::Object;
use crate::{CpuId, Kernel};
use core::sync::atomic::Ordering;
use core::time::Duration;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Identity of one timer registration
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerKey {
    pub(crate) deadline: u64,
    pub(crate) seq: u64,
    pub(crate) cpu: CpuId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TimerKind {
    Sleep,
    Timeout,
}

pub(crate) struct TimerEntry {
    pub(crate) thread: Arc<Object>,
    pub(crate) kind: TimerKind,
}

/// Deadline-ordered timer registrations of one core
pub(crate) type TimerQueue = BTreeMap<(u64, u64), TimerEntry>;

impl Kernel {
    /// Tick at which `after` has elapsed.
    pub(crate) fn deadline_after(&self, after: Duration) -> u64 {
        let ticks = (after.as_micros() as u64).saturating_mul(self.platform.ticks_per_us());
        self.platform.current_tick().saturating_add(ticks)
    }

    /// Register a timer for `thread` on `cpu`. Caller holds the thread lock.
    pub(crate) fn register_timer(
        &self,
        cpu: CpuId,
        thread: &Arc<Object>,
        ctl: &mut ThreadCtl,
        deadline: u64,
        kind: TimerKind,
    ) {
        crate::bug_on!(ctl.timer.is_some(), "thread {:?} already has a timer", thread.id());
        let seq = self.timer_seq.fetch_add(1, Ordering::Relaxed);
        let key = TimerKey { deadline, seq, cpu };
        self.cores[cpu].sleepers.lock().insert(
            (deadline, seq),
            TimerEntry {
                thread: thread.clone(),
                kind,
            },
        );
        ctl.timer = Some(key);
    }

    /// Drop the thread's registration, if it still has one.
    pub(crate) fn cancel_timer(&self, ctl: &mut ThreadCtl) {
        if let Some(key) = ctl.timer.take() {
            self.cores[key.cpu].sleepers.lock().remove(&(key.deadline, key.seq));
        }
    }

    /// Sleep the calling thread for `duration`. A zero duration yields.
    pub fn sys_sleep(&self, cpu: CpuId, duration: Duration) -> KResult<Blocking<()>> {
        if duration.is_zero() {
            self.sys_yield(cpu)?;
            return Ok(Blocking::Done(()));
        }
        let (thread, _) = self.current_group(cpu)?;
        let t = thread.as_thread().ok_or(KernelError::BadState)?;
        let deadline = self.deadline_after(duration);
        {
            let mut ctl = t.ctl.lock();
            ctl.state = ThreadState::Sleeping;
            self.register_timer(cpu, &thread, &mut ctl, deadline, TimerKind::Sleep);
        }
        log::trace!("thread {:?} sleeps until tick {}", thread.id(), deadline);
        self.sched(cpu);
        self.drain_retired(cpu);
        Ok(Blocking::Blocked)
    }

    /// Fire every registration on `cpu` whose deadline has passed.
    ///
    /// Due entries leave the queue before any callback runs.
    pub(crate) fn expire_timers(&self, cpu: CpuId) -> usize {
        let now = self.platform.current_tick();
        let due = {
            let mut queue = self.cores[cpu].sleepers.lock();
            let later = queue.split_off(&(now.saturating_add(1), 0));
            core::mem::replace(&mut *queue, later)
        };
        let fired = due.len();
        for ((deadline, seq), entry) in due {
            let key = TimerKey { deadline, seq, cpu };
            match entry.kind {
                TimerKind::Sleep => self.wake_sleeper(cpu, &entry.thread, key),
                TimerKind::Timeout => {
                    if self.cancel_wait(Some(cpu), &entry.thread, Some(key)) {
                        log::trace!("wait of {:?} timed out", entry.thread.id());
                    }
                }
            }
        }
        fired
    }

    fn wake_sleeper(&self, cpu: CpuId, thread: &Arc<Object>, key: TimerKey) {
        let Some(t) = thread.as_thread() else {
            return;
        };
        let mut ctl = t.ctl.lock();
        if ctl.timer != Some(key) || ctl.state != ThreadState::Sleeping {
            return;
        }
        ctl.timer = None;
        ctl.wakeup = Some(Wakeup::status(Ok(0)));
        self.enqueue_locked(Some(cpu), thread, &mut ctl, false);
    }

    /// Timer interrupt on `cpu`.
    ///
    /// Expires due timers, charges the running thread one tick of budget,
    /// reschedules if needed and programs the next interrupt.
    pub fn handle_timer_irq(&self, cpu: CpuId) {
        let core = &self.cores[cpu];
        core.stats.ticks.fetch_add(1, Ordering::Relaxed);
        self.expire_timers(cpu);

        if let Some(current) = core.current_thread() {
            if let Some(t) = current.as_thread() {
                let mut ctl = t.ctl.lock();
                if t.kind() == super::ThreadKind::User && ctl.state == ThreadState::Running {
                    if self.config.sched.policy == SchedPolicy::Pbrr {
                        ctl.sc.budget = ctl.sc.budget.saturating_sub(1);
                    }
                    if ctl.sc.budget == 0 || ctl.exiting {
                        core.request_resched();
                    }
                }
            }
        }

        if core.need_resched.load(Ordering::Acquire) {
            self.sched(cpu);
        }
        self.drain_retired(cpu);
        self.program_timer(cpu);
    }

    /// Arm the next tick: one period, or sooner if a timer is due first.
    fn program_timer(&self, cpu: CpuId) {
        let period = self.config.sched.tick_us.saturating_mul(self.platform.ticks_per_us());
        let now = self.platform.current_tick();
        let next_due = self.cores[cpu]
            .sleepers
            .lock()
            .keys()
            .next()
            .map(|(deadline, _)| deadline.saturating_sub(now));
        let ticks = next_due.map_or(period, |due| due.min(period)).max(1);
        self.platform.plat_set_next_timer(cpu, ticks);
    }

    /// Registrations pending on `cpu`.
    pub fn pending_timers(&self, cpu: CpuId) -> usize {
        self.cores[cpu].sleepers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::ThreadArgs;
    use crate::testutil::boot;

    #[test]
    fn test_sleep_and_wake() {
        let (kernel, root) = boot(1);
        let blocked = kernel.sys_sleep(0, Duration::from_millis(5)).unwrap();
        assert!(matches!(blocked, Blocking::Blocked));
        let t = root.thread.as_thread().unwrap();
        assert_eq!(t.state(), ThreadState::Sleeping);
        assert!(kernel.is_idle(0));

        root.plat.advance(Duration::from_millis(4));
        kernel.handle_timer_irq(0);
        assert_eq!(t.state(), ThreadState::Sleeping);

        root.plat.advance(Duration::from_millis(1));
        kernel.handle_timer_irq(0);
        assert_eq!(t.state(), ThreadState::Running);
        assert!(Arc::ptr_eq(&kernel.current_thread(0).unwrap(), &root.thread));
        assert_eq!(kernel.take_wakeup(&root.thread).unwrap().status, Ok(0));
        assert_eq!(kernel.pending_timers(0), 0);
    }

    #[test]
    fn test_timer_programmed_for_earliest_deadline() {
        let (kernel, root) = boot(1);
        kernel.sys_sleep(0, Duration::from_micros(300)).unwrap();
        kernel.handle_timer_irq(0);
        let programs = root.plat.record().timer_programs;
        assert_eq!(programs.last(), Some(&(0, 300)));
    }

    #[test]
    fn test_budget_expiry_rotates_equal_priority() {
        let (kernel, root) = boot(1);
        let prio = root.thread.as_thread().unwrap().prio();
        kernel.sys_create_thread(0, ThreadArgs::own(0x1000, prio)).unwrap();
        // Default budget is one tick.
        kernel.handle_timer_irq(0);
        assert!(!Arc::ptr_eq(&kernel.current_thread(0).unwrap(), &root.thread));
        assert_eq!(root.thread.as_thread().unwrap().state(), ThreadState::Ready);
    }
}
