//! Scheduler subsystem
//!
//! ## Features
//!
//! - Per-core priority ready queues (256 levels, FIFO within a level)
//! - Budgeted round-robin (`pbrr`) or run-to-block (`pbfifo`) within a priority
//! - Cross-core wakeups through a reschedule IPI and a per-core flag
//! - Per-core timer queue for sleeps and wait timeouts
//! - Lazy FPU ownership tracking
//!
//! Scheduling decisions happen only at safe points: syscall return, the
//! timer interrupt, the reschedule IPI, and inside the blocking primitives.

mod fpu;
mod ready;
pub mod thread;
pub(crate) mod timer;

pub use ready::{PrioBitmap, ReadyQueue};
pub use thread::{ArchContext, SchedContext, Thread, ThreadArgs, ThreadKind, ThreadState};

use crate::error::{KResult, KernelError};
use crate::object::{Object, ObjectBody};
use crate::platform::RESCHED_IPI_VECTOR;
use crate::sync::QueueLock;
use crate::{bug_on, CpuId, Kernel};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thread::ThreadCtl;
use timer::TimerQueue;

/// Counters kept per core
#[derive(Default)]
pub struct CoreStats {
    pub switches: AtomicU64,
    pub ticks: AtomicU64,
    pub ipis_received: AtomicU64,
}

/// Snapshot of [`CoreStats`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CoreSnapshot {
    pub cpu: CpuId,
    pub switches: u64,
    pub ticks: u64,
    pub ipis_received: u64,
    pub ready: usize,
    pub timers: usize,
}

/// Scheduler state owned by one core
pub struct CoreLocalState {
    id: CpuId,
    pub(crate) current: QueueLock<Option<Arc<Object>>>,
    idle: Arc<Object>,
    pub(crate) ready: QueueLock<ReadyQueue>,
    pub(crate) sleepers: QueueLock<TimerQueue>,
    pub(crate) need_resched: AtomicBool,
    pub(crate) fpu_owner: QueueLock<Option<Arc<Object>>>,
    /// Page table currently installed, 0 before the first user switch
    active_pgtbl: AtomicU64,
    /// Exited threads waiting to be unlinked outside any lock
    retired: QueueLock<Vec<Arc<Object>>>,
    pub(crate) stats: CoreStats,
}

impl CoreLocalState {
    pub(crate) fn new(id: CpuId) -> Self {
        let idle = Object::new(ObjectBody::Thread(Thread::new_idle(id)));
        Self {
            id,
            current: QueueLock::new(Some(idle.clone()), "core_current"),
            idle,
            ready: QueueLock::new(ReadyQueue::new(), "ready_queue"),
            sleepers: QueueLock::new(TimerQueue::new(), "sleep_queue"),
            need_resched: AtomicBool::new(false),
            fpu_owner: QueueLock::new(None, "fpu_owner"),
            active_pgtbl: AtomicU64::new(0),
            retired: QueueLock::new(Vec::new(), "retired"),
            stats: CoreStats::default(),
        }
    }

    pub fn id(&self) -> CpuId {
        self.id
    }

    pub fn current_thread(&self) -> Option<Arc<Object>> {
        self.current.lock().clone()
    }

    pub fn idle_thread(&self) -> &Arc<Object> {
        &self.idle
    }

    pub(crate) fn request_resched(&self) {
        self.need_resched.store(true, Ordering::Release);
    }

    pub fn need_resched(&self) -> bool {
        self.need_resched.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> CoreSnapshot {
        CoreSnapshot {
            cpu: self.id,
            switches: self.stats.switches.load(Ordering::Relaxed),
            ticks: self.stats.ticks.load(Ordering::Relaxed),
            ipis_received: self.stats.ipis_received.load(Ordering::Relaxed),
            ready: self.ready.lock().len(),
            timers: self.sleepers.lock().len(),
        }
    }
}

impl Kernel {
    /// Make a thread Ready and queue it. Caller holds its thread lock.
    ///
    /// The target is the core the thread is still current on (a waker can
    /// race the tail of a blocking switch), else its affinity, else the core
    /// it last ran on. A remote target gets a reschedule IPI.
    pub(crate) fn enqueue_locked(
        &self,
        local: Option<CpuId>,
        thread: &Arc<Object>,
        ctl: &mut ThreadCtl,
        front: bool,
    ) {
        bug_on!(
            thread.as_thread().is_some_and(|t| t.kind() == ThreadKind::Idle),
            "idle thread {:?} enqueued",
            thread.id()
        );
        bug_on!(ctl.rq_cpu.is_some(), "double enqueue of {:?}", thread.id());
        let target = ctl.on_cpu.or(ctl.affinity).unwrap_or(ctl.cpu);
        ctl.state = ThreadState::Ready;
        ctl.rq_cpu = Some(target);
        {
            let mut rq = self.cores[target].ready.lock();
            if front {
                rq.enqueue_front(thread.clone(), ctl.sc.prio);
            } else {
                rq.enqueue(thread.clone(), ctl.sc.prio);
            }
        }
        log::trace!("enqueue {:?} on cpu {} prio {}", thread.id(), target, ctl.sc.prio);
        self.kick(local, target);
    }

    /// Core with the fewest ready threads; `local` wins ties.
    pub(crate) fn least_loaded_core(&self, local: CpuId) -> CpuId {
        let mut best = (self.cores[local].ready.lock().len(), local);
        for core in self.cores.iter().filter(|c| c.id != local) {
            let len = core.ready.lock().len();
            if len < best.0 {
                best = (len, core.id);
            }
        }
        best.1
    }

    /// Ask `target` to reschedule at its next safe point.
    pub(crate) fn kick(&self, local: Option<CpuId>, target: CpuId) {
        self.cores[target].request_resched();
        if local != Some(target) {
            self.platform.arch_send_ipi(target, RESCHED_IPI_VECTOR);
        }
    }

    /// Pick and switch to the next thread on `cpu`.
    ///
    /// The current thread keeps the core while it is Running and either
    /// outranks the best ready thread or ties with budget left. A thread
    /// flagged as exiting is never kept or dispatched. A thread pinned to
    /// another core is queued there once this core has switched away.
    pub(crate) fn sched(&self, cpu: CpuId) {
        let core = &self.cores[cpu];
        core.need_resched.store(false, Ordering::Release);
        let current = core.current_thread();
        let mut migrating = None;

        if let Some(cur) = current.as_ref().filter(|c| !Arc::ptr_eq(c, &core.idle)) {
            if let Some(t) = cur.as_thread() {
                let mut ctl = t.ctl.lock();
                if ctl.state == ThreadState::Running {
                    if ctl.exiting {
                        ctl.state = ThreadState::Exited;
                    } else if ctl.affinity.is_some_and(|a| a != cpu) {
                        // Off every queue until on_cpu is clear.
                        ctl.state = ThreadState::Ready;
                        migrating = Some(cur.clone());
                    } else {
                        let top = core.ready.lock().highest_prio();
                        let keep = match top {
                            None => true,
                            Some(top) => {
                                ctl.sc.prio > top || (ctl.sc.prio == top && ctl.sc.budget > 0)
                            }
                        };
                        if keep {
                            return;
                        }
                        // Preempted with budget left keeps its turn.
                        let front = ctl.sc.budget > 0;
                        self.enqueue_locked(Some(cpu), cur, &mut ctl, front);
                    }
                }
            }
        }

        loop {
            let next = core.ready.lock().pop_highest();
            let Some((thread, _)) = next else {
                self.switch_to(cpu, core.idle.clone());
                break;
            };
            let Some(t) = thread.as_thread() else {
                crate::kernel_bug!("non-thread {:?} on ready queue", thread.id());
            };
            {
                let mut ctl = t.ctl.lock();
                ctl.rq_cpu = None;
                if ctl.exiting {
                    ctl.state = ThreadState::Exited;
                    drop(ctl);
                    core.retired.lock().push(thread);
                    continue;
                }
                bug_on!(
                    ctl.state != ThreadState::Ready,
                    "dispatching {:?} in state {:?}",
                    thread.id(),
                    ctl.state
                );
                bug_on!(
                    ctl.on_cpu.is_some_and(|c| c != cpu),
                    "{:?} current on two cores",
                    thread.id()
                );
            }
            self.switch_to(cpu, thread);
            break;
        }
        core.need_resched.store(false, Ordering::Release);

        if let Some(thread) = migrating {
            if let Some(t) = thread.as_thread() {
                let mut ctl = t.ctl.lock();
                if ctl.state == ThreadState::Ready && ctl.rq_cpu.is_none() && ctl.on_cpu.is_none() {
                    log::trace!("migrate {:?} off cpu {}", thread.id(), cpu);
                    self.enqueue_locked(Some(cpu), &thread, &mut ctl, false);
                }
            }
        }
    }

    fn switch_to(&self, cpu: CpuId, next: Arc<Object>) {
        let core = &self.cores[cpu];
        let lazy_fpu = self.config.sched.lazy_fpu;
        let Some(t) = next.as_thread() else {
            return;
        };
        let pgtbl = t
            .vmspace()
            .and_then(|vm| vm.as_vmspace())
            .map(|vm| vm.pgtbl());
        let migrated_fpu = {
            let mut ctl = t.ctl.lock();
            ctl.state = ThreadState::Running;
            ctl.on_cpu = Some(cpu);
            ctl.cpu = cpu;
            if ctl.sc.budget == 0 {
                ctl.sc.budget = self.config.sched.default_budget;
            }
            match ctl.fpu_cpu {
                Some(other) if other != cpu => {
                    ctl.fpu_cpu = None;
                    Some(other)
                }
                _ => None,
            }
        };
        if let Some(other) = migrated_fpu {
            self.clear_fpu_owner(other, &next);
        }

        let prev = core.current.lock().replace(next.clone());
        if prev.as_ref().is_some_and(|p| Arc::ptr_eq(p, &next)) {
            return;
        }
        core.stats.switches.fetch_add(1, Ordering::Relaxed);
        log::trace!("cpu {} switch to {:?}", cpu, next.id());

        if let Some(pgtbl) = pgtbl {
            if core.active_pgtbl.swap(pgtbl.0, Ordering::AcqRel) != pgtbl.0 {
                self.platform.set_page_table(cpu, pgtbl);
            }
        }
        if !lazy_fpu && t.kind() == ThreadKind::User {
            self.take_fpu(cpu, &next);
        }

        if let Some(prev) = prev {
            if let Some(pt) = prev.as_thread() {
                let exited = {
                    let mut ctl = pt.ctl.lock();
                    if ctl.on_cpu == Some(cpu) {
                        ctl.on_cpu = None;
                    }
                    ctl.state == ThreadState::Exited && pt.kind() == ThreadKind::User
                };
                if exited {
                    core.retired.lock().push(prev);
                }
            }
        }
    }

    /// Unlink threads that exited on `cpu`. Runs with no locks held.
    pub(crate) fn drain_retired(&self, cpu: CpuId) {
        let retired = core::mem::take(&mut *self.cores[cpu].retired.lock());
        for thread in &retired {
            bug_on!(
                self.queue_membership(thread) != 0,
                "retired {:?} still queued",
                thread.id()
            );
            self.retire_thread(thread);
        }
    }

    /// Run the scheduler on `cpu` if a reschedule is pending.
    pub fn return_to_user(&self, cpu: CpuId) {
        if self.cores[cpu].need_resched() {
            self.sched(cpu);
        }
        self.drain_retired(cpu);
    }

    /// Reschedule IPI handler.
    pub fn handle_ipi(&self, cpu: CpuId) {
        let core = &self.cores[cpu];
        core.stats.ipis_received.fetch_add(1, Ordering::Relaxed);
        core.request_resched();
        self.return_to_user(cpu);
    }

    /// Unconditionally run the scheduler on `cpu`.
    pub fn reschedule(&self, cpu: CpuId) {
        self.sched(cpu);
        self.drain_retired(cpu);
    }

    /// Give up the rest of the slice.
    pub fn sys_yield(&self, cpu: CpuId) -> KResult<()> {
        let (thread, _) = self.current_group(cpu)?;
        if let Some(t) = thread.as_thread() {
            t.ctl.lock().sc.budget = 0;
        }
        self.sched(cpu);
        self.drain_retired(cpu);
        Ok(())
    }

    /// Thread current on `cpu` (the idle thread when nothing else runs).
    pub fn current_thread(&self, cpu: CpuId) -> Option<Arc<Object>> {
        self.cores.get(cpu)?.current_thread()
    }

    /// The calling user thread and its group.
    pub fn current_group(&self, cpu: CpuId) -> KResult<(Arc<Object>, Arc<Object>)> {
        let thread = self.current_thread(cpu).ok_or(KernelError::InvalidArgument)?;
        let t = thread.as_thread().ok_or(KernelError::BadState)?;
        if t.kind() == ThreadKind::Idle {
            return Err(KernelError::BadState);
        }
        let group = t.group().ok_or(KernelError::BadState)?;
        Ok((thread, group))
    }

    pub fn is_idle(&self, cpu: CpuId) -> bool {
        self.current_thread(cpu)
            .is_some_and(|t| Arc::ptr_eq(&t, &self.cores[cpu].idle))
    }

    pub fn core(&self, cpu: CpuId) -> &CoreLocalState {
        &self.cores[cpu]
    }

    pub fn cpu_count(&self) -> usize {
        self.cores.len()
    }

    /// Threads queued on `cpu`, highest priority first.
    pub fn ready_snapshot(&self, cpu: CpuId) -> Vec<Arc<Object>> {
        self.cores[cpu].ready.lock().snapshot()
    }

    /// Scheduler structures holding `thread` right now.
    ///
    /// Counts ready-queue membership, wait-queue linkage and pure sleeps.
    /// A timeout registration of a blocked wait is not counted separately.
    ///
    /// The thread lock is held throughout, so a concurrent wakeup is seen
    /// either before or after it moves the thread, never halfway.
    pub fn queue_membership(&self, thread: &Arc<Object>) -> usize {
        let Some(t) = thread.as_thread() else {
            return 0;
        };
        let ctl = t.ctl.lock();
        let waiting = ctl.blocked_on.is_some();
        let sleeping = ctl.state == ThreadState::Sleeping && ctl.timer.is_some();
        let ready = self
            .cores
            .iter()
            .filter(|core| core.ready.lock().contains(thread))
            .count();
        ready + usize::from(waiting) + usize::from(sleeping)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectType;
    use crate::testutil::boot;

    fn thread_obj(kernel: &Kernel, group: &Arc<Object>, cap: crate::cap::Cap) -> Arc<Object> {
        kernel.obj_get(group, cap, ObjectType::Thread).unwrap().arc().clone()
    }

    #[test]
    fn test_higher_priority_preempts_at_return() {
        let (kernel, root) = boot(1);
        let cap = kernel.sys_create_thread(0, ThreadArgs::own(0x1000, 50)).unwrap();
        let hi = thread_obj(&kernel, &root.group, cap);
        assert!(kernel.core(0).need_resched());
        kernel.return_to_user(0);
        assert!(Arc::ptr_eq(&kernel.current_thread(0).unwrap(), &hi));
        assert_eq!(root.thread.as_thread().unwrap().state(), ThreadState::Ready);
    }

    #[test]
    fn test_lower_priority_does_not_preempt() {
        let (kernel, root) = boot(1);
        kernel.sys_create_thread(0, ThreadArgs::own(0x1000, 3)).unwrap();
        kernel.return_to_user(0);
        assert!(Arc::ptr_eq(&kernel.current_thread(0).unwrap(), &root.thread));
    }

    #[test]
    fn test_new_threads_spread_over_cores() {
        let (kernel, root) = boot(2);
        let caps: Vec<_> = (0..4)
            .map(|_| kernel.sys_create_thread(0, ThreadArgs::own(0x1000, 10)).unwrap())
            .collect();
        assert_eq!(kernel.ready_snapshot(0).len(), 2);
        assert_eq!(kernel.ready_snapshot(1).len(), 2);
        assert!(root.plat.ipis_to(1) >= 1);

        kernel.handle_ipi(1);
        let picked = kernel.current_thread(1).unwrap();
        assert!(!kernel.is_idle(1));
        assert!(caps
            .iter()
            .any(|&cap| Arc::ptr_eq(&thread_obj(&kernel, &root.group, cap), &picked)));
        assert_eq!(picked.as_thread().unwrap().cpu(), 1);
        assert!(Arc::ptr_eq(&kernel.current_thread(0).unwrap(), &root.thread));
    }

    #[test]
    fn test_pinned_thread_ignores_load() {
        let (kernel, _root) = boot(2);
        for _ in 0..3 {
            kernel
                .sys_create_thread(0, ThreadArgs::own(0x1000, 10).with_affinity(0))
                .unwrap();
        }
        assert_eq!(kernel.ready_snapshot(0).len(), 3);
        assert!(kernel.ready_snapshot(1).is_empty());
    }

    #[test]
    fn test_remote_wakeup_sends_ipi() {
        let (kernel, root) = boot(2);
        let cap = kernel
            .sys_create_thread(0, ThreadArgs::own(0x1000, 10).with_affinity(1))
            .unwrap();
        let t = thread_obj(&kernel, &root.group, cap);
        assert_eq!(root.plat.ipis_to(1), 1);
        assert!(kernel.core(1).need_resched());
        assert!(kernel.is_idle(1));
        kernel.handle_ipi(1);
        assert!(Arc::ptr_eq(&kernel.current_thread(1).unwrap(), &t));
        assert_eq!(kernel.core(1).snapshot().ipis_received, 1);
    }

    #[test]
    fn test_yield_round_robin() {
        let (kernel, root) = boot(1);
        let prio = root.thread.as_thread().unwrap().prio();
        let cap = kernel.sys_create_thread(0, ThreadArgs::own(0x1000, prio)).unwrap();
        let other = thread_obj(&kernel, &root.group, cap);
        kernel.sys_yield(0).unwrap();
        assert!(Arc::ptr_eq(&kernel.current_thread(0).unwrap(), &other));
        kernel.sys_yield(0).unwrap();
        assert!(Arc::ptr_eq(&kernel.current_thread(0).unwrap(), &root.thread));
    }

    #[test]
    fn test_yield_alone_keeps_core() {
        let (kernel, root) = boot(1);
        kernel.sys_yield(0).unwrap();
        assert!(Arc::ptr_eq(&kernel.current_thread(0).unwrap(), &root.thread));
        assert_eq!(root.thread.as_thread().unwrap().budget(), 0);
    }

    #[test]
    fn test_page_table_switch_on_group_change() {
        let (kernel, root) = boot(1);
        let child = crate::testutil::spawn_group(&kernel, 0, "child", 3);
        kernel
            .sys_create_thread(
                0,
                ThreadArgs {
                    cap_group: child.cap,
                    pc: 0,
                    sp: 0,
                    arg: 0,
                    prio: 100,
                    affinity: None,
                },
            )
            .unwrap();
        let before = root.plat.record().page_table_switches.len();
        kernel.return_to_user(0);
        let switches = root.plat.record().page_table_switches;
        assert_eq!(switches.len(), before + 1);
        let child_vm = kernel.group_vmspace(&child.group).unwrap();
        assert_eq!(switches.last().unwrap().1, child_vm.as_vmspace().unwrap().pgtbl());
    }

    #[test]
    fn test_exiting_thread_is_never_dispatched() {
        let (kernel, root) = boot(1);
        let cap = kernel.sys_create_thread(0, ThreadArgs::own(0x1000, 50)).unwrap();
        let t = thread_obj(&kernel, &root.group, cap);
        t.as_thread().unwrap().ctl.lock().exiting = true;
        kernel.return_to_user(0);
        assert!(Arc::ptr_eq(&kernel.current_thread(0).unwrap(), &root.thread));
        assert_eq!(t.as_thread().unwrap().state(), ThreadState::Exited);
    }
}
