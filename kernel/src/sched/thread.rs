//! Thread management

use crate::cap::{Cap, CapRights, CAP_GROUP_SLOT};
use crate::config::MAX_PRIO;
use crate::error::{KResult, KernelError};
use crate::ipc::channel::ClientMsg;
use crate::ipc::{SrcMsgInfo, Wakeup};
use crate::object::{Object, ObjectBody, ObjectType};
use crate::sync::ThreadLock;
use crate::{CpuId, Kernel};
use std::sync::{Arc, Weak};

use super::timer::TimerKey;

/// Thread state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadState {
    /// On a ready queue
    Ready,
    /// Current on some core
    Running,
    /// Waiting on a notification or channel, possibly with a timeout
    Blocked,
    /// Pure sleep on a core's timer queue
    Sleeping,
    /// Will never run again
    Exited,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadKind {
    User,
    /// Per-core fallback; never queued, never exits
    Idle,
}

/// Scheduling context
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SchedContext {
    pub prio: usize,
    /// Ticks left in the current slice
    pub budget: u32,
}

/// Saved user entry state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ArchContext {
    pub pc: u64,
    pub sp: u64,
    pub arg: u64,
}

/// What a blocked thread is linked into
#[derive(Clone)]
pub(crate) enum BlockedOn {
    Notification(Weak<Object>),
    /// Server waiting in `receive`
    ChannelRecv { channel: Weak<Object>, hdl: Arc<Object> },
    /// Client waiting for a reply
    ChannelCall(Arc<ClientMsg>),
}

impl BlockedOn {
    pub(crate) fn same(&self, other: &BlockedOn) -> bool {
        match (self, other) {
            (BlockedOn::Notification(a), BlockedOn::Notification(b)) => a.ptr_eq(b),
            (BlockedOn::ChannelRecv { hdl: a, .. }, BlockedOn::ChannelRecv { hdl: b, .. }) => {
                Arc::ptr_eq(a, b)
            }
            (BlockedOn::ChannelCall(a), BlockedOn::ChannelCall(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Mutable thread state, guarded by the thread lock
pub struct ThreadCtl {
    pub(crate) state: ThreadState,
    /// Exit requested; honoured at the next scheduling point
    pub(crate) exiting: bool,
    /// Unlinked from its group; set once
    pub(crate) retired: bool,
    pub(crate) sc: SchedContext,
    pub(crate) affinity: Option<CpuId>,
    /// Core it last ran on
    pub(crate) cpu: CpuId,
    /// Core it is current on right now
    pub(crate) on_cpu: Option<CpuId>,
    /// Core whose ready queue holds it
    pub(crate) rq_cpu: Option<CpuId>,
    /// Core holding its live FPU registers
    pub(crate) fpu_cpu: Option<CpuId>,
    pub(crate) ctx: ArchContext,
    pub(crate) blocked_on: Option<BlockedOn>,
    pub(crate) timer: Option<TimerKey>,
    pub(crate) wakeup: Option<Wakeup>,
}

/// Thread control block
pub struct Thread {
    group: Weak<Object>,
    /// Holds one reference on the group's vmspace
    vmspace: Option<Arc<Object>>,
    kind: ThreadKind,
    tid: u32,
    pub(crate) ctl: ThreadLock<ThreadCtl>,
}

impl Thread {
    pub(crate) fn new_idle(cpu: CpuId) -> Self {
        Self {
            group: Weak::new(),
            vmspace: None,
            kind: ThreadKind::Idle,
            tid: 0,
            ctl: ThreadLock::new(
                ThreadCtl {
                    state: ThreadState::Running,
                    exiting: false,
                    retired: false,
                    sc: SchedContext { prio: crate::config::IDLE_PRIO, budget: 0 },
                    affinity: Some(cpu),
                    cpu,
                    on_cpu: Some(cpu),
                    rq_cpu: None,
                    fpu_cpu: None,
                    ctx: ArchContext::default(),
                    blocked_on: None,
                    timer: None,
                    wakeup: None,
                },
                "idle_thread",
            ),
        }
    }

    pub fn kind(&self) -> ThreadKind {
        self.kind
    }

    pub fn tid(&self) -> u32 {
        self.tid
    }

    /// Owning group, unless it is already gone.
    pub fn group(&self) -> Option<Arc<Object>> {
        self.group.upgrade()
    }

    pub fn vmspace(&self) -> Option<&Arc<Object>> {
        self.vmspace.as_ref()
    }

    pub fn state(&self) -> ThreadState {
        self.ctl.lock().state
    }

    pub fn prio(&self) -> usize {
        self.ctl.lock().sc.prio
    }

    pub fn budget(&self) -> u32 {
        self.ctl.lock().sc.budget
    }

    pub fn affinity(&self) -> Option<CpuId> {
        self.ctl.lock().affinity
    }

    /// Core the thread last ran on.
    pub fn cpu(&self) -> CpuId {
        self.ctl.lock().cpu
    }

    pub fn is_exiting(&self) -> bool {
        self.ctl.lock().exiting
    }

    pub fn context(&self) -> ArchContext {
        self.ctl.lock().ctx
    }

    /// True while the thread is linked into a wait queue.
    pub fn is_waiting(&self) -> bool {
        self.ctl.lock().blocked_on.is_some()
    }

    /// True while a sleep or timeout is registered.
    pub fn has_timer(&self) -> bool {
        self.ctl.lock().timer.is_some()
    }
}

/// Parameters for a new thread
#[derive(Clone, Copy, Debug)]
pub struct ThreadArgs {
    /// Group the thread runs in, as a cap of the caller
    pub cap_group: Cap,
    pub pc: u64,
    pub sp: u64,
    pub arg: u64,
    pub prio: usize,
    pub affinity: Option<CpuId>,
}

impl ThreadArgs {
    /// A thread of the caller's own group.
    pub fn own(pc: u64, prio: usize) -> Self {
        Self {
            cap_group: CAP_GROUP_SLOT,
            pc,
            sp: 0,
            arg: 0,
            prio,
            affinity: None,
        }
    }

    pub fn with_affinity(mut self, cpu: CpuId) -> Self {
        self.affinity = Some(cpu);
        self
    }
}

impl Kernel {
    fn check_prio(prio: usize) -> KResult<()> {
        if (1..=MAX_PRIO).contains(&prio) {
            Ok(())
        } else {
            Err(KernelError::InvalidArgument)
        }
    }

    fn check_affinity(&self, affinity: Option<CpuId>) -> KResult<()> {
        match affinity {
            Some(cpu) if cpu >= self.cores.len() => Err(KernelError::InvalidArgument),
            _ => Ok(()),
        }
    }

    /// Build a thread object in `group`. The caller owns the returned reference.
    pub(crate) fn new_thread(
        &self,
        group: &Arc<Object>,
        ctx: ArchContext,
        prio: usize,
        affinity: Option<CpuId>,
    ) -> KResult<Arc<Object>> {
        Self::check_prio(prio)?;
        self.check_affinity(affinity)?;
        let cap_group = group.as_cap_group().ok_or(KernelError::BadCapability)?;
        if cap_group.has_exited() {
            return Err(KernelError::BadState);
        }
        let vmspace = self.group_vmspace(group)?;
        self.obj_ref(&vmspace);
        let thread = Thread {
            group: Arc::downgrade(group),
            vmspace: Some(vmspace.clone()),
            kind: ThreadKind::User,
            tid: cap_group.next_tid(),
            ctl: ThreadLock::new(
                ThreadCtl {
                    state: ThreadState::Exited,
                    exiting: false,
                    retired: false,
                    sc: SchedContext {
                        prio,
                        budget: self.config.sched.default_budget,
                    },
                    affinity,
                    cpu: affinity.unwrap_or(0),
                    on_cpu: None,
                    rq_cpu: None,
                    fpu_cpu: None,
                    ctx,
                    blocked_on: None,
                    timer: None,
                    wakeup: None,
                },
                "thread_ctl",
            ),
        };
        match self.obj_alloc(ObjectBody::Thread(thread)) {
            Ok(obj) => Ok(obj),
            Err(e) => {
                self.obj_put(&vmspace);
                Err(e)
            }
        }
    }

    /// Create a thread in the group named by `args.cap_group` and make it Ready.
    ///
    /// The thread's cap lands in the target group; when that is not the
    /// caller's group a copy is also placed in the caller's table and returned.
    pub fn sys_create_thread(&self, cpu: CpuId, args: ThreadArgs) -> KResult<Cap> {
        let (_, current) = self.current_group(cpu)?;
        let target = self.obj_get(&current, args.cap_group, ObjectType::CapGroup)?;
        let ctx = ArchContext {
            pc: args.pc,
            sp: args.sp,
            arg: args.arg,
        };
        let thread = self.new_thread(target.arc(), ctx, args.prio, args.affinity)?;
        let cap_in_target = self.cap_alloc(target.arc(), thread.clone(), CapRights::ALL)?;
        let cap = if Arc::ptr_eq(target.arc(), &current) {
            cap_in_target
        } else {
            match self.cap_copy(target.arc(), &current, cap_in_target, false, CapRights::ALL) {
                Ok(cap) => cap,
                Err(e) => {
                    if let Err(undo) = self.cap_free(target.arc(), cap_in_target) {
                        log::warn!("undoing thread cap {:?} failed: {}", cap_in_target, undo);
                    }
                    return Err(e);
                }
            }
        };
        self.start_thread(Some(cpu), target.arc(), &thread);
        log::debug!("thread {:?} created on cpu {}", thread.id(), cpu);
        Ok(cap)
    }

    /// Link a new thread into its group and queue it.
    ///
    /// An unpinned thread starts on the core with the shortest ready queue,
    /// preferring the creating core on a tie.
    pub(crate) fn start_thread(&self, local: Option<CpuId>, group: &Arc<Object>, thread: &Arc<Object>) {
        if let Some(cap_group) = group.as_cap_group() {
            cap_group.link_thread(thread.clone());
        }
        let Some(t) = thread.as_thread() else {
            return;
        };
        let mut ctl = t.ctl.lock();
        if let (None, Some(cpu)) = (ctl.affinity, local) {
            ctl.cpu = self.least_loaded_core(cpu);
        }
        self.enqueue_locked(local, thread, &mut ctl, false);
    }

    /// Terminate the calling thread.
    ///
    /// The last thread of a group takes the group down with exit code 0.
    pub fn sys_thread_exit(&self, cpu: CpuId) -> KResult<()> {
        let (thread, _) = self.current_group(cpu)?;
        if let Some(t) = thread.as_thread() {
            let mut ctl = t.ctl.lock();
            ctl.exiting = true;
            ctl.state = ThreadState::Exited;
        }
        self.sched(cpu);
        self.drain_retired(cpu);
        Ok(())
    }

    fn thread_by_cap(&self, cpu: CpuId, cap: Cap) -> KResult<Arc<Object>> {
        let (_, group) = self.current_group(cpu)?;
        let guard = self.obj_get(&group, cap, ObjectType::Thread)?;
        Ok(guard.arc().clone())
    }

    /// Change a thread's priority; a queued thread moves to its new level.
    pub fn sys_set_prio(&self, cpu: CpuId, thread_cap: Cap, prio: usize) -> KResult<()> {
        Self::check_prio(prio)?;
        let thread = self.thread_by_cap(cpu, thread_cap)?;
        let t = thread.as_thread().ok_or(KernelError::BadCapability)?;
        let mut ctl = t.ctl.lock();
        ctl.sc.prio = prio;
        self.requeue_ready(cpu, &thread, &mut ctl);
        if ctl.on_cpu.is_some_and(|c| c == cpu) {
            self.cores[cpu].request_resched();
        }
        Ok(())
    }

    /// Pin a thread to a core, or unpin it with `None`.
    pub fn sys_set_affinity(&self, cpu: CpuId, thread_cap: Cap, affinity: Option<CpuId>) -> KResult<()> {
        self.check_affinity(affinity)?;
        let thread = self.thread_by_cap(cpu, thread_cap)?;
        let t = thread.as_thread().ok_or(KernelError::BadCapability)?;
        let mut ctl = t.ctl.lock();
        ctl.affinity = affinity;
        self.requeue_ready(cpu, &thread, &mut ctl);
        if let (Some(on), Some(want)) = (ctl.on_cpu, affinity) {
            if on != want {
                // Migrates at its next scheduling point.
                self.kick(Some(cpu), on);
            }
        }
        Ok(())
    }

    pub fn sys_get_affinity(&self, cpu: CpuId, thread_cap: Cap) -> KResult<Option<CpuId>> {
        let thread = self.thread_by_cap(cpu, thread_cap)?;
        let t = thread.as_thread().ok_or(KernelError::BadCapability)?;
        Ok(t.affinity())
    }

    /// Pull a Ready thread off its queue and queue it again under new parameters.
    fn requeue_ready(&self, cpu: CpuId, thread: &Arc<Object>, ctl: &mut ThreadCtl) {
        if ctl.state != ThreadState::Ready {
            return;
        }
        let Some(queued_on) = ctl.rq_cpu else {
            return;
        };
        // Absent means a core already popped it and is about to run it.
        if self.cores[queued_on].ready.lock().remove(thread) {
            ctl.rq_cpu = None;
            self.enqueue_locked(Some(cpu), thread, ctl, false);
        }
    }

    /// Unlink an exited thread from its group, once.
    pub(crate) fn retire_thread(&self, thread: &Arc<Object>) {
        let Some(t) = thread.as_thread() else {
            return;
        };
        {
            let mut ctl = t.ctl.lock();
            if ctl.retired || t.kind == ThreadKind::Idle {
                return;
            }
            ctl.retired = true;
            ctl.state = ThreadState::Exited;
            ctl.exiting = true;
        }
        log::debug!("thread {:?} retired", thread.id());
        let Some(group) = t.group() else {
            return;
        };
        let Some(cap_group) = group.as_cap_group() else {
            return;
        };
        if cap_group.unlink_thread(thread) {
            self.exit_group_inner(None, &group, 0);
        }
    }

    /// Take a thread out of every scheduler structure and retire it.
    ///
    /// Returns false when the thread is current on a core (or being
    /// switched to); it is then flagged and exits at that core's next
    /// scheduling point.
    pub(crate) fn force_exit(&self, local: Option<CpuId>, thread: &Arc<Object>) -> bool {
        let Some(t) = thread.as_thread() else {
            return true;
        };
        if t.kind == ThreadKind::Idle {
            return true;
        }
        loop {
            let mut ctl = t.ctl.lock();
            if ctl.retired {
                return true;
            }
            ctl.exiting = true;
            if let Some(on) = ctl.on_cpu {
                drop(ctl);
                self.kick(local, on);
                return false;
            }
            match ctl.state {
                ThreadState::Ready => {
                    let removed = match ctl.rq_cpu {
                        Some(q) => self.cores[q].ready.lock().remove(thread),
                        None => false,
                    };
                    if !removed {
                        return false;
                    }
                    ctl.rq_cpu = None;
                    ctl.state = ThreadState::Exited;
                }
                ThreadState::Sleeping => {
                    self.cancel_timer(&mut ctl);
                    ctl.state = ThreadState::Exited;
                }
                ThreadState::Blocked => {
                    drop(ctl);
                    if !self.cancel_wait(local, thread, None) {
                        continue;
                    }
                }
                ThreadState::Running => {
                    crate::kernel_bug!("running thread {:?} is current nowhere", thread.id());
                }
                ThreadState::Exited => {}
            }
            break;
        }
        self.retire_thread(thread);
        true
    }

    /// Last reference gone. A thread that is not current anywhere leaves
    /// every scheduler structure here; one still current on a core is only
    /// flagged and leaves that core at its next scheduling point, where
    /// `drain_retired` finds it in no queue.
    pub(crate) fn thread_deinit(&self, obj: &Arc<Object>) {
        let Some(t) = obj.as_thread() else {
            return;
        };
        if !self.force_exit(None, obj) {
            log::debug!("thread {:?} freed while current, exits at next tick", obj.id());
        }
        self.release_fpu(obj);
        if let Some(vmspace) = &t.vmspace {
            self.obj_put(vmspace);
        }
    }

    /// Result left for a thread that was woken, if any. Clears it.
    pub fn take_wakeup(&self, thread: &Arc<Object>) -> Option<Wakeup> {
        thread.as_thread()?.ctl.lock().wakeup.take()
    }

    /// The status and message info delivered at wakeup, as the ABI sees them.
    pub fn wakeup_status(&self, thread: &Arc<Object>) -> Option<(KResult<usize>, Option<SrcMsgInfo>)> {
        self.take_wakeup(thread).map(|w| (w.status, w.info))
    }
}
