//! # Blocking IPC Subsystem
//!
//! Notifications, IRQ notifications, futexes and synchronous call/reply
//! channels.
//!
//! ## Design
//!
//! Every blocking primitive follows the same protocol:
//! 1. Take the object lock and check the fast path
//! 2. Link the caller into the object's wait list and record what it is
//!    linked into (`blocked_on`) under its thread lock
//! 3. Switch away while still holding the object lock, so no waker can
//!    observe a half-blocked thread
//!
//! A woken thread finds its result in its control block ([`Wakeup`]).
//! Timeouts, signals, replies and teardown all resolve through the thread
//! lock: whoever finds the thread still `Blocked` on the same wait wins,
//! everyone else backs off.

pub mod channel;
pub mod futex;
pub mod irq;
pub mod notification;

pub use channel::{Channel, MsgHdl};
pub use futex::FutexTable;
pub use irq::IrqNotification;
pub use notification::Notification;

use crate::error::{KResult, KernelError};
use crate::object::Object;
use crate::sched::thread::{BlockedOn, ThreadCtl};
use crate::sched::timer::TimerKey;
use crate::sched::ThreadState;
use crate::{CpuId, Kernel};
use channel::MsgState;
use std::sync::Arc;

/// Outcome of a call that may suspend the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Blocking<T> {
    /// Completed without blocking
    Done(T),
    /// Caller was suspended; the result arrives with its [`Wakeup`]
    Blocked,
}

impl<T> Blocking<T> {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Blocking::Blocked)
    }

    /// The value of a call that completed.
    pub fn done(self) -> Option<T> {
        match self {
            Blocking::Done(value) => Some(value),
            Blocking::Blocked => None,
        }
    }
}

/// Kind of a channel message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    /// Client waits for a reply
    Call = 0,
    /// Fire-and-forget
    Notify = 1,
}

/// Sender metadata handed to the receiving server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SrcMsgInfo {
    pub src_badge: u64,
    pub src_pid: u64,
    pub src_tid: u32,
    pub msg_type: MsgType,
    /// Payload length in bytes
    pub len: usize,
}

/// Result delivered to a thread when it is woken
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wakeup {
    pub status: KResult<usize>,
    /// Set when a blocked `receive` completes
    pub info: Option<SrcMsgInfo>,
}

impl Wakeup {
    pub fn status(status: KResult<usize>) -> Self {
        Self { status, info: None }
    }
}

impl Kernel {
    /// Pull a blocked thread out of whatever it waits on.
    ///
    /// With `expected` set this is a timeout firing: it only acts if that
    /// exact timer registration is still in place, and the thread is made
    /// Ready with [`KernelError::Timeout`]. Without it the thread is being
    /// torn down and ends Exited. Returns false when somebody else already
    /// woke the thread.
    pub(crate) fn cancel_wait(
        &self,
        local: Option<CpuId>,
        thread: &Arc<Object>,
        expected: Option<TimerKey>,
    ) -> bool {
        let Some(t) = thread.as_thread() else {
            return false;
        };
        loop {
            let blocked = {
                let ctl = t.ctl.lock();
                if !Self::still_waiting(&ctl, expected) {
                    return false;
                }
                match &ctl.blocked_on {
                    Some(b) => b.clone(),
                    None => return false,
                }
            };

            let settled = match &blocked {
                BlockedOn::Notification(weak) => {
                    let obj = weak.upgrade();
                    let mut state = obj
                        .as_ref()
                        .and_then(|o| o.as_notification())
                        .map(|n| n.state.lock());
                    let mut ctl = t.ctl.lock();
                    self.recheck(&ctl, &blocked, expected).map(|()| {
                        if let Some(state) = state.as_mut() {
                            state.remove_waiter(thread);
                        }
                        self.finish_cancel(local, thread, &mut ctl, expected);
                    })
                }
                BlockedOn::ChannelRecv { channel, .. } => {
                    let obj = channel.upgrade();
                    let mut state = obj
                        .as_ref()
                        .and_then(|o| o.as_channel())
                        .map(|c| c.state.lock());
                    let mut ctl = t.ctl.lock();
                    self.recheck(&ctl, &blocked, expected).map(|()| {
                        if let Some(state) = state.as_mut() {
                            state.remove_server(thread);
                        }
                        self.finish_cancel(local, thread, &mut ctl, expected);
                    })
                }
                BlockedOn::ChannelCall(msg) => {
                    let obj = msg.channel.upgrade();
                    let mut chan_state = obj
                        .as_ref()
                        .and_then(|o| o.as_channel())
                        .map(|c| c.state.lock());
                    let mut msg_state = msg.state.lock();
                    let mut ctl = t.ctl.lock();
                    self.recheck(&ctl, &blocked, expected).map(|()| {
                        if *msg_state == MsgState::Queued {
                            if let Some(chan) = chan_state.as_mut() {
                                chan.remove_pending(msg);
                            }
                        }
                        *msg_state = if expected.is_some() {
                            MsgState::TimedOut
                        } else {
                            MsgState::Closed
                        };
                        self.finish_cancel(local, thread, &mut ctl, expected);
                    })
                }
            };

            match settled {
                Ok(()) => return true,
                Err(Recheck::Lost) => return false,
                Err(Recheck::Moved) => continue,
            }
        }
    }

    fn still_waiting(ctl: &ThreadCtl, expected: Option<TimerKey>) -> bool {
        ctl.state == ThreadState::Blocked && expected.map_or(true, |key| ctl.timer == Some(key))
    }

    fn recheck(
        &self,
        ctl: &ThreadCtl,
        blocked: &BlockedOn,
        expected: Option<TimerKey>,
    ) -> Result<(), Recheck> {
        if !Self::still_waiting(ctl, expected) {
            return Err(Recheck::Lost);
        }
        match &ctl.blocked_on {
            Some(now) if now.same(blocked) => Ok(()),
            // Requeued while the lock was dropped.
            Some(_) => Err(Recheck::Moved),
            None => Err(Recheck::Lost),
        }
    }

    fn finish_cancel(
        &self,
        local: Option<CpuId>,
        thread: &Arc<Object>,
        ctl: &mut ThreadCtl,
        expected: Option<TimerKey>,
    ) {
        ctl.blocked_on = None;
        if expected.is_some() {
            ctl.timer = None;
            ctl.wakeup = Some(Wakeup::status(Err(KernelError::Timeout)));
            self.enqueue_locked(local, thread, ctl, false);
        } else {
            self.cancel_timer(ctl);
            ctl.state = ThreadState::Exited;
        }
    }

    /// Wake a thread taken off a wait list by its waker.
    ///
    /// Caller holds the lock of the object the thread was linked into.
    pub(crate) fn wake_waiter(&self, local: Option<CpuId>, thread: &Arc<Object>, wakeup: Wakeup) {
        let Some(t) = thread.as_thread() else {
            return;
        };
        let mut ctl = t.ctl.lock();
        crate::bug_on!(
            ctl.state != ThreadState::Blocked || ctl.blocked_on.is_none(),
            "waking {:?} in state {:?} outside any wait",
            thread.id(),
            ctl.state
        );
        self.cancel_timer(&mut ctl);
        ctl.blocked_on = None;
        ctl.wakeup = Some(wakeup);
        log::trace!("wake {:?} with {:?}", thread.id(), ctl.wakeup);
        self.enqueue_locked(local, thread, &mut ctl, false);
    }

    /// Block the thread current on `cpu`, arming a timeout if asked.
    ///
    /// Caller holds the lock of the object it links the thread into.
    pub(crate) fn block_current(
        &self,
        cpu: CpuId,
        thread: &Arc<Object>,
        on: BlockedOn,
        timeout: Option<core::time::Duration>,
    ) {
        let Some(t) = thread.as_thread() else {
            return;
        };
        let deadline = timeout.map(|d| self.deadline_after(d));
        let mut ctl = t.ctl.lock();
        ctl.state = ThreadState::Blocked;
        ctl.blocked_on = Some(on);
        ctl.wakeup = None;
        if let Some(deadline) = deadline {
            self.register_timer(
                cpu,
                thread,
                &mut ctl,
                deadline,
                crate::sched::timer::TimerKind::Timeout,
            );
        }
    }
}

enum Recheck {
    /// Already woken or torn down by someone else
    Lost,
    /// Moved to another wait list; look again
    Moved,
}
