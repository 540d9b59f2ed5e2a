//! Synchronous call/reply channels
//!
//! A channel belongs to the cap_group that created it; only that group may
//! `receive` on it or stop it. Clients `call` (and block for the reply) or
//! `notify` (fire-and-forget). Each received call is bound to a message
//! handle, and `reply` on that handle finishes the exchange.
//!
//! Payloads are copied into kernel staging at send time, so a client's
//! buffer is never read after the call starts. Replies are written straight
//! into the client's receive buffer, and only while the call is still bound:
//! once the client has timed out or the channel is gone, the reply is
//! dropped.
//!
//! Lock order: channel state, then handle binding, then message record.

use super::{Blocking, MsgType, SrcMsgInfo, Wakeup};
use crate::cap::{Badge, Cap, CapRights};
use crate::error::{KResult, KernelError};
use crate::mem::{UserBuf, VmPerm, VmSpace};
use crate::object::{Object, ObjectBody, ObjectType};
use crate::sched::thread::BlockedOn;
use crate::sync::{HandleLock, ObjectLock, RecordLock};
use crate::{CpuId, Kernel};
use core::time::Duration;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};

/// Lifecycle of one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MsgState {
    /// Waiting in the channel queue
    Queued,
    /// Call handed to a server, reply outstanding
    Bound,
    /// Notify handed to a server
    Delivered,
    Replied,
    /// Client gave up before the reply
    TimedOut,
    /// Channel stopped or owner torn down
    Closed,
}

/// One client message, from send until reply or abandonment
pub(crate) struct ClientMsg {
    pub(crate) channel: Weak<Object>,
    /// Calling thread; `None` for notifies
    client: Option<Arc<Object>>,
    client_group: Weak<Object>,
    info: SrcMsgInfo,
    payload: Vec<u8>,
    /// Where the reply goes in the client's address space
    reply_buf: UserBuf,
    pub(crate) state: RecordLock<MsgState>,
}

impl ClientMsg {
    fn from_group(&self, group: &Arc<Object>) -> bool {
        self.client_group.as_ptr() == Arc::as_ptr(group)
    }
}

/// A server thread parked in `receive`
struct ServerWait {
    thread: Arc<Object>,
    hdl: Arc<Object>,
    recv: UserBuf,
}

pub(crate) struct ChannelState {
    valid: bool,
    pending: VecDeque<Arc<ClientMsg>>,
    servers: VecDeque<ServerWait>,
    /// Calls handed out and possibly still awaiting a reply
    bound: Vec<Arc<ClientMsg>>,
}

impl ChannelState {
    pub(crate) fn remove_pending(&mut self, msg: &Arc<ClientMsg>) {
        self.pending.retain(|m| !Arc::ptr_eq(m, msg));
    }

    pub(crate) fn remove_server(&mut self, thread: &Arc<Object>) {
        self.servers.retain(|s| !Arc::ptr_eq(&s.thread, thread));
    }

    fn track_bound(&mut self, msg: &Arc<ClientMsg>) {
        self.bound.retain(|m| *m.state.lock() == MsgState::Bound);
        self.bound.push(msg.clone());
    }
}

/// IPC channel object
pub struct Channel {
    creator: Weak<Object>,
    creator_badge: Badge,
    capacity: usize,
    pub(crate) state: ObjectLock<ChannelState>,
}

impl Channel {
    pub fn creator_badge(&self) -> Badge {
        self.creator_badge
    }

    pub fn is_valid(&self) -> bool {
        self.state.lock().valid
    }

    /// Messages waiting for a server.
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Servers parked in `receive`.
    pub fn waiting_servers(&self) -> usize {
        self.state.lock().servers.len()
    }

    pub(crate) fn created_by(&self, group: &Arc<Object>) -> bool {
        self.creator.as_ptr() == Arc::as_ptr(group)
    }
}

/// Server-side handle for one received message
pub struct MsgHdl {
    binding: HandleLock<Option<Arc<ClientMsg>>>,
}

impl MsgHdl {
    fn new() -> Self {
        Self {
            binding: HandleLock::new(None, "msg_hdl"),
        }
    }

    /// True while a call is bound and unanswered.
    pub fn is_bound(&self) -> bool {
        self.binding
            .lock()
            .as_ref()
            .is_some_and(|m| *m.state.lock() == MsgState::Bound)
    }
}

fn vmspace_of(thread: &Object) -> KResult<&VmSpace> {
    thread
        .as_thread()
        .and_then(|t| t.vmspace())
        .and_then(|vm| vm.as_vmspace())
        .ok_or(KernelError::BadState)
}

impl Kernel {
    pub fn sys_create_channel(&self, cpu: CpuId) -> KResult<Cap> {
        let (_, group) = self.current_group(cpu)?;
        let badge = group
            .as_cap_group()
            .map(|g| g.badge())
            .ok_or(KernelError::BadState)?;
        let obj = self.obj_alloc(ObjectBody::Channel(Channel {
            creator: Arc::downgrade(&group),
            creator_badge: badge,
            capacity: self.config.ipc.channel_capacity,
            state: ObjectLock::new(
                ChannelState {
                    valid: true,
                    pending: VecDeque::new(),
                    servers: VecDeque::new(),
                    bound: Vec::new(),
                },
                "channel",
            ),
        }))?;
        self.cap_alloc(&group, obj, CapRights::ALL)
    }

    pub fn sys_create_msg_handle(&self, cpu: CpuId) -> KResult<Cap> {
        let (_, group) = self.current_group(cpu)?;
        let obj = self.obj_alloc(ObjectBody::MsgHdl(MsgHdl::new()))?;
        self.cap_alloc(&group, obj, CapRights::ALL)
    }

    /// Take the next message from `chan_cap`, blocking when there is none.
    ///
    /// The payload lands in `recv`; a call binds `hdl_cap` until replied.
    /// A head message longer than `recv` is refused with `InvalidArgument`
    /// and stays queued for a receive with a larger buffer.
    /// A blocked receive is completed by the sender: its wakeup carries the
    /// length and the [`SrcMsgInfo`].
    pub fn sys_receive(
        &self,
        cpu: CpuId,
        chan_cap: Cap,
        recv: UserBuf,
        hdl_cap: Cap,
        timeout: Option<Duration>,
    ) -> KResult<Blocking<SrcMsgInfo>> {
        let (thread, group) = self.current_group(cpu)?;
        let chan_obj = self.obj_get(&group, chan_cap, ObjectType::Channel)?;
        let channel = chan_obj.as_channel().ok_or(KernelError::BadCapability)?;
        let badge = group.as_cap_group().map(|g| g.badge());
        if badge != Some(channel.creator_badge) {
            return Err(KernelError::PermissionDenied);
        }
        let hdl_obj = self.obj_get(&group, hdl_cap, ObjectType::MsgHdl)?;
        let hdl = hdl_obj.as_msg_hdl().ok_or(KernelError::BadCapability)?;
        let vmspace = vmspace_of(&thread)?;

        let mut state = channel.state.lock();
        if !state.valid {
            return Err(KernelError::ChannelClosed);
        }
        let mut binding = hdl.binding.lock();
        if binding.as_ref().is_some_and(|m| *m.state.lock() == MsgState::Bound) {
            return Err(KernelError::BadState);
        }

        if let Some(msg) = state.pending.front().cloned() {
            if msg.payload.len() > recv.len {
                return Err(KernelError::InvalidArgument);
            }
            let mut msg_state = msg.state.lock();
            vmspace.copy_to_user(recv.va, &msg.payload)?;
            state.pending.pop_front();
            *binding = Some(msg.clone());
            match msg.info.msg_type {
                MsgType::Call => {
                    *msg_state = MsgState::Bound;
                    drop(msg_state);
                    state.track_bound(&msg);
                }
                MsgType::Notify => *msg_state = MsgState::Delivered,
            }
            log::trace!("{:?} received {} bytes", thread.id(), msg.payload.len());
            return Ok(Blocking::Done(msg.info));
        }
        if timeout.is_some_and(|d| d.is_zero()) {
            return Err(KernelError::WouldBlock);
        }
        if recv.len > 0 {
            vmspace.check_access(recv.va, recv.len, VmPerm::WRITE)?;
        }
        drop(binding);

        self.block_current(
            cpu,
            &thread,
            BlockedOn::ChannelRecv {
                channel: Arc::downgrade(chan_obj.arc()),
                hdl: hdl_obj.arc().clone(),
            },
            timeout,
        );
        state.servers.push_back(ServerWait {
            thread: thread.clone(),
            hdl: hdl_obj.arc().clone(),
            recv,
        });
        self.sched(cpu);
        drop(state);
        self.drain_retired(cpu);
        Ok(Blocking::Blocked)
    }

    /// Send `send` and block until the server replies into `recv`.
    ///
    /// The wakeup status is the reply length, `Timeout` when the deadline
    /// passes first, or `ChannelClosed` when the channel is stopped.
    pub fn sys_call(
        &self,
        cpu: CpuId,
        chan_cap: Cap,
        send: UserBuf,
        recv: UserBuf,
        timeout: Option<Duration>,
    ) -> KResult<Blocking<usize>> {
        if send.len > self.config.ipc.msg_max_len {
            return Err(KernelError::InvalidArgument);
        }
        if timeout.is_some_and(|d| d.is_zero()) {
            return Err(KernelError::WouldBlock);
        }
        let (thread, group) = self.current_group(cpu)?;
        let chan_obj = self.obj_get(&group, chan_cap, ObjectType::Channel)?;
        let channel = chan_obj.as_channel().ok_or(KernelError::BadCapability)?;
        let vmspace = vmspace_of(&thread)?;
        let payload = vmspace.copy_from_user(send.va, send.len)?;
        if recv.len > 0 {
            vmspace.check_access(recv.va, recv.len, VmPerm::WRITE)?;
        }
        let msg = self.new_client_msg(chan_obj.arc(), &thread, &group, MsgType::Call, payload, recv);

        let mut state = channel.state.lock();
        if !state.valid {
            return Err(KernelError::ChannelClosed);
        }
        if state.servers.is_empty() && state.pending.len() >= channel.capacity {
            return Err(KernelError::Full);
        }

        // Linked before it becomes visible, so a fast reply finds it blocked.
        self.block_current(cpu, &thread, BlockedOn::ChannelCall(msg.clone()), timeout);
        if !self.deliver(Some(cpu), &mut state, &msg) {
            if state.pending.len() >= channel.capacity {
                self.unblock_current(&thread);
                return Err(KernelError::Full);
            }
            state.pending.push_back(msg);
        }
        self.sched(cpu);
        drop(state);
        self.drain_retired(cpu);
        Ok(Blocking::Blocked)
    }

    /// Answer the call bound to `hdl_cap`.
    pub fn sys_reply(&self, cpu: CpuId, hdl_cap: Cap, reply: UserBuf) -> KResult<()> {
        if reply.len > self.config.ipc.msg_max_len {
            return Err(KernelError::InvalidArgument);
        }
        let (thread, group) = self.current_group(cpu)?;
        let hdl_obj = self.obj_get(&group, hdl_cap, ObjectType::MsgHdl)?;
        let hdl = hdl_obj.as_msg_hdl().ok_or(KernelError::BadCapability)?;
        let bytes = vmspace_of(&thread)?.copy_from_user(reply.va, reply.len)?;

        let mut binding = hdl.binding.lock();
        let msg = binding.clone().ok_or(KernelError::BadState)?;
        let mut msg_state = msg.state.lock();
        match *msg_state {
            MsgState::Bound => {}
            MsgState::TimedOut => {
                log::warn!("reply on {:?} after its caller timed out, dropped", hdl_obj.id());
                *binding = None;
                return Err(KernelError::BadState);
            }
            MsgState::Closed => {
                *binding = None;
                return Err(KernelError::ChannelClosed);
            }
            MsgState::Queued | MsgState::Delivered | MsgState::Replied => {
                return Err(KernelError::BadState);
            }
        }
        if bytes.len() > msg.reply_buf.len {
            return Err(KernelError::InvalidArgument);
        }
        let Some(client) = msg.client.as_ref() else {
            return Err(KernelError::BadState);
        };
        let status = vmspace_of(client).and_then(|vm| vm.copy_to_user(msg.reply_buf.va, &bytes));
        *msg_state = MsgState::Replied;
        *binding = None;
        match status {
            Ok(()) => {
                self.wake_waiter(Some(cpu), client, Wakeup::status(Ok(bytes.len())));
                Ok(())
            }
            Err(e) => {
                self.wake_waiter(Some(cpu), client, Wakeup::status(Err(e)));
                Err(e)
            }
        }
    }

    /// Queue a one-way message; never blocks the sender.
    pub fn sys_notify_channel(&self, cpu: CpuId, chan_cap: Cap, send: UserBuf) -> KResult<()> {
        if send.len > self.config.ipc.notify_max_len {
            return Err(KernelError::InvalidArgument);
        }
        let (thread, group) = self.current_group(cpu)?;
        let chan_obj = self.obj_get(&group, chan_cap, ObjectType::Channel)?;
        let channel = chan_obj.as_channel().ok_or(KernelError::BadCapability)?;
        let payload = vmspace_of(&thread)?.copy_from_user(send.va, send.len)?;
        let msg = self.new_client_msg(
            chan_obj.arc(),
            &thread,
            &group,
            MsgType::Notify,
            payload,
            UserBuf::empty(),
        );

        let mut state = channel.state.lock();
        if !state.valid {
            return Err(KernelError::ChannelClosed);
        }
        if self.deliver(Some(cpu), &mut state, &msg) {
            return Ok(());
        }
        if state.pending.len() >= channel.capacity {
            return Err(KernelError::Full);
        }
        state.pending.push_back(msg);
        Ok(())
    }

    /// Stop a channel the caller created.
    pub fn sys_stop_channel(&self, cpu: CpuId, chan_cap: Cap) -> KResult<()> {
        let (_, group) = self.current_group(cpu)?;
        let chan_obj = self.obj_get(&group, chan_cap, ObjectType::Channel)?;
        let channel = chan_obj.as_channel().ok_or(KernelError::BadCapability)?;
        if !channel.created_by(&group) {
            return Err(KernelError::PermissionDenied);
        }
        self.stop_channel(Some(cpu), channel)
    }

    /// Metadata of the message bound to `hdl_cap`.
    pub fn sys_get_msg_info(&self, cpu: CpuId, hdl_cap: Cap) -> KResult<SrcMsgInfo> {
        let (_, group) = self.current_group(cpu)?;
        let hdl_obj = self.obj_get(&group, hdl_cap, ObjectType::MsgHdl)?;
        let hdl = hdl_obj.as_msg_hdl().ok_or(KernelError::BadCapability)?;
        let binding = hdl.binding.lock();
        binding.as_ref().map(|m| m.info).ok_or(KernelError::BadState)
    }

    fn new_client_msg(
        &self,
        channel: &Arc<Object>,
        thread: &Arc<Object>,
        group: &Arc<Object>,
        msg_type: MsgType,
        payload: Vec<u8>,
        reply_buf: UserBuf,
    ) -> Arc<ClientMsg> {
        let (src_badge, src_pid) = group
            .as_cap_group()
            .map_or((0, 0), |g| (g.badge().0, g.pid()));
        let src_tid = thread.as_thread().map_or(0, |t| t.tid());
        Arc::new(ClientMsg {
            channel: Arc::downgrade(channel),
            client: (msg_type == MsgType::Call).then(|| thread.clone()),
            client_group: Arc::downgrade(group),
            info: SrcMsgInfo {
                src_badge,
                src_pid,
                src_tid,
                msg_type,
                len: payload.len(),
            },
            payload,
            reply_buf,
            state: RecordLock::new(MsgState::Queued, "client_msg"),
        })
    }

    /// Hand `msg` to the first parked server that can take it.
    ///
    /// Servers whose buffer or handle cannot take the message are woken
    /// with the error. Returns false when nobody took it.
    fn deliver(&self, local: Option<CpuId>, state: &mut ChannelState, msg: &Arc<ClientMsg>) -> bool {
        while let Some(server) = state.servers.pop_front() {
            match self.hand_to_server(state, &server, msg) {
                Ok(()) => {
                    let wakeup = Wakeup {
                        status: Ok(msg.payload.len()),
                        info: Some(msg.info),
                    };
                    self.wake_waiter(local, &server.thread, wakeup);
                    return true;
                }
                Err(e) => {
                    log::debug!("server {:?} could not take message: {}", server.thread.id(), e);
                    self.wake_waiter(local, &server.thread, Wakeup::status(Err(e)));
                }
            }
        }
        false
    }

    fn hand_to_server(
        &self,
        state: &mut ChannelState,
        server: &ServerWait,
        msg: &Arc<ClientMsg>,
    ) -> KResult<()> {
        let hdl = server.hdl.as_msg_hdl().ok_or(KernelError::BadCapability)?;
        let mut binding = hdl.binding.lock();
        if binding.as_ref().is_some_and(|m| *m.state.lock() == MsgState::Bound) {
            return Err(KernelError::BadState);
        }
        if msg.payload.len() > server.recv.len {
            return Err(KernelError::InvalidArgument);
        }
        let mut msg_state = msg.state.lock();
        vmspace_of(&server.thread)?.copy_to_user(server.recv.va, &msg.payload)?;
        *binding = Some(msg.clone());
        match msg.info.msg_type {
            MsgType::Call => {
                *msg_state = MsgState::Bound;
                drop(msg_state);
                state.track_bound(msg);
            }
            MsgType::Notify => *msg_state = MsgState::Delivered,
        }
        Ok(())
    }

    /// Undo `block_current` for a call that never got linked anywhere.
    fn unblock_current(&self, thread: &Arc<Object>) {
        if let Some(t) = thread.as_thread() {
            let mut ctl = t.ctl.lock();
            self.cancel_timer(&mut ctl);
            ctl.blocked_on = None;
            ctl.state = crate::sched::ThreadState::Running;
        }
    }

    /// Invalidate a channel and fail everyone waiting on it.
    pub(crate) fn stop_channel(&self, local: Option<CpuId>, channel: &Channel) -> KResult<()> {
        let mut state = channel.state.lock();
        if !state.valid {
            return Err(KernelError::ChannelClosed);
        }
        state.valid = false;
        let closed = || Wakeup::status(Err(KernelError::ChannelClosed));

        for server in state.servers.drain(..).collect::<Vec<_>>() {
            self.wake_waiter(local, &server.thread, closed());
        }
        let pending: Vec<_> = state.pending.drain(..).collect();
        let bound: Vec<_> = state.bound.drain(..).collect();
        for msg in pending.iter().chain(bound.iter()) {
            let mut msg_state = msg.state.lock();
            if matches!(*msg_state, MsgState::Queued | MsgState::Bound) {
                *msg_state = MsgState::Closed;
                if let Some(client) = &msg.client {
                    self.wake_waiter(local, client, closed());
                }
            }
        }
        log::debug!(
            "channel of {:?} stopped, {} pending and {} bound calls closed",
            channel.creator_badge,
            pending.len(),
            bound.len()
        );
        Ok(())
    }

    /// Drop everything `group` left queued on a channel it does not own.
    pub(crate) fn close_channel(&self, channel: &Channel, group: &Arc<Object>) {
        let mut state = channel.state.lock();
        let (gone, kept): (Vec<_>, Vec<_>) = state.pending.drain(..).partition(|m| m.from_group(group));
        state.pending = kept.into();
        for msg in gone.iter().chain(state.bound.iter().filter(|m| m.from_group(group))) {
            let mut msg_state = msg.state.lock();
            if matches!(*msg_state, MsgState::Queued | MsgState::Bound) {
                *msg_state = MsgState::Closed;
            }
        }
    }

    /// Stop a channel that is being torn down. One already stopped by its
    /// owner is left as it is.
    pub(crate) fn stop_channel_on_teardown(&self, local: Option<CpuId>, channel: &Channel) {
        match self.stop_channel(local, channel) {
            Ok(()) | Err(KernelError::ChannelClosed) => {}
            Err(e) => log::warn!("stopping channel of {:?} failed: {}", channel.creator_badge, e),
        }
    }

    pub(crate) fn channel_deinit(&self, obj: &Arc<Object>) {
        if let Some(channel) = obj.as_channel() {
            self.stop_channel_on_teardown(None, channel);
        }
    }

    /// A handle freed with a call still bound fails that call.
    pub(crate) fn msg_hdl_deinit(&self, obj: &Arc<Object>) {
        let Some(hdl) = obj.as_msg_hdl() else {
            return;
        };
        let mut binding = hdl.binding.lock();
        let Some(msg) = binding.take() else {
            return;
        };
        let mut msg_state = msg.state.lock();
        if *msg_state == MsgState::Bound {
            *msg_state = MsgState::Closed;
            if let Some(client) = &msg.client {
                self.wake_waiter(None, client, Wakeup::status(Err(KernelError::ChannelClosed)));
            }
        }
    }
}
