//! System call interface
//!
//! Raw entry point taking a syscall number and six register arguments. Each
//! call is decoded into the typed `sys_*` methods; results go back as a
//! non-negative value or a negative [`KernelError`] status.

use crate::cap::{Badge, Cap, CapGroupArgs, CapRights};
use crate::config::MAX_TRANSFER_CAPS;
use crate::error::{KResult, KernelError};
use crate::ipc::{Blocking, SrcMsgInfo};
use crate::mem::{PmoKind, UserBuf, VmPerm};
use crate::object::Object;
use crate::sched::ThreadArgs;
use crate::{CpuId, Kernel};
use core::time::Duration;
use std::sync::Arc;

/// Timeout argument meaning "wait forever"
pub const NO_TIMEOUT: u64 = u64::MAX;
/// Affinity argument meaning "any core"; `GetAffinity` reports it as -1
pub const AFFINITY_ANY: u64 = u64::MAX;
/// Longest cap_group name accepted from userspace
pub const MAX_NAME_LEN: usize = 64;
/// Bytes written by `GetMsgInfo`
pub const MSG_INFO_LEN: usize = 32;

/// `Futex` operations, or'ed with [`FUTEX_PRIVATE`]
pub const FUTEX_WAIT: u64 = 0;
pub const FUTEX_WAKE: u64 = 1;
pub const FUTEX_REQUEUE: u64 = 3;
/// Futexes are per cap_group; shared ones are not supported
pub const FUTEX_PRIVATE: u64 = 128;

/// System call numbers
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallNumber {
    // Memory
    CreatePmo = 2,
    MapPmo = 4,
    UnmapPmo = 5,

    // Capabilities and groups
    RevokeCap = 9,
    TransferCaps = 10,
    CreateCapGroup = 11,
    ExitGroup = 12,

    // Threads
    CreateThread = 13,
    ThreadExit = 14,

    // Recycling
    RegisterRecycle = 15,
    CapGroupRecycle = 16,

    // Scheduling
    Yield = 18,
    SetAffinity = 19,
    GetAffinity = 20,
    SetPrio = 21,

    // Notifications and IRQs
    CreateNotification = 34,
    Wait = 35,
    Notify = 36,
    IrqRegister = 37,
    IrqWait = 38,
    IrqAck = 39,

    Nanosleep = 44,
    Futex = 57,
    KillGroup = 60,
    GetRights = 61,
    CapCopy = 62,
    Requeue = 63,

    // Channels
    CreateChannel = 64,
    CreateMsgHdl = 65,
    Receive = 66,
    Call = 67,
    Reply = 68,
    NotifyChannel = 69,
    StopChannel = 70,
    GetMsgInfo = 71,
}

impl SyscallNumber {
    const ALL: [SyscallNumber; 35] = [
        SyscallNumber::CreatePmo,
        SyscallNumber::MapPmo,
        SyscallNumber::UnmapPmo,
        SyscallNumber::RevokeCap,
        SyscallNumber::TransferCaps,
        SyscallNumber::CreateCapGroup,
        SyscallNumber::ExitGroup,
        SyscallNumber::CreateThread,
        SyscallNumber::ThreadExit,
        SyscallNumber::RegisterRecycle,
        SyscallNumber::CapGroupRecycle,
        SyscallNumber::Yield,
        SyscallNumber::SetAffinity,
        SyscallNumber::GetAffinity,
        SyscallNumber::SetPrio,
        SyscallNumber::CreateNotification,
        SyscallNumber::Wait,
        SyscallNumber::Notify,
        SyscallNumber::IrqRegister,
        SyscallNumber::IrqWait,
        SyscallNumber::IrqAck,
        SyscallNumber::Nanosleep,
        SyscallNumber::Futex,
        SyscallNumber::KillGroup,
        SyscallNumber::GetRights,
        SyscallNumber::CapCopy,
        SyscallNumber::Requeue,
        SyscallNumber::CreateChannel,
        SyscallNumber::CreateMsgHdl,
        SyscallNumber::Receive,
        SyscallNumber::Call,
        SyscallNumber::Reply,
        SyscallNumber::NotifyChannel,
        SyscallNumber::StopChannel,
        SyscallNumber::GetMsgInfo,
    ];

    pub fn from_u64(nr: u64) -> Option<Self> {
        Self::ALL.into_iter().find(|s| *s as u64 == nr)
    }
}

fn cap(arg: u64) -> KResult<Cap> {
    u32::try_from(arg)
        .map(Cap::from_raw)
        .map_err(|_| KernelError::InvalidArgument)
}

fn len(arg: u64) -> KResult<usize> {
    usize::try_from(arg).map_err(|_| KernelError::InvalidArgument)
}

fn timeout(arg: u64) -> Option<Duration> {
    (arg != NO_TIMEOUT).then(|| Duration::from_micros(arg))
}

fn affinity(arg: u64) -> KResult<Option<CpuId>> {
    if arg == AFFINITY_ANY {
        Ok(None)
    } else {
        len(arg).map(Some)
    }
}

fn value(v: usize) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

/// `None` when the caller blocked.
fn blocking<T>(result: Blocking<T>, done: impl FnOnce(T) -> i64) -> Option<i64> {
    result.done().map(done)
}

fn cap_value(cap: Cap) -> Option<i64> {
    Some(i64::from(cap.raw()))
}

/// Layout written by `GetMsgInfo`.
pub fn encode_msg_info(info: &SrcMsgInfo) -> [u8; MSG_INFO_LEN] {
    let mut out = [0u8; MSG_INFO_LEN];
    out[0..8].copy_from_slice(&info.src_badge.to_le_bytes());
    out[8..16].copy_from_slice(&info.src_pid.to_le_bytes());
    out[16..20].copy_from_slice(&info.src_tid.to_le_bytes());
    out[20] = info.msg_type as u8;
    out[24..32].copy_from_slice(&(info.len as u64).to_le_bytes());
    out
}

impl Kernel {
    /// Handle syscall `nr` issued by the thread current on `cpu`.
    ///
    /// Returns the value for the caller's result register, or `None` when
    /// the caller blocked; its status then arrives with its wakeup.
    pub fn syscall(&self, cpu: CpuId, nr: u64, args: [u64; 6]) -> Option<i64> {
        let result = match SyscallNumber::from_u64(nr) {
            Some(number) => {
                log::trace!("cpu {} syscall {:?} {:x?}", cpu, number, args);
                self.dispatch(cpu, number, &args)
            }
            None => {
                log::warn!("cpu {} unknown syscall {}", cpu, nr);
                Err(KernelError::InvalidArgument)
            }
        };
        self.return_to_user(cpu);
        match result {
            Ok(value) => value,
            Err(e) => Some(e.as_status()),
        }
    }

    fn dispatch(&self, cpu: CpuId, nr: SyscallNumber, a: &[u64; 6]) -> KResult<Option<i64>> {
        use SyscallNumber as S;
        let ret = match nr {
            S::CreatePmo => {
                let kind = PmoKind::from_u64(a[1]).ok_or(KernelError::InvalidArgument)?;
                let rights = CapRights::from_bits_retain(a[2]);
                cap_value(self.sys_create_pmo(cpu, len(a[0])?, kind, rights)?)
            }
            S::MapPmo => {
                let perm = VmPerm::from_bits(a[3]).ok_or(KernelError::InvalidArgument)?;
                self.sys_map_pmo(cpu, cap(a[0])?, cap(a[1])?, a[2], perm, len(a[4])?)?;
                Some(0)
            }
            S::UnmapPmo => {
                self.sys_unmap_pmo(cpu, cap(a[0])?, cap(a[1])?, a[2])?;
                Some(0)
            }
            S::RevokeCap => {
                self.sys_revoke_cap(cpu, cap(a[0])?, a[1] != 0)?;
                Some(0)
            }
            S::TransferCaps => Some(self.transfer_caps_user(cpu, a)?),
            S::CreateCapGroup => {
                let name = self.read_user(cpu, a[2], len(a[3])?.min(MAX_NAME_LEN))?;
                let args = CapGroupArgs {
                    name: String::from_utf8_lossy(&name).into_owned(),
                    badge: Badge(a[0]),
                    pid: a[1],
                };
                cap_value(self.sys_create_cap_group(cpu, args)?)
            }
            S::ExitGroup => {
                self.sys_exit_group(cpu, a[0] as i64)?;
                None
            }
            S::CreateThread => {
                let args = ThreadArgs {
                    cap_group: cap(a[0])?,
                    pc: a[1],
                    sp: a[2],
                    arg: a[3],
                    prio: len(a[4])?,
                    affinity: affinity(a[5])?,
                };
                cap_value(self.sys_create_thread(cpu, args)?)
            }
            S::ThreadExit => {
                self.sys_thread_exit(cpu)?;
                None
            }
            S::RegisterRecycle => {
                self.sys_register_recycle(cpu, cap(a[0])?, a[1])?;
                Some(0)
            }
            S::CapGroupRecycle => {
                self.sys_cap_group_recycle(cpu, cap(a[0])?)?;
                Some(0)
            }
            S::Yield => {
                self.sys_yield(cpu)?;
                Some(0)
            }
            S::SetAffinity => {
                self.sys_set_affinity(cpu, cap(a[0])?, affinity(a[1])?)?;
                Some(0)
            }
            S::GetAffinity => Some(match self.sys_get_affinity(cpu, cap(a[0])?)? {
                Some(core) => value(core),
                None => -1,
            }),
            S::SetPrio => {
                self.sys_set_prio(cpu, cap(a[0])?, len(a[1])?)?;
                Some(0)
            }
            S::CreateNotification => cap_value(self.sys_create_notification(cpu)?),
            S::Wait => blocking(self.sys_wait(cpu, cap(a[0])?, a[1] != 0, timeout(a[2]))?, |()| 0),
            S::Notify => {
                self.sys_notify(cpu, cap(a[0])?)?;
                Some(0)
            }
            S::IrqRegister => {
                let irq = u32::try_from(a[0]).map_err(|_| KernelError::InvalidArgument)?;
                cap_value(self.sys_irq_register(cpu, irq)?)
            }
            S::IrqWait => blocking(self.sys_irq_wait(cpu, cap(a[0])?, a[1] != 0)?, |()| 0),
            S::IrqAck => {
                self.sys_irq_ack(cpu, cap(a[0])?)?;
                Some(0)
            }
            S::Nanosleep => blocking(self.sys_sleep(cpu, Duration::from_micros(a[0]))?, |()| 0),
            S::Futex => self.futex_user(cpu, a)?,
            S::KillGroup => {
                self.sys_kill_group(cpu, cap(a[0])?)?;
                Some(0)
            }
            S::GetRights => {
                // COPY and REVOKE_ALL sit in the top bits; report the object-specific part.
                let rights = self.sys_get_rights(cpu, cap(a[0])?)?;
                Some((rights & CapRights::OBJECT_MASK).bits() as i64)
            }
            S::CapCopy => {
                let rights = CapRights::from_bits_retain(a[3]);
                cap_value(self.sys_cap_copy(cpu, cap(a[0])?, cap(a[1])?, a[2] != 0, rights)?)
            }
            S::Requeue => Some(value(self.sys_requeue(cpu, cap(a[0])?, cap(a[1])?)?)),
            S::CreateChannel => cap_value(self.sys_create_channel(cpu)?),
            S::CreateMsgHdl => cap_value(self.sys_create_msg_handle(cpu)?),
            S::Receive => {
                let recv = UserBuf::new(a[1], len(a[2])?);
                let got = self.sys_receive(cpu, cap(a[0])?, recv, cap(a[3])?, timeout(a[4]))?;
                blocking(got, |info| value(info.len))
            }
            S::Call => {
                let send = UserBuf::new(a[1], len(a[2])?);
                let recv = UserBuf::new(a[3], len(a[4])?);
                blocking(self.sys_call(cpu, cap(a[0])?, send, recv, timeout(a[5]))?, value)
            }
            S::Reply => {
                self.sys_reply(cpu, cap(a[0])?, UserBuf::new(a[1], len(a[2])?))?;
                Some(0)
            }
            S::NotifyChannel => {
                self.sys_notify_channel(cpu, cap(a[0])?, UserBuf::new(a[1], len(a[2])?))?;
                Some(0)
            }
            S::StopChannel => {
                self.sys_stop_channel(cpu, cap(a[0])?)?;
                Some(0)
            }
            S::GetMsgInfo => {
                let info = self.sys_get_msg_info(cpu, cap(a[0])?)?;
                self.write_user(cpu, a[1], &encode_msg_info(&info))?;
                Some(0)
            }
        };
        Ok(ret)
    }

    /// `TransferCaps(dest_group, caps_va, count, out_va)`: caps are u32 in
    /// user memory; the new slots are written back to `out_va`.
    fn transfer_caps_user(&self, cpu: CpuId, a: &[u64; 6]) -> KResult<i64> {
        let count = len(a[2])?;
        if count > self.config.cap.max_transfer {
            return Err(KernelError::InvalidArgument);
        }
        let raw = self.read_user(cpu, a[1], count * 4)?;
        let mut caps: heapless::Vec<Cap, MAX_TRANSFER_CAPS> = heapless::Vec::new();
        for chunk in raw.chunks_exact(4) {
            let c = Cap::from_raw(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
            caps.push(c).map_err(|_| KernelError::InvalidArgument)?;
        }
        let installed = self.sys_transfer_caps(cpu, cap(a[0])?, &caps)?;
        let out: Vec<u8> = installed.iter().flat_map(|c| c.raw().to_le_bytes()).collect();
        self.write_user(cpu, a[3], &out)?;
        Ok(value(installed.len()))
    }

    /// `Futex(uaddr, op, val, timeout | nr_requeue, uaddr2)`.
    fn futex_user(&self, cpu: CpuId, a: &[u64; 6]) -> KResult<Option<i64>> {
        if a[1] & FUTEX_PRIVATE == 0 {
            return Err(KernelError::InvalidArgument);
        }
        match a[1] & !FUTEX_PRIVATE {
            FUTEX_WAIT => {
                // The expected value is a C int; keep its low 32 bits.
                let val = a[2] as u32;
                Ok(blocking(self.sys_futex_wait(cpu, a[0], val, timeout(a[3]))?, |()| 0))
            }
            FUTEX_WAKE => Ok(Some(value(self.sys_futex_wake(cpu, a[0], len(a[2])?)?))),
            FUTEX_REQUEUE => {
                let n = self.sys_futex_requeue(cpu, a[0], a[4], len(a[2])?, len(a[3])?)?;
                Ok(Some(value(n)))
            }
            _ => Err(KernelError::InvalidArgument),
        }
    }

    fn caller_vmspace(&self, cpu: CpuId) -> KResult<Arc<Object>> {
        let (_, group) = self.current_group(cpu)?;
        self.group_vmspace(&group)
    }

    fn read_user(&self, cpu: CpuId, va: u64, len: usize) -> KResult<Vec<u8>> {
        let vm = self.caller_vmspace(cpu)?;
        vm.as_vmspace()
            .ok_or(KernelError::BadState)?
            .copy_from_user(va, len)
    }

    fn write_user(&self, cpu: CpuId, va: u64, bytes: &[u8]) -> KResult<()> {
        let vm = self.caller_vmspace(cpu)?;
        vm.as_vmspace()
            .ok_or(KernelError::BadState)?
            .copy_to_user(va, bytes)
    }
}
