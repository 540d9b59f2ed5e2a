//! Canned workloads driven through the kernel's syscall surface
//!
//! Each core is stepped by hand: a blocking syscall parks the caller, and
//! the woken side only runs once its core takes the pending IPI.

use anyhow::{bail, ensure, Context, Result};
use chcore_kernel::{
    Badge, Blocking, Cap, CapGroupArgs, CapRights, CpuId, Kernel, KernelConfig, Object, ObjectType,
    PmoKind, SimPlatform, ThreadArgs, UserBuf, VmPerm, CAP_GROUP_SLOT,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const SERVER_BUF: u64 = 0x10_0000;
const CLIENT_BUF: u64 = 0x20_0000;
const BUF_LEN: usize = 0x1000;
const REPLY_OFFSET: u64 = 0x800;

/// Per-round simulated time
const ROUND_TIME: Duration = Duration::from_millis(1);

/// Counts reported by a finished workload
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub rounds: u64,
    pub bytes: usize,
}

/// A booted kernel plus the root task's objects
pub struct Sim {
    pub kernel: Kernel,
    pub plat: Arc<SimPlatform>,
    pub root_group: Arc<Object>,
    pub root_thread: Arc<Object>,
}

impl Sim {
    pub fn boot(config: KernelConfig) -> Result<Self> {
        let plat = Arc::new(SimPlatform::default());
        let kernel = Kernel::new(config, plat.clone());
        let root = kernel
            .create_root_task(
                CapGroupArgs {
                    name: "procmgr".into(),
                    badge: Badge(1),
                    pid: 1,
                },
                0x40_0000,
            )
            .context("failed to create root task")?;
        Ok(Self {
            kernel,
            plat,
            root_group: root.group,
            root_thread: root.thread,
        })
    }

    fn is_current(&self, cpu: CpuId, thread: &Arc<Object>) -> bool {
        self.kernel
            .current_thread(cpu)
            .is_some_and(|t| Arc::ptr_eq(&t, thread))
    }

    fn expect_current(&self, cpu: CpuId, thread: &Arc<Object>, what: &str) -> Result<()> {
        ensure!(self.is_current(cpu, thread), "{what} is not running on core {cpu}");
        Ok(())
    }

    fn lookup(&self, group: &Arc<Object>, cap: Cap, ty: ObjectType) -> Result<Arc<Object>> {
        let obj = self
            .kernel
            .obj_get(group, cap, ty)
            .with_context(|| format!("cap {} is not a {ty:?}", cap.raw()))?;
        Ok(obj.arc().clone())
    }

    /// Back `len` bytes at `va` in the group named by `group_cap`.
    fn map_rw(&self, cpu: CpuId, group_cap: Cap, va: u64, len: usize) -> Result<()> {
        let pmo = self
            .kernel
            .sys_create_pmo(cpu, len, PmoKind::Anonymous, CapRights::ALL)
            .context("create pmo")?;
        self.kernel
            .sys_map_pmo(cpu, group_cap, pmo, va, VmPerm::READ | VmPerm::WRITE, len)
            .context("map pmo")?;
        Ok(())
    }

    fn write_user(&self, group: &Arc<Object>, va: u64, bytes: &[u8]) -> Result<()> {
        let vm = self.kernel.group_vmspace(group)?;
        vm.as_vmspace()
            .context("vmspace object")?
            .copy_to_user(va, bytes)?;
        Ok(())
    }

    fn read_user(&self, group: &Arc<Object>, va: u64, len: usize) -> Result<Vec<u8>> {
        let vm = self.kernel.group_vmspace(group)?;
        Ok(vm
            .as_vmspace()
            .context("vmspace object")?
            .copy_from_user(va, len)?)
    }

    /// Advance simulated time and deliver a timer tick to every core.
    fn tick_all(&self) {
        self.plat.advance(ROUND_TIME);
        for cpu in 0..self.kernel.config().sched.cpus {
            self.kernel.handle_timer_irq(cpu);
        }
    }
}

/// Bounce a notification pair between the root thread on core 0 and a
/// partner pinned to core 1.
pub fn ping_pong(sim: &Sim, rounds: u64) -> Result<Outcome> {
    ensure!(
        sim.kernel.config().sched.cpus >= 2,
        "ping-pong needs at least two cores"
    );
    let k = &sim.kernel;
    let ping = k.sys_create_notification(0)?;
    let pong = k.sys_create_notification(0)?;
    let partner_cap = k
        .sys_create_thread(0, ThreadArgs::own(0x1000, k.config().sched.default_prio).with_affinity(1))
        .context("create partner thread")?;
    let partner = sim.lookup(&sim.root_group, partner_cap, ObjectType::Thread)?;

    k.handle_ipi(1);
    sim.expect_current(1, &partner, "partner")?;
    if !k.sys_wait(1, ping, true, None)?.is_blocked() {
        bail!("partner should park on an unsignalled notification");
    }

    for round in 0..rounds {
        k.sys_notify(0, ping)?;
        k.handle_ipi(1);
        sim.expect_current(1, &partner, "partner")?;
        let woke = k.take_wakeup(&partner).context("partner woke without status")?;
        woke.status?;

        match k.sys_wait(0, pong, true, None)? {
            Blocking::Blocked => {}
            Blocking::Done(()) => bail!("pong was signalled early in round {round}"),
        }
        k.sys_notify(1, pong)?;
        k.handle_ipi(0);
        sim.expect_current(0, &sim.root_thread, "root")?;
        if let Some(w) = k.take_wakeup(&sim.root_thread) {
            w.status?;
        }

        if !k.sys_wait(1, ping, true, None)?.is_blocked() {
            bail!("ping was signalled early in round {round}");
        }
        sim.tick_all();
        debug!(round, "ping-pong round complete");
    }
    info!(rounds, "ping-pong finished");
    Ok(Outcome { rounds, bytes: 0 })
}

/// Run an echo server in the root group on core 0 and a client group
/// pinned to core 1 that calls it `messages` times.
pub fn echo(sim: &Sim, messages: u64) -> Result<Outcome> {
    ensure!(
        sim.kernel.config().sched.cpus >= 2,
        "echo needs at least two cores"
    );
    let k = &sim.kernel;
    sim.map_rw(0, CAP_GROUP_SLOT, SERVER_BUF, BUF_LEN)?;
    let chan = k.sys_create_channel(0)?;
    let hdl = k.sys_create_msg_handle(0)?;

    let client_cap = k
        .sys_create_cap_group(
            0,
            CapGroupArgs {
                name: "echo-client".into(),
                badge: Badge(0xC1),
                pid: 2,
            },
        )
        .context("create client group")?;
    let client_group = sim.lookup(&sim.root_group, client_cap, ObjectType::CapGroup)?;
    sim.map_rw(0, client_cap, CLIENT_BUF, BUF_LEN)?;
    let client_chan = k.sys_transfer_caps(0, client_cap, &[chan])?[0];
    let client_cap_thread = k.sys_create_thread(
        0,
        ThreadArgs {
            cap_group: client_cap,
            pc: 0x1000,
            sp: 0x8000,
            arg: 0,
            prio: k.config().sched.default_prio,
            affinity: Some(1),
        },
    )?;
    let client = sim.lookup(&sim.root_group, client_cap_thread, ObjectType::Thread)?;
    k.handle_ipi(1);
    sim.expect_current(1, &client, "client")?;

    let recv = UserBuf::new(SERVER_BUF, REPLY_OFFSET as usize);
    if !k.sys_receive(0, chan, recv, hdl, None)?.is_blocked() {
        bail!("server should park on an empty channel");
    }

    let mut bytes = 0;
    for seq in 0..messages {
        let request = format!("echo #{seq}");
        sim.write_user(&client_group, CLIENT_BUF, request.as_bytes())?;
        let send = UserBuf::new(CLIENT_BUF, request.len());
        let reply_buf = UserBuf::new(CLIENT_BUF + REPLY_OFFSET, request.len());
        if !k.sys_call(1, client_chan, send, reply_buf, None)?.is_blocked() {
            bail!("call {seq} completed without a reply");
        }

        k.handle_ipi(0);
        sim.expect_current(0, &sim.root_thread, "server")?;
        let woke = k
            .take_wakeup(&sim.root_thread)
            .context("server woke without a message")?;
        let len = woke.status?;
        let info = woke.info.context("receive completed without message info")?;
        ensure!(info.src_badge == 0xC1, "unexpected badge {:#x}", info.src_badge);
        let payload = sim.read_user(&sim.root_group, SERVER_BUF, len)?;
        sim.write_user(&sim.root_group, SERVER_BUF + REPLY_OFFSET, &payload)?;
        k.sys_reply(0, hdl, UserBuf::new(SERVER_BUF + REPLY_OFFSET, len))?;
        if !k.sys_receive(0, chan, recv, hdl, None)?.is_blocked() {
            bail!("server found a message it did not expect");
        }

        k.handle_ipi(1);
        sim.expect_current(1, &client, "client")?;
        let replied = k.take_wakeup(&client).context("client woke without a reply")?;
        let n = replied.status?;
        let echoed = sim.read_user(&client_group, CLIENT_BUF + REPLY_OFFSET, n)?;
        ensure!(echoed == request.as_bytes(), "reply {seq} does not match request");
        bytes += n;
        sim.tick_all();
        debug!(seq, len = n, "echo round trip");
    }
    info!(messages, bytes, "echo finished");
    Ok(Outcome {
        rounds: messages,
        bytes,
    })
}
