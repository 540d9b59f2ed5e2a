//! # ChCore Kernel Core
//!
//! A capability-based microkernel core, hosted as an ordinary library.
//!
//! ## Design Principles
//!
//! - **Zero Ambient Authority**: every operation names its objects through
//!   capability slots of the calling cap_group
//! - **Explicit Lifetimes**: kernel objects carry a logical reference count
//!   and are torn down exactly once
//! - **Simulated Cores**: each entry point takes the [`CpuId`] it runs on;
//!   hardware is reached only through [`platform::Platform`]
//! - **Safe Points**: scheduling decisions happen at syscall return, timer
//!   and IPI handlers, and inside the blocking primitives
//!
//! Nothing here is global: a [`Kernel`] value owns the object registry, the
//! per-core scheduler state and the recycler.

pub mod cap;
pub mod config;
pub mod error;
pub mod ipc;
pub mod mem;
pub mod object;
pub mod panic;
pub mod platform;
pub mod recycle;
pub mod sched;
pub mod sync;
pub mod syscall;

pub use cap::{Badge, Cap, CapGroupArgs, CapRights, CAP_GROUP_SLOT, VMSPACE_SLOT};
pub use config::KernelConfig;
pub use error::{KResult, KernelError};
pub use ipc::{Blocking, MsgType, SrcMsgInfo, Wakeup};
pub use mem::{PmoKind, UserBuf, VmPerm};
pub use object::{Object, ObjectStats, ObjectType};
pub use platform::{Platform, SimPlatform};
pub use recycle::ExitRecord;
pub use sched::{CoreSnapshot, ThreadArgs, ThreadState};
pub use syscall::SyscallNumber;

use core::sync::atomic::AtomicU64;
use recycle::Recycler;
use sched::thread::ArchContext;
use sched::CoreLocalState;
use std::sync::{Arc, Weak};
use sync::RegistryLock;

/// Kernel version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Index of a simulated core
pub type CpuId = usize;

/// The kernel instance
pub struct Kernel {
    pub(crate) config: KernelConfig,
    pub(crate) platform: Arc<dyn Platform>,
    pub(crate) cores: Vec<CoreLocalState>,
    pub(crate) objects: ObjectStats,
    pub(crate) recycler: RegistryLock<Option<Recycler>>,
    /// Bound interrupt lines
    pub(crate) irqs: RegistryLock<hashbrown::HashMap<u32, Weak<Object>>>,
    pub(crate) timer_seq: AtomicU64,
}

/// The first cap_group and its initial thread
pub struct RootTask {
    pub group: Arc<Object>,
    pub thread: Arc<Object>,
}

impl Kernel {
    /// Bring up `config.sched.cpus` cores, each running its idle thread.
    pub fn new(config: KernelConfig, platform: Arc<dyn Platform>) -> Self {
        log::info!("ChCore kernel v{VERSION} starting on {} cores", config.sched.cpus);
        let cores = (0..config.sched.cpus).map(CoreLocalState::new).collect();
        Self {
            config,
            platform,
            cores,
            objects: ObjectStats::new(),
            recycler: RegistryLock::new(None, "recycler"),
            irqs: RegistryLock::new(hashbrown::HashMap::new(), "irq_table"),
            timer_seq: AtomicU64::new(0),
        }
    }

    /// Create the root cap_group with one thread and run it on core 0.
    ///
    /// The thread's cap sits in slot 2 of the group. The group is never
    /// freed: the returned handle keeps the allocation reference.
    pub fn create_root_task(&self, args: CapGroupArgs, pc: u64) -> KResult<RootTask> {
        let group = self.new_cap_group(args)?;
        let ctx = ArchContext { pc, sp: 0, arg: 0 };
        let thread = self.new_thread(&group, ctx, self.config.sched.default_prio, None)?;
        self.cap_alloc(&group, thread.clone(), CapRights::ALL)?;
        self.start_thread(Some(0), &group, &thread);
        self.reschedule(0);
        log::debug!("root task {:?} running on cpu 0", group.id());
        Ok(RootTask { group, thread })
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    /// Per-type allocation counters.
    pub fn objects(&self) -> &ObjectStats {
        &self.objects
    }
}
