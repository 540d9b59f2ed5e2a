//! # Kernel Object Store
//!
//! Every kernel resource is an [`Object`]: a type-tagged body, a logical
//! reference count and the list of capability slots that point at it.
//!
//! ## Reference counting
//!
//! Storage is held by `Arc`, but liveness follows the explicit `refcount`.
//! Each capability slot and each long-lived kernel reference (a thread's
//! vmspace, a mapping's PMO) owns one unit. The unit that takes the count to
//! zero runs the per-type deinit exactly once; afterwards the object is dead
//! and taking a new reference on it is a kernel bug. Transient kernel
//! pointers (queue entries, the per-core `current` slot) are plain `Arc`
//! clones and own no unit.

use crate::cap::{Cap, CapGroup, CapRights};
use crate::error::{KResult, KernelError};
use crate::ipc::channel::{Channel, MsgHdl};
use crate::ipc::irq::IrqNotification;
use crate::ipc::notification::Notification;
use crate::mem::{Pmo, VmSpace};
use crate::sched::thread::Thread;
use crate::sync::ObjectLock;
use crate::{kernel_bug, Kernel};
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Global object ID counter
static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// Globally unique object identifier
///
/// - Bits 0-55: Unique counter
/// - Bits 56-63: Object type tag
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u64);

impl ObjectId {
    fn new(object_type: ObjectType) -> Self {
        let counter = NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed);
        Self(counter | ((object_type as u64) << 56))
    }

    pub fn object_type(&self) -> Option<ObjectType> {
        ObjectType::from_u8((self.0 >> 56) as u8)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl core::fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.object_type() {
            Some(ty) => write!(f, "{:?}#{}", ty, self.0 & 0x00FF_FFFF_FFFF_FFFF),
            None => write!(f, "?#{}", self.0),
        }
    }
}

/// Types of kernel objects
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    CapGroup = 1,
    Thread = 2,
    /// IPC channel (a "connection" between clients and one server group)
    Channel = 3,
    MsgHdl = 4,
    Notification = 5,
    Irq = 6,
    Pmo = 7,
    VmSpace = 8,
}

impl ObjectType {
    /// Every object type, in tag order.
    pub const ALL: [ObjectType; 8] = [
        ObjectType::CapGroup,
        ObjectType::Thread,
        ObjectType::Channel,
        ObjectType::MsgHdl,
        ObjectType::Notification,
        ObjectType::Irq,
        ObjectType::Pmo,
        ObjectType::VmSpace,
    ];

    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|t| *t as u8 == value)
    }

    const fn index(self) -> usize {
        self as usize - 1
    }
}

/// Type-specific object state
pub enum ObjectBody {
    CapGroup(CapGroup),
    Thread(Thread),
    Channel(Channel),
    MsgHdl(MsgHdl),
    Notification(Notification),
    Irq(IrqNotification),
    Pmo(Pmo),
    VmSpace(VmSpace),
}

impl ObjectBody {
    pub fn object_type(&self) -> ObjectType {
        match self {
            ObjectBody::CapGroup(_) => ObjectType::CapGroup,
            ObjectBody::Thread(_) => ObjectType::Thread,
            ObjectBody::Channel(_) => ObjectType::Channel,
            ObjectBody::MsgHdl(_) => ObjectType::MsgHdl,
            ObjectBody::Notification(_) => ObjectType::Notification,
            ObjectBody::Irq(_) => ObjectType::Irq,
            ObjectBody::Pmo(_) => ObjectType::Pmo,
            ObjectBody::VmSpace(_) => ObjectType::VmSpace,
        }
    }
}

/// A slot that currently references an object
#[derive(Clone, Debug)]
pub(crate) struct CopyRef {
    pub group: Weak<Object>,
    pub cap: Cap,
}

/// A reference-counted kernel object
pub struct Object {
    id: ObjectId,
    refcount: AtomicUsize,
    alive: AtomicBool,
    pub(crate) copies: ObjectLock<Vec<CopyRef>>,
    body: ObjectBody,
}

macro_rules! body_accessor {
    ($name:ident, $variant:ident, $ty:ty) => {
        pub fn $name(&self) -> Option<&$ty> {
            match &self.body {
                ObjectBody::$variant(inner) => Some(inner),
                _ => None,
            }
        }
    };
}

impl Object {
    /// A live object with one reference.
    ///
    /// [`Kernel::obj_alloc`] wraps this with quota and statistics; per-core
    /// idle threads and futex queues are built directly and never put.
    pub(crate) fn new(body: ObjectBody) -> Arc<Self> {
        Arc::new(Object {
            id: ObjectId::new(body.object_type()),
            refcount: AtomicUsize::new(1),
            alive: AtomicBool::new(true),
            copies: ObjectLock::new(Vec::new(), "object_copies"),
            body,
        })
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn object_type(&self) -> ObjectType {
        self.body.object_type()
    }

    pub fn body(&self) -> &ObjectBody {
        &self.body
    }

    /// Current logical reference count.
    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    /// False once deinit has run.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Number of slots currently referencing this object.
    pub fn copy_count(&self) -> usize {
        self.copies.lock().len()
    }

    body_accessor!(as_cap_group, CapGroup, CapGroup);
    body_accessor!(as_thread, Thread, Thread);
    body_accessor!(as_channel, Channel, Channel);
    body_accessor!(as_msg_hdl, MsgHdl, MsgHdl);
    body_accessor!(as_irq, Irq, IrqNotification);
    body_accessor!(as_pmo, Pmo, Pmo);
    body_accessor!(as_vmspace, VmSpace, VmSpace);

    /// The waitable notification of this object.
    ///
    /// IRQ objects embed one, so both types can be waited on.
    pub fn as_notification(&self) -> Option<&Notification> {
        match &self.body {
            ObjectBody::Notification(n) => Some(n),
            ObjectBody::Irq(irq) => Some(irq.notification()),
            _ => None,
        }
    }
}

impl core::fmt::Debug for Object {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Object")
            .field("id", &self.id)
            .field("refcount", &self.refcount())
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Per-type allocation counters
pub struct ObjectStats {
    allocated: [AtomicUsize; ObjectType::ALL.len()],
    freed: [AtomicUsize; ObjectType::ALL.len()],
}

impl ObjectStats {
    pub(crate) fn new() -> Self {
        Self {
            allocated: Default::default(),
            freed: Default::default(),
        }
    }

    pub fn allocated(&self, ty: ObjectType) -> usize {
        self.allocated[ty.index()].load(Ordering::Relaxed)
    }

    /// Objects of `ty` whose deinit has run.
    pub fn freed(&self, ty: ObjectType) -> usize {
        self.freed[ty.index()].load(Ordering::Relaxed)
    }

    pub fn live(&self, ty: ObjectType) -> usize {
        self.allocated(ty) - self.freed(ty)
    }

    pub fn total_live(&self) -> usize {
        ObjectType::ALL.into_iter().map(|ty| self.live(ty)).sum()
    }
}

/// A counted reference obtained through [`Kernel::obj_get`], released on drop
pub struct ObjGuard<'k> {
    kernel: &'k Kernel,
    obj: Arc<Object>,
}

impl<'k> ObjGuard<'k> {
    pub fn arc(&self) -> &Arc<Object> {
        &self.obj
    }

    /// Keep the counted reference past the guard's lifetime.
    ///
    /// The caller becomes responsible for a matching [`Kernel::obj_put`].
    pub fn into_counted(self) -> Arc<Object> {
        self.kernel.obj_ref(&self.obj);
        self.obj.clone()
    }
}

impl core::ops::Deref for ObjGuard<'_> {
    type Target = Object;

    fn deref(&self) -> &Object {
        &self.obj
    }
}

impl Drop for ObjGuard<'_> {
    fn drop(&mut self) {
        self.kernel.obj_put(&self.obj);
    }
}

impl Kernel {
    /// Allocate an object holding one reference owned by the caller.
    ///
    /// The reference must end up in a slot ([`Kernel::cap_alloc`]) or be
    /// released with [`Kernel::obj_put`].
    pub fn obj_alloc(&self, body: ObjectBody) -> KResult<Arc<Object>> {
        if self.objects.total_live() >= self.config.cap.max_objects {
            log::warn!("object quota exhausted");
            return Err(KernelError::OutOfMemory);
        }
        let ty = body.object_type();
        let obj = Object::new(body);
        self.objects.allocated[ty.index()].fetch_add(1, Ordering::Relaxed);
        log::debug!("obj_alloc {:?}", obj.id);
        Ok(obj)
    }

    /// Take another reference on a live object.
    pub fn obj_ref(&self, obj: &Arc<Object>) {
        let prev = obj.refcount.fetch_add(1, Ordering::AcqRel);
        crate::bug_on!(prev == 0, "obj_ref resurrects dead object {:?}", obj.id);
    }

    /// Drop one reference, running deinit when it was the last.
    pub fn obj_put(&self, obj: &Arc<Object>) {
        let prev = obj.refcount.fetch_sub(1, Ordering::AcqRel);
        match prev {
            0 => kernel_bug!("refcount underflow on {:?}", obj.id),
            1 => self.obj_deinit(obj),
            _ => {}
        }
    }

    /// Resolve `cap` in `group`, checking the type and taking a reference.
    pub fn obj_get(
        &self,
        group: &Arc<Object>,
        cap: Cap,
        expected: ObjectType,
    ) -> KResult<ObjGuard<'_>> {
        let cap_group = group.as_cap_group().ok_or(KernelError::BadCapability)?;
        let table = cap_group.table.read();
        let slot = table.get(cap).ok_or(KernelError::BadCapability)?;
        if slot.object.object_type() != expected {
            return Err(KernelError::BadCapability);
        }
        // The slot holds a unit, so the count cannot be zero here.
        self.obj_ref(&slot.object);
        Ok(ObjGuard {
            kernel: self,
            obj: slot.object.clone(),
        })
    }

    /// Like [`Kernel::obj_get`], also returning the slot's rights.
    pub fn obj_get_with_rights(
        &self,
        group: &Arc<Object>,
        cap: Cap,
        expected: ObjectType,
    ) -> KResult<(ObjGuard<'_>, CapRights)> {
        let cap_group = group.as_cap_group().ok_or(KernelError::BadCapability)?;
        let table = cap_group.table.read();
        let slot = table.get(cap).ok_or(KernelError::BadCapability)?;
        if slot.object.object_type() != expected {
            return Err(KernelError::BadCapability);
        }
        self.obj_ref(&slot.object);
        let guard = ObjGuard {
            kernel: self,
            obj: slot.object.clone(),
        };
        Ok((guard, slot.rights))
    }

    fn obj_deinit(&self, obj: &Arc<Object>) {
        log::debug!("obj_deinit {:?}", obj.id);
        obj.alive.store(false, Ordering::Release);
        match &obj.body {
            ObjectBody::CapGroup(_) => self.cap_group_deinit(obj),
            ObjectBody::Thread(_) => self.thread_deinit(obj),
            ObjectBody::Channel(_) => self.channel_deinit(obj),
            ObjectBody::MsgHdl(_) => self.msg_hdl_deinit(obj),
            ObjectBody::Notification(notif) => self.notification_deinit(notif),
            ObjectBody::Irq(irq) => self.irq_deinit(irq),
            ObjectBody::Pmo(pmo) => self.pmo_deinit(pmo),
            ObjectBody::VmSpace(vmspace) => self.vmspace_deinit(vmspace),
        }
        self.objects.freed[obj.object_type().index()].fetch_add(1, Ordering::Relaxed);
    }
}
