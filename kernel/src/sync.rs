//! # Ordered Locking Primitives
//!
//! Lock wrappers that encode their position in the lock hierarchy. Locks
//! are acquired in increasing level order; a lower level may only be taken
//! while holding a higher one through `try_lock`/`try_write`, backing off on
//! failure.
//!
//! | level | what it guards |
//! |---|---|
//! | Registry | kernel-wide registries (recycler, IRQ bindings) |
//! | Table | a cap_group's slot table, its futex table |
//! | Object | an object's copies list, notification or channel state |
//! | Handle | a message handle binding |
//! | Record | an in-flight client message |
//! | Memory | vmspace regions and PMO backing bytes |
//! | Thread | a thread's control block |
//! | Queue | per-core ready queue, sleep queue, current pointer, FPU owner |

use spin::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Lock ordering levels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockLevel {
    Registry = 0,
    Table = 1,
    Object = 2,
    Handle = 3,
    Record = 4,
    Memory = 5,
    Thread = 6,
    Queue = 7,
}

impl LockLevel {
    /// Level for a raw const parameter.
    pub const fn from_u8(level: u8) -> Option<Self> {
        match level {
            0 => Some(LockLevel::Registry),
            1 => Some(LockLevel::Table),
            2 => Some(LockLevel::Object),
            3 => Some(LockLevel::Handle),
            4 => Some(LockLevel::Record),
            5 => Some(LockLevel::Memory),
            6 => Some(LockLevel::Thread),
            7 => Some(LockLevel::Queue),
            _ => None,
        }
    }
}

/// A read-write lock with an associated ordering level.
pub struct OrderedRwLock<T, const LEVEL: u8> {
    inner: RwLock<T>,
    #[cfg(debug_assertions)]
    name: &'static str,
}

impl<T, const LEVEL: u8> OrderedRwLock<T, LEVEL> {
    /// Create a new ordered lock.
    pub const fn new(value: T, _name: &'static str) -> Self {
        Self {
            inner: RwLock::new(value),
            #[cfg(debug_assertions)]
            name: _name,
        }
    }

    #[inline]
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.inner.read()
    }

    #[inline]
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.inner.write()
    }

    #[inline]
    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, T>> {
        self.inner.try_read()
    }

    /// Try to acquire a write lock without spinning.
    #[inline]
    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, T>> {
        self.inner.try_write()
    }

    #[inline]
    pub const fn level(&self) -> u8 {
        LEVEL
    }

    /// Get the lock name (debug builds only).
    #[cfg(debug_assertions)]
    #[inline]
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

/// A spin mutex with an associated ordering level.
pub struct OrderedMutex<T, const LEVEL: u8> {
    inner: Mutex<T>,
    #[cfg(debug_assertions)]
    name: &'static str,
}

impl<T, const LEVEL: u8> OrderedMutex<T, LEVEL> {
    /// Create a new ordered mutex.
    pub const fn new(value: T, _name: &'static str) -> Self {
        Self {
            inner: Mutex::new(value),
            #[cfg(debug_assertions)]
            name: _name,
        }
    }

    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock()
    }

    #[inline]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.inner.try_lock()
    }

    #[inline]
    pub const fn level(&self) -> u8 {
        LEVEL
    }

    #[cfg(debug_assertions)]
    #[inline]
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

/// Level 0 - kernel-wide registries
pub type RegistryLock<T> = OrderedMutex<T, 0>;
/// Level 1 - capability slot tables
pub type TableLock<T> = OrderedRwLock<T, 1>;
/// Level 1 - a cap_group's futex table, never taken with its slot table
pub type FutexLock<T> = OrderedMutex<T, 1>;
/// Level 2 - per-object state
pub type ObjectLock<T> = OrderedMutex<T, 2>;
/// Level 3 - message handle binding
pub type HandleLock<T> = OrderedMutex<T, 3>;
/// Level 4 - in-flight message record
pub type RecordLock<T> = OrderedMutex<T, 4>;
/// Level 5 - address space and memory object contents
pub type MemoryLock<T> = OrderedRwLock<T, 5>;
/// Level 6 - thread control block
pub type ThreadLock<T> = OrderedMutex<T, 6>;
/// Level 7 - per-core queues
pub type QueueLock<T> = OrderedMutex<T, 7>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_levels() {
        let registry: RegistryLock<i32> = RegistryLock::new(42, "test_registry");
        let table: TableLock<i32> = TableLock::new(42, "test_table");
        let thread: ThreadLock<i32> = ThreadLock::new(42, "test_thread");
        let queue: QueueLock<i32> = QueueLock::new(42, "test_queue");

        assert_eq!(LockLevel::from_u8(registry.level()), Some(LockLevel::Registry));
        assert_eq!(LockLevel::from_u8(table.level()), Some(LockLevel::Table));
        assert_eq!(LockLevel::from_u8(thread.level()), Some(LockLevel::Thread));
        assert_eq!(LockLevel::from_u8(queue.level()), Some(LockLevel::Queue));
        assert!(LockLevel::Table < LockLevel::Object);
        assert!(LockLevel::Thread < LockLevel::Queue);
    }

    #[test]
    fn test_read_write() {
        let lock: TableLock<i32> = TableLock::new(42, "test");
        assert_eq!(*lock.read(), 42);
        *lock.write() = 100;
        assert_eq!(*lock.read(), 100);
    }

    #[test]
    fn test_try_lock_contended() {
        let table: TableLock<i32> = TableLock::new(1, "table");
        {
            let _reader = table.read();
            assert!(table.try_write().is_none());
            assert!(table.try_read().is_some());
        }
        assert!(table.try_write().is_some());

        let object: ObjectLock<i32> = ObjectLock::new(1, "object");
        let held = object.lock();
        assert!(object.try_lock().is_none());
        drop(held);
        assert!(object.try_lock().is_some());
    }
}
