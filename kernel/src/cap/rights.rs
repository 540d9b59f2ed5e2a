//! Capability rights definitions

use crate::error::{KResult, KernelError};
use bitflags::bitflags;

bitflags! {
    /// Rights carried by a capability slot
    ///
    /// - Object-specific (0-61): meaning depends on the object type
    /// - Reserved (62-63): `COPY` and `REVOKE_ALL`, never reused per type
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CapRights: u64 {
        // === Memory object rights (bits 0-2) ===

        /// Map readable / read user memory
        const READ = 1 << 0;
        /// Map writable / write user memory
        const WRITE = 1 << 1;
        /// Map executable
        const EXEC = 1 << 2;

        // === Reserved (bits 62-63) ===

        /// Copy with rights that are not a subset of this slot's
        const COPY = 1 << 62;
        /// Revoke every copy of the object
        const REVOKE_ALL = 1 << 63;

        /// Bits available to object types
        const OBJECT_MASK = !(Self::COPY.bits() | Self::REVOKE_ALL.bits());
        /// What the creator of an object receives
        const ALL = !0;
        /// No rights beyond naming the object
        const NONE = 0;
    }
}

impl CapRights {
    /// Check if this rights set is a subset of another
    #[inline]
    pub fn is_subset_of(self, other: CapRights) -> bool {
        (self.bits() & !other.bits()) == 0
    }

    /// Fail with `PermissionDenied` unless every bit of `needed` is held.
    #[inline]
    pub fn require(self, needed: CapRights) -> KResult<()> {
        if needed.is_subset_of(self) {
            Ok(())
        } else {
            Err(KernelError::PermissionDenied)
        }
    }

    /// Rights a new copy receives.
    ///
    /// With `restrict` the request must be a subset of `current`. Without
    /// it, the copy keeps `current` unless the request differs, which needs
    /// `COPY` on the source.
    pub fn derive(current: CapRights, restrict: bool, requested: CapRights) -> KResult<CapRights> {
        if restrict {
            if requested.is_subset_of(current) {
                Ok(requested)
            } else {
                Err(KernelError::PermissionDenied)
            }
        } else if requested == current || current.contains(CapRights::COPY) {
            Ok(requested)
        } else {
            Err(KernelError::PermissionDenied)
        }
    }

    /// Get human-readable description of rights
    pub fn description(&self) -> String {
        if *self == CapRights::ALL {
            return String::from("all");
        }
        let mut parts: Vec<&str> = Vec::new();
        if self.contains(CapRights::READ) {
            parts.push("read");
        }
        if self.contains(CapRights::WRITE) {
            parts.push("write");
        }
        if self.contains(CapRights::EXEC) {
            parts.push("exec");
        }
        if self.contains(CapRights::COPY) {
            parts.push("copy");
        }
        if self.contains(CapRights::REVOKE_ALL) {
            parts.push("revoke_all");
        }
        if parts.is_empty() {
            String::from("none")
        } else {
            parts.join("+")
        }
    }
}

impl core::fmt::Display for CapRights {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_bits_are_top_two() {
        assert_eq!(CapRights::REVOKE_ALL.bits(), 1 << 63);
        assert_eq!(CapRights::COPY.bits(), 1 << 62);
        assert!(!CapRights::OBJECT_MASK.intersects(CapRights::COPY | CapRights::REVOKE_ALL));
        assert!((CapRights::READ | CapRights::WRITE | CapRights::EXEC)
            .is_subset_of(CapRights::OBJECT_MASK));
    }

    #[test]
    fn test_subset() {
        let full = CapRights::READ | CapRights::WRITE | CapRights::COPY;
        assert!(CapRights::READ.is_subset_of(full));
        assert!(!full.is_subset_of(CapRights::READ));
        assert!(CapRights::empty().is_subset_of(CapRights::READ));
    }

    #[test]
    fn test_derive_restricted() {
        let rw = CapRights::READ | CapRights::WRITE;
        assert_eq!(CapRights::derive(rw, true, CapRights::READ), Ok(CapRights::READ));
        assert_eq!(
            CapRights::derive(rw, true, CapRights::EXEC),
            Err(KernelError::PermissionDenied)
        );
    }

    #[test]
    fn test_derive_unrestricted_needs_copy_to_widen() {
        let rw = CapRights::READ | CapRights::WRITE;
        assert_eq!(CapRights::derive(rw, false, rw), Ok(rw));
        assert_eq!(
            CapRights::derive(rw, false, CapRights::EXEC),
            Err(KernelError::PermissionDenied)
        );
        let rwc = rw | CapRights::COPY;
        assert_eq!(CapRights::derive(rwc, false, CapRights::EXEC), Ok(CapRights::EXEC));
    }

    #[test]
    fn test_require() {
        let r = CapRights::READ | CapRights::REVOKE_ALL;
        assert!(r.require(CapRights::REVOKE_ALL).is_ok());
        assert_eq!(r.require(CapRights::WRITE), Err(KernelError::PermissionDenied));
    }

    #[test]
    fn test_description() {
        assert_eq!(CapRights::ALL.to_string(), "all");
        assert_eq!((CapRights::READ | CapRights::COPY).to_string(), "read+copy");
        assert_eq!(CapRights::NONE.to_string(), "none");
    }
}
