//! Version-slot payload encoding
//!
//! Each version slot of a multi-version row is a single 64-bit word that
//! is either a payload pointer or one of the reserved sentinels:
//!
//! - **pending**: the version exists but its value has not been produced.
//!   The high 32 bits are all ones; the low 32 bits are the *not-waiting*
//!   core bitmap (a waiter clears its bit before spinning, and the writer
//!   notifies every cleared bit when it publishes).
//! - **ignore**: a rolled-back priority write; readers skip to the
//!   previous version.
//! - **tombstone** (0): a committed delete.
//!
//! Heap pointers never carry all-ones in their high 32 bits on the
//! supported platforms, so the encodings cannot collide.

/// High-32-bit prefix marking a pending slot.
const PENDING_PREFIX: u64 = 0xFFFF_FFFF;

/// A freshly appended pending slot: no payload, no waiters.
pub const PENDING_FRESH: u64 = (PENDING_PREFIX << 32) | 0xFFFF_FFFF;

/// The rolled-back marker.
pub const IGNORE: u64 = 0xFFFF_FFFE << 32;

/// A committed delete.
pub const TOMBSTONE: u64 = 0;

/// Mask of the waiter bitmap inside a pending slot.
pub const WAITER_MASK: u64 = 0xFFFF_FFFF;

/// True when `v` is a pending slot (with any waiter bitmap).
pub const fn is_pending(v: u64) -> bool {
    (v >> 32) == PENDING_PREFIX
}

/// True when `v` is the rolled-back marker.
pub const fn is_ignore(v: u64) -> bool {
    v == IGNORE
}

/// True when `v` is a committed delete.
pub const fn is_tombstone(v: u64) -> bool {
    v == TOMBSTONE
}

/// True when `v` carries a readable payload pointer.
pub const fn is_value(v: u64) -> bool {
    !is_pending(v) && !is_ignore(v) && !is_tombstone(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinels_are_disjoint() {
        assert!(is_pending(PENDING_FRESH));
        assert!(!is_pending(IGNORE));
        assert!(!is_pending(TOMBSTONE));
        assert!(is_ignore(IGNORE));
        assert!(!is_ignore(PENDING_FRESH));
        assert!(is_tombstone(TOMBSTONE));
    }

    #[test]
    fn test_pending_with_waiters_is_still_pending() {
        // Core 3 cleared its bit.
        let v = PENDING_FRESH & !(1u64 << 3);
        assert!(is_pending(v));
        assert!(!is_value(v));
    }

    #[test]
    fn test_heap_pointers_classify_as_values() {
        let boxed = Box::new(7u64);
        let p = Box::into_raw(boxed) as u64;
        assert!(is_value(p));
        unsafe { drop(Box::from_raw(p as *mut u64)) };
    }
}
