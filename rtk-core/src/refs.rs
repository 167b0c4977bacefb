//! Object references
//!
//! Every link between kernel objects (ready ring, timeslice ring, owner
//! back-references, helper and donatee) is an index into an
//! [`ObjectTable`](crate::table::ObjectTable), never a pointer.
//!
//! # Null Reference
//!
//! Index 0 is reserved. A reference with index 0 (`NULL`) refers to no
//! object; valid indices start at 1.

use core::fmt;

/// Key type accepted by [`ObjectTable`](crate::table::ObjectTable).
pub trait ObjectKey: Copy + Eq {
    /// Build a key from a raw table index.
    fn from_index(index: u32) -> Self;

    /// Raw table index of this key.
    fn index(self) -> u32;
}

macro_rules! object_ref {
    ($(#[$meta:meta])* $name:ident, $tag:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Default, Hash, PartialOrd, Ord)]
        #[repr(transparent)]
        pub struct $name(u32);

        impl $name {
            /// Null reference (no object).
            pub const NULL: Self = Self(0);

            /// Create a reference from a raw index.
            #[inline]
            #[must_use]
            pub const fn from_index(index: u32) -> Self {
                Self(index)
            }

            /// Get the raw index value.
            #[inline]
            #[must_use]
            pub const fn index(self) -> u32 {
                self.0
            }

            /// Check if this is a null reference.
            #[inline]
            #[must_use]
            pub const fn is_null(self) -> bool {
                self.0 == 0
            }

            /// Check if this is a valid (non-null) reference.
            #[inline]
            #[must_use]
            pub const fn is_valid(self) -> bool {
                self.0 != 0
            }

            /// `None` for the null reference.
            #[inline]
            #[must_use]
            pub const fn to_option(self) -> Option<Self> {
                if self.is_null() { None } else { Some(self) }
            }
        }

        impl ObjectKey for $name {
            #[inline]
            fn from_index(index: u32) -> Self {
                Self(index)
            }

            #[inline]
            fn index(self) -> u32 {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if self.is_null() {
                    write!(f, concat!(stringify!($name), "::NULL"))
                } else {
                    write!(f, concat!(stringify!($name), "({})"), self.0)
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if self.is_null() {
                    write!(f, "null")
                } else {
                    write!(f, concat!($tag, "#{}"), self.0)
                }
            }
        }
    };
}

object_ref!(
    /// Reference to an execution context (thread control block).
    ContextRef,
    "ctx"
);

object_ref!(
    /// Reference to a scheduling context (one timeslice).
    SchedRef,
    "sc"
);

object_ref!(
    /// Reference to a timeout object.
    TimeoutRef,
    "to"
);

/// Logical CPU number.
pub type CpuId = usize;

/// Opaque address-space handle.
///
/// The scheduler never interprets it; it is handed to the low-level
/// switch so the collaborator can load the right page tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Hash)]
#[repr(transparent)]
pub struct SpaceId(pub u32);

/// Time in microseconds.
pub type Time = u64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_refs() {
        assert!(ContextRef::NULL.is_null());
        assert!(!SchedRef::from_index(3).is_null());
        assert_eq!(TimeoutRef::from_index(7).index(), 7);
        assert_eq!(ContextRef::NULL.to_option(), None);
        assert_eq!(
            ContextRef::from_index(2).to_option(),
            Some(ContextRef::from_index(2))
        );
    }

    #[test]
    fn test_ref_formatting() {
        assert_eq!(format!("{:?}", ContextRef::NULL), "ContextRef::NULL");
        assert_eq!(format!("{:?}", SchedRef::from_index(4)), "SchedRef(4)");
        assert_eq!(format!("{}", ContextRef::from_index(9)), "ctx#9");
        assert_eq!(format!("{}", TimeoutRef::NULL), "null");
    }
}
