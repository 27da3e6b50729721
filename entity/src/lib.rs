//! Array-based data structures using densely numbered entity references
//! as mapping keys.
//!
//! The compiler engine identifies blocks, values, sections, symbols, and
//! labels with small integers wrapped in typed index newtypes. This crate
//! provides the shared plumbing for those types:
//!
//! - The `entity_impl!` macro implements [`EntityRef`] for a wrapper around
//!   `u32`.
//! - [`PrimaryMap`] allocates new entity references and stores the primary
//!   record for each.
//! - [`SecondaryMap`] associates further data with entities allocated
//!   elsewhere, behaving as if every key is present from the start.

#![deny(missing_docs)]

/// A type wrapping a small integer index that names an entity.
pub trait EntityRef: Copy + Eq {
    /// Create a new entity reference from a small integer.
    /// This should crash if the requested index is not representable.
    fn new(index: usize) -> Self;

    /// Get the index that was used to create this entity reference.
    fn index(self) -> usize;
}

/// Macro which provides the common implementation of a 32-bit entity
/// reference: `EntityRef`, `Display` with a prefix, and a `u32`
/// conversion surface.
#[macro_export]
macro_rules! entity_impl {
    ($entity:ident) => {
        impl $crate::EntityRef for $entity {
            #[inline]
            fn new(index: usize) -> Self {
                debug_assert!(index < (u32::MAX as usize));
                $entity(index as u32)
            }

            #[inline]
            fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl $entity {
            /// Create a new instance from a `u32`.
            #[inline]
            #[allow(dead_code)]
            pub fn from_u32(x: u32) -> Self {
                debug_assert!(x < u32::MAX);
                $entity(x)
            }

            /// Return the underlying index value as a `u32`.
            #[inline]
            #[allow(dead_code)]
            pub fn as_u32(self) -> u32 {
                self.0
            }
        }
    };

    ($entity:ident, $display_prefix:expr) => {
        $crate::entity_impl!($entity);

        impl ::core::fmt::Display for $entity {
            fn fmt(&self, f: &mut ::core::fmt::Formatter) -> ::core::fmt::Result {
                write!(f, concat!($display_prefix, "{}"), self.0)
            }
        }

        impl ::core::fmt::Debug for $entity {
            fn fmt(&self, f: &mut ::core::fmt::Formatter) -> ::core::fmt::Result {
                (self as &dyn ::core::fmt::Display).fmt(f)
            }
        }
    };
}

mod keys;
mod map;
mod primary;

pub use self::keys::Keys;
pub use self::map::SecondaryMap;
pub use self::primary::PrimaryMap;
