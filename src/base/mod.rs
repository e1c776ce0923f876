//! This module contains base types that are used across Warden: the
//! lock-mode lattice with its conflict tables, resource identifiers, and
//! the crate error type.

use num_enum::{IntoPrimitive, TryFromPrimitive};

mod resource;
mod utils;

pub use resource::{ResourceId, ResourceType, namespace_db};
pub(crate) use resource::{mutex_label, register_mutex_label};
pub(crate) use utils::ModeMask;

/// Number of lock modes, including [`LockMode::None`].
pub(crate) const MODE_COUNT: usize = 5;

/// A lock mode. Intent modes announce that finer-grained locks below will
/// be taken in the corresponding full mode; `Shared`/`Exclusive` are the
/// terminal read/write modes.
///
/// # Compatibility Between Lock Modes
///
/// Two modes held on the same resource by *different* holders may coexist
/// iff the matrix below says so. An incompatible request blocks.
///
/// | Requested \ Held | IS  | IX  |  S  | X  |
/// |------------------|-----|-----|-----|----|
/// |        IS        | Yes | Yes | Yes | No |
/// |        IX        | Yes | Yes | No  | No |
/// |        S         | Yes | No  | Yes | No |
/// |        X         | No  | No  | No  | No |
///
/// The *same* holder re-requesting a mode never blocks on itself: an equal
/// or weaker request is absorbed ([`covers`](Self::covers)), a stronger one
/// upgrades to the least upper bound ([`lub`](Self::lub)).
#[repr(u8)]
#[derive(
    Debug, Display, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive, Default,
)]
#[cfg_attr(test, derive(strum::EnumIter))]
pub enum LockMode {
    /// Not locked. Never granted, only ever the absence of a lock.
    #[display("NONE")]
    #[default]
    None = 0,
    /// Intent to take `Shared` locks further down the hierarchy.
    #[display("IS")]
    IntentShared = 1,
    /// Intent to take `Exclusive` locks further down the hierarchy.
    #[display("IX")]
    IntentExclusive = 2,
    /// Locked for reading.
    #[display("S")]
    Shared = 3,
    /// Locked for writing; excludes everything.
    #[display("X")]
    Exclusive = 4,
}

const NONE_BIT: u8 = 1 << LockMode::None as u8;
const IS_BIT: u8 = 1 << LockMode::IntentShared as u8;
const IX_BIT: u8 = 1 << LockMode::IntentExclusive as u8;
const S_BIT: u8 = 1 << LockMode::Shared as u8;
const X_BIT: u8 = 1 << LockMode::Exclusive as u8;

/// For each requested mode, the mask of held modes it conflicts with.
const CONFLICTS: [u8; MODE_COUNT] = [
    0,                                     // NONE
    X_BIT,                                 // IS
    S_BIT | X_BIT,                         // IX
    IX_BIT | X_BIT,                        // S
    IS_BIT | IX_BIT | S_BIT | X_BIT,       // X
];

/// For each held mode, the mask of requested modes it already satisfies.
const COVERS: [u8; MODE_COUNT] = [
    NONE_BIT,                              // NONE
    NONE_BIT | IS_BIT,                     // IS
    NONE_BIT | IS_BIT | IX_BIT,            // IX
    NONE_BIT | IS_BIT | S_BIT,             // S
    NONE_BIT | IS_BIT | IX_BIT | S_BIT | X_BIT, // X
];

impl LockMode {
    /// The bit representing this mode in a conflict/grant mask.
    #[inline]
    pub(crate) const fn bit(self) -> u8 {
        1 << self as u8
    }

    /// Whether a request for this mode conflicts with the given mask of
    /// held modes.
    #[inline]
    pub(crate) const fn conflicts_with(self, held: u8) -> bool {
        CONFLICTS[self as usize] & held != 0
    }

    /// Whether holding `self` already satisfies a request for `weaker`.
    /// This is the partial order of the lattice `NONE < IS < IX,S < X`;
    /// `IX` and `S` are incomparable.
    #[inline]
    pub const fn covers(self, weaker: Self) -> bool {
        COVERS[self as usize] & weaker.bit() != 0
    }

    /// The least upper bound of two modes in the lattice. The target mode
    /// of an upgrade: holding `IX` and requesting `S` must go to `X`.
    pub(crate) fn lub(self, other: Self) -> Self {
        if self.covers(other) {
            self
        } else if other.covers(self) {
            other
        } else {
            LockMode::Exclusive
        }
    }

    /// Whether this is a read-side mode (`IS` or `S`).
    #[inline]
    pub const fn is_shared(self) -> bool {
        matches!(self, LockMode::IntentShared | LockMode::Shared)
    }

    /// The intent mode a parent resource must be held in before taking
    /// this mode on a child: `IS` for the shared modes, `IX` otherwise.
    #[inline]
    pub(crate) const fn intent(self) -> Self {
        if self.is_shared() {
            LockMode::IntentShared
        } else {
            LockMode::IntentExclusive
        }
    }
}

#[derive(Debug, Display, Error)]
pub enum WardenError {
    #[display("lock acquisition timed out: {resource:?} in mode {mode}")]
    LockTimeout {
        resource: ResourceId,
        mode: LockMode,
    },
    #[display("write conflict, operation must retry")]
    WriteConflict,
    #[display("{_0}")]
    Other(#[error(not(source))] &'static str),
}

pub type WardenResult<T> = Result<T, WardenError>;
