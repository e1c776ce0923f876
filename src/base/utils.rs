use std::fmt;

use itertools::Itertools;

use crate::base::{LockMode, MODE_COUNT};

/// Helper struct that wraps a mode bitmask and improves its
/// [`std::fmt::Debug`] formatting. Renders the set bits as the mode
/// shorthands joined with `|`, and an empty mask as `-`, which keeps the
/// lock-head trace output readable.
///
/// # Examples
///
/// ```
/// # use warden::base::LockMode;
/// // granted IS and X -> "IS|X"
/// ```
pub(crate) struct ModeMask(pub u8);

impl fmt::Debug for ModeMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 & !1 == 0 {
            return write!(f, "-");
        }
        let names = (1..MODE_COUNT as u8)
            .filter(|bit| self.0 & (1 << bit) != 0)
            .map(|bit| {
                LockMode::try_from(bit)
                    .expect("mask bits map to lock modes")
                    .to_string()
            })
            .join("|");
        write!(f, "{names}")
    }
}
