//! Task priority levels.

use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

/// A UEFI task priority level.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Tpl(pub usize);

impl Tpl {
    pub const APPLICATION: Self = Self(4);
    pub const CALLBACK: Self = Self(8);
    pub const NOTIFY: Self = Self(16);
    pub const HIGH_LEVEL: Self = Self(31);
}

impl fmt::Debug for Tpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::APPLICATION => f.write_str("TPL_APPLICATION"),
            Self::CALLBACK => f.write_str("TPL_CALLBACK"),
            Self::NOTIFY => f.write_str("TPL_NOTIFY"),
            Self::HIGH_LEVEL => f.write_str("TPL_HIGH_LEVEL"),
            Self(other) => write!(f, "TPL({other})"),
        }
    }
}

static CURRENT: AtomicUsize = AtomicUsize::new(Tpl::APPLICATION.0);

/// The level the processor currently runs at.
#[must_use]
pub fn current_tpl() -> Tpl {
    Tpl(CURRENT.load(Ordering::Acquire))
}

/// Raises the current level to at least `tpl` and returns the previous one.
///
/// Raising to a lower level than the current one leaves the level unchanged.
#[must_use = "the previous level must be handed back to restore_tpl"]
pub fn raise_tpl(tpl: Tpl) -> Tpl {
    Tpl(CURRENT.fetch_max(tpl.0, Ordering::AcqRel))
}

/// Restores a level previously returned by [`raise_tpl`].
pub fn restore_tpl(old: Tpl) {
    CURRENT.store(old.0, Ordering::Release);
}
