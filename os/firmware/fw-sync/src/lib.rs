//! # Firmware synchronization primitives
//!
//! Boot services run on a single processor. Mutual exclusion is obtained by
//! raising the task priority level ([`Tpl`]) so that timer callbacks cannot
//! preempt a critical section. A [`TplMutex`] raises the level on lock and
//! restores it on unlock; taking a lock that is already held is a re-entrancy
//! bug and panics instead of deadlocking.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod tpl;
mod tpl_mutex;

pub use tpl::{Tpl, current_tpl, raise_tpl, restore_tpl};
pub use tpl_mutex::{TplMutex, TplMutexGuard};
