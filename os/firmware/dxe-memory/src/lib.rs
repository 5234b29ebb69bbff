//! # Boot-Time Memory Services
//!
//! Physical memory management for the boot services phase: page
//! allocation, memory map snapshots and sub-page pools, with optional
//! guard pages around selected allocations.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 MemoryServices                      │
//! │    • AllocatePages / FreePages / GetMemoryMap       │
//! │    • AllocatePool / FreePool                        │
//! └──────────┬──────────────────────────────┬───────────┘
//!            │ pool lock                    │ memory lock
//! ┌──────────▼──────────┐        ┌──────────▼───────────┐
//! │   Pool Allocator    │───────▶│      PageState       │
//! │  • size classes     │ pages  │  • bin manager       │
//! │  • head/tail checks │        │  • guard manager     │
//! └─────────────────────┘        │  • page map          │
//!                                └──────────────────────┘
//! ```
//!
//! ## Core Components
//!
//! ### Page Map ([`memory_map`])
//! Non-overlapping, maximally merged ranges of typed memory. New entries are
//! staged in a small fixed stack and later moved into slab storage carved
//! from the memory being managed.
//!
//! ### Memory Type Bins ([`bins`])
//! Ranges reserved per memory type so that runtime memory lands at the same
//! addresses on every boot.
//!
//! ### Heap Guard ([`guard`])
//! A radix bitmap of guarded pages and the logic that places, shares and
//! removes the not-present pages around guarded allocations.
//!
//! ### Pools ([`pool`])
//! Size-class free lists on top of the page path, with signature-checked
//! block heads and tails.
//!
//! ## Collaborators
//!
//! The platform plugs in through [`platform`]: page protection, the resource
//! map, allocation profiling and map change notification. Physical memory
//! is reached through [`phys_memory::PhysMemory`], never through pointers.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

extern crate alloc;

pub mod bins;
pub mod config;
pub mod error;
pub mod guard;
pub mod memory_map;
pub mod pages;
pub mod phys_memory;
pub mod platform;
pub mod pool;
pub mod services;

pub use config::{AllocateType, AllocationKind, GuardPolicy, HeapGuardProperty, MemoryConfig};
pub use error::{CorruptionKind, MemoryError, MemoryMapError};
pub use services::MemoryServices;
