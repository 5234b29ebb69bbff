//! # Firmware Memory Configuration
//!
//! Constants and small data layouts shared by the boot-time memory manager
//! and its embedders.
//!
//! ### Memory Layout ([`memory`])
//! * **Granules**: the UEFI page and the runtime allocation granule
//! * **Bootstrap limits**: depth of the descriptor scratch stack
//! * **Snapshot format**: descriptor stride and version
//!
//! ### Memory Types ([`memory_type`])
//! Classification helpers over [`uefi::mem::memory_map::MemoryType`]: which
//! types may be allocated, which need runtime alignment, which get
//! dedicated bins, and where OEM and OS defined types live.
//!
//! ### Memory Map Metadata ([`map`])
//! The values returned alongside a memory map snapshot.
//!
//! All layout constants are validated at compile time.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod map;
pub mod memory;
pub mod memory_type;

pub use memory_type::MemoryTypeExt;
