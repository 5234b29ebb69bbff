//! Long deterministic sequences of allocations and frees, checking the map
//! invariants after every step.

use dxe_memory::memory_map::entry::MemoryMapEntry;
use dxe_memory::memory_map::{BinRange, Conversion, MemoryMap};
use dxe_memory::phys_memory::TestRam;
use dxe_memory::{AllocateType, GuardPolicy, HeapGuardProperty, MemoryConfig, MemoryServices};
use fw_memory_addresses::{PAGE_SHIFT, PAGE_SIZE, PhysicalAddress};
use uefi::mem::memory_map::{MemoryAttribute, MemoryType};

const BASE: u64 = 0x10_0000;
const PAGES: u64 = 1024;
const STEPS: usize = 600;

/// Small linear congruential generator, so every run sees the same sequence.
struct Lcg(u64);

impl Lcg {
    fn below(&mut self, bound: u64) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        (self.0 >> 33) % bound
    }

    fn pick<T: Copy>(&mut self, items: &[T]) -> T {
        items[usize::try_from(self.below(items.len() as u64)).expect("index")]
    }
}

const TYPES: [MemoryType; 4] = [
    MemoryType::LOADER_DATA,
    MemoryType::BOOT_SERVICES_CODE,
    MemoryType::BOOT_SERVICES_DATA,
    MemoryType::ACPI_RECLAIM,
];

fn addr(a: u64) -> PhysicalAddress {
    PhysicalAddress::new(a)
}

fn check_map(map: &MemoryMap, bin: BinRange, step: usize) {
    let entries: Vec<MemoryMapEntry> = map.iter().copied().collect();
    for pair in entries.windows(2) {
        assert!(pair[0].end < pair[1].start, "step {step}: unsorted or overlapping {pair:?}");
        assert!(!pair[0].can_merge(&pair[1]), "step {step}: unmerged {pair:?}");
    }
    for entry in &entries {
        if entry.bin.is_some() {
            assert!(entry.is_free(), "step {step}: tagged allocation {entry:?}");
            assert!(entry.start >= bin.start && entry.end <= bin.end, "step {step}: {entry:?}");
        }
    }
    let total: u64 = entries.iter().map(MemoryMapEntry::pages).sum();
    assert_eq!(total, PAGES, "step {step}: tracked pages");
}

#[test]
fn map_invariants_hold_for_random_sequences() {
    let top = addr(BASE + (PAGES << PAGE_SHIFT) - 1);
    let bin = BinRange {
        memory_type: MemoryType::RESERVED,
        start: addr(0x20_0000),
        end: addr(0x20_FFFF),
    };
    let mut map = MemoryMap::new();
    map.add_range(MemoryType::CONVENTIONAL, addr(BASE), top, MemoryAttribute::WRITE_BACK)
        .expect("add");
    map.register_bin(bin).expect("bin");
    map.drain(top, top).expect("drain");

    let mut rng = Lcg(0x5EED);
    let mut live: Vec<(PhysicalAddress, u64, MemoryType)> = Vec::new();
    for step in 0..STEPS {
        if live.is_empty() || rng.below(2) == 0 {
            let pages = 1 + rng.below(8);
            let memory_type = rng.pick(&TYPES);
            if let Some(base) = map.find_free_pages(top, addr(0), pages, PAGE_SIZE, None) {
                map.convert_range(base, pages, Conversion::Type(memory_type))
                    .expect("allocate");
                live.push((base, pages, memory_type));
            }
        } else {
            let index = usize::try_from(rng.below(live.len() as u64)).expect("index");
            let (base, pages, _) = live.swap_remove(index);
            map.convert_range(base, pages, Conversion::Type(MemoryType::CONVENTIONAL))
                .expect("free");
        }
        map.drain(top, top).expect("drain");
        check_map(&map, bin, step);

        for memory_type in TYPES {
            let mut expected: u64 = live
                .iter()
                .filter(|(_, _, t)| *t == memory_type)
                .map(|(_, pages, _)| pages)
                .sum();
            if memory_type == MemoryType::BOOT_SERVICES_DATA {
                expected += map.descriptor_pages().len() as u64;
            }
            assert_eq!(map.pages_of(memory_type), expected, "step {step}: {memory_type:?}");
        }
    }

    for (base, pages, _) in live.drain(..) {
        assert!(map.is_allocated(base, pages));
        map.convert_range(base, pages, Conversion::Type(MemoryType::CONVENTIONAL))
            .expect("free");
    }
    map.drain(top, top).expect("drain");
    check_map(&map, bin, STEPS);
    let allocated: u64 = map.iter().filter(|e| !e.is_free()).map(MemoryMapEntry::pages).sum();
    assert_eq!(allocated, map.descriptor_pages().len() as u64);
}

#[test]
fn services_stay_consistent_under_mixed_traffic() {
    let config = MemoryConfig::default().with_guard(
        GuardPolicy::default()
            .with_page_type_mask(GuardPolicy::type_bit(MemoryType::BOOT_SERVICES_DATA))
            .with_pool_type_mask(GuardPolicy::type_bit(MemoryType::LOADER_DATA))
            .with_property(HeapGuardProperty::new().with_page_guard(true).with_pool_guard(true)),
    );
    let services = MemoryServices::new(TestRam::new(), config).expect("config");
    services
        .add_memory_descriptor(MemoryType::CONVENTIONAL, addr(BASE), PAGES, MemoryAttribute::WRITE_BACK)
        .expect("add");

    let mut rng = Lcg(42);
    let mut pages_live: Vec<(PhysicalAddress, u64, MemoryType)> = Vec::new();
    let mut pools_live: Vec<PhysicalAddress> = Vec::new();
    for step in 0..STEPS {
        match rng.below(4) {
            0 => {
                let memory_type = rng.pick(&TYPES);
                let pages = 1 + rng.below(4);
                if let Ok(base) = services.allocate_pages(AllocateType::AnyPages, memory_type, pages) {
                    if memory_type == MemoryType::BOOT_SERVICES_DATA {
                        assert!(services.is_guarded(base), "step {step}");
                    }
                    pages_live.push((base, pages, memory_type));
                }
            }
            1 => {
                let memory_type = rng.pick(&[MemoryType::LOADER_DATA, MemoryType::BOOT_SERVICES_CODE]);
                if let Ok(buffer) = services.allocate_pool(memory_type, 1 + rng.below(6000)) {
                    assert!(buffer.is_aligned(8), "step {step}");
                    pools_live.push(buffer);
                }
            }
            2 if !pages_live.is_empty() => {
                let index = usize::try_from(rng.below(pages_live.len() as u64)).expect("index");
                let (base, pages, _) = pages_live.swap_remove(index);
                services.free_pages(base, pages).expect("free pages");
            }
            _ if !pools_live.is_empty() => {
                let index = usize::try_from(rng.below(pools_live.len() as u64)).expect("index");
                services.free_pool(pools_live.swap_remove(index)).expect("free pool");
            }
            _ => {}
        }

        let (descriptors, _) = services.memory_map_descriptors();
        for pair in descriptors.windows(2) {
            let end = pair[0].phys_start + (pair[0].page_count << PAGE_SHIFT);
            assert!(end <= pair[1].phys_start, "step {step}: overlap");
        }
        let total: u64 = descriptors.iter().map(|d| d.page_count).sum();
        assert_eq!(total, PAGES, "step {step}: tracked pages");
    }

    for (base, pages, _) in pages_live {
        services.free_pages(base, pages).expect("free pages");
    }
    for buffer in pools_live {
        services.free_pool(buffer).expect("free pool");
    }
    assert_eq!(services.pool_usage(MemoryType::LOADER_DATA), 0);
    assert_eq!(services.pool_usage(MemoryType::BOOT_SERVICES_CODE), 0);
    let (descriptors, _) = services.memory_map_descriptors();
    assert!(descriptors.iter().all(|d| {
        d.ty == MemoryType::CONVENTIONAL || d.ty == MemoryType::BOOT_SERVICES_DATA
    }));
}
