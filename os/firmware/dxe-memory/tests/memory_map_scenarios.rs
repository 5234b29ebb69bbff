use dxe_memory::config::MemoryTypeInformation;
use dxe_memory::memory_map::snapshot;
use dxe_memory::memory_map::{BinRange, MemoryMap};
use dxe_memory::phys_memory::TestRam;
use dxe_memory::{AllocateType, MemoryConfig, MemoryError, MemoryMapError, MemoryServices};
use fw_memory_addresses::{PAGE_SHIFT, PAGE_SIZE, PhysicalAddress};
use uefi::mem::memory_map::{MemoryAttribute, MemoryDescriptor, MemoryType};

const P: u64 = PAGE_SIZE;
const B: u64 = 0x4000_0000;
const BIN: u64 = 0x1_0000;

fn addr(a: u64) -> PhysicalAddress {
    PhysicalAddress::new(a)
}

fn span(desc: &MemoryDescriptor) -> (u64, u64) {
    (desc.phys_start, desc.page_count)
}

fn assert_well_formed(map: &MemoryMap) {
    let entries: Vec<_> = map.iter().copied().collect();
    for pair in entries.windows(2) {
        assert!(pair[0].end < pair[1].start, "overlap: {pair:?}");
        assert!(!pair[0].can_merge(&pair[1]), "unmerged neighbors: {pair:?}");
    }
    for entry in &entries {
        assert!(entry.bin.is_none() || entry.is_free(), "tagged allocation: {entry:?}");
    }
}

#[test]
fn single_add_yields_one_descriptor() {
    let mut map = MemoryMap::new();
    let attribute = MemoryAttribute::UNCACHEABLE | MemoryAttribute::WRITE_PROTECT;
    map.add_range(MemoryType::BOOT_SERVICES_DATA, addr(B - P), addr(B - 1), attribute)
        .expect("add");

    let descriptors = snapshot::descriptors(&map, &[]);
    assert_eq!(descriptors.len(), 1);
    assert_eq!(span(&descriptors[0]), (B - P, 1));
    assert_eq!(descriptors[0].att, attribute);
    assert_well_formed(&map);
}

#[test]
fn different_types_do_not_merge_across_the_boundary() {
    let mut map = MemoryMap::new();
    map.add_range(MemoryType::LOADER_DATA, addr(B), addr(B + P - 1), MemoryAttribute::WRITE_BACK)
        .expect("add");
    let added = map
        .add_range(
            MemoryType::BOOT_SERVICES_DATA,
            addr(B - P),
            addr(B + P - 1),
            MemoryAttribute::UNCACHEABLE | MemoryAttribute::WRITE_PROTECT,
        )
        .expect("add");
    assert_eq!(added, 1);

    let descriptors = snapshot::descriptors(&map, &[]);
    assert_eq!(descriptors.len(), 2);
    assert_eq!(span(&descriptors[0]), (B - P, 1));
    assert_eq!(descriptors[0].ty, MemoryType::BOOT_SERVICES_DATA);
    assert_eq!(span(&descriptors[1]), (B, 1));
    assert_eq!(descriptors[1].ty, MemoryType::LOADER_DATA);
    assert_well_formed(&map);
}

#[test]
fn same_kind_merges_into_one_descriptor() {
    let mut map = MemoryMap::new();
    let x = MemoryType::ACPI_RECLAIM;
    map.add_range(x, addr(B), addr(B + P - 1), MemoryAttribute::WRITE_BACK)
        .expect("add");
    let added = map
        .add_range(x, addr(B - P), addr(B + 2 * P - 1), MemoryAttribute::WRITE_BACK)
        .expect("add");
    assert_eq!(added, 2);
    assert_eq!(map.len(), 1);

    let descriptors = snapshot::descriptors(&map, &[]);
    assert_eq!(descriptors.len(), 1);
    assert_eq!(span(&descriptors[0]), (B - P, 3));
    assert_well_formed(&map);
}

const SPECIAL: [MemoryType; 5] = [
    MemoryType::RUNTIME_SERVICES_CODE,
    MemoryType::RUNTIME_SERVICES_DATA,
    MemoryType::ACPI_RECLAIM,
    MemoryType::ACPI_NON_VOLATILE,
    MemoryType::RESERVED,
];

#[test]
fn add_across_five_bins_exhausts_the_scratch_stack() {
    let mut map = MemoryMap::new();
    for (i, memory_type) in (0u64..).zip(SPECIAL) {
        map.register_bin(BinRange {
            memory_type,
            start: addr(B + i * BIN),
            end: addr(B + (i + 1) * BIN - 1),
        })
        .expect("bin");
    }
    let key = map.map_key();

    // Seven entries: a free page on each side plus one per bin.
    let result = map.add_range(
        MemoryType::CONVENTIONAL,
        addr(B - P),
        addr(B + 5 * BIN + P - 1),
        MemoryAttribute::WRITE_BACK,
    );
    assert_eq!(result, Err(MemoryMapError::ScratchExhausted { depth: 7 }));
    assert!(map.is_empty());
    assert_eq!(map.map_key(), key);
    assert_eq!(map.scratch().depth(), 0);
}

fn bin_config() -> MemoryConfig {
    MemoryConfig::default()
        .with_runtime_granularity(BIN)
        .with_memory_type_information(
            SPECIAL
                .iter()
                .map(|&memory_type| MemoryTypeInformation {
                    memory_type,
                    pages: 16,
                })
                .collect(),
        )
}

#[test]
fn services_fail_fast_on_scratch_exhaustion() {
    let services = MemoryServices::new(TestRam::new(), bin_config()).expect("config");
    services
        .set_memory_type_information_range(addr(B), 5 * BIN)
        .expect("bins fit exactly");
    let key = services.map_key();

    let result = services.add_memory_descriptor(
        MemoryType::CONVENTIONAL,
        addr(B - P),
        (5 * BIN + 2 * P) >> PAGE_SHIFT,
        MemoryAttribute::WRITE_BACK,
    );
    assert_eq!(result, Err(MemoryError::OutOfResources));
    assert_eq!(services.map_key(), key);
    assert!(services.memory_map_descriptors().0.is_empty());
}

#[test]
fn bins_are_recorded_all_or_nothing() {
    // No memory below the ceiling, so staged entries are never drained.
    let config = MemoryConfig::default()
        .with_max_address(addr(B - 1))
        .with_memory_type_information(
            [
                MemoryType::RESERVED,
                MemoryType::ACPI_NON_VOLATILE,
                MemoryType::ACPI_RECLAIM,
            ]
            .into_iter()
            .map(|memory_type| MemoryTypeInformation {
                memory_type,
                pages: 16,
            })
            .collect(),
        );
    let services = MemoryServices::new(TestRam::new(), config).expect("config");
    let add = |ty: MemoryType, start: u64, pages: u64| {
        services
            .add_memory_descriptor(ty, addr(start), pages, MemoryAttribute::WRITE_BACK)
            .expect("add");
    };
    // Free memory straddling the upper two bin boundaries.
    add(MemoryType::CONVENTIONAL, B + 8 * P, 12);
    add(MemoryType::CONVENTIONAL, B + 24 * P, 16);
    for i in 0..3 {
        add(MemoryType::LOADER_DATA, B + 0x10_0000 + 2 * i * P, 1);
    }
    let (before, _) = services.memory_map_descriptors();

    // The top bin fits the scratch stack, the middle one does not.
    assert_eq!(
        services.set_memory_type_information_range(addr(B), 48 * P),
        Err(MemoryError::OutOfResources)
    );
    let (after, _) = services.memory_map_descriptors();
    let kinds = |map: &[MemoryDescriptor]| -> Vec<_> {
        map.iter()
            .map(|d| (d.ty, d.phys_start, d.page_count))
            .collect()
    };
    assert_eq!(kinds(&after), kinds(&before));
    assert!(
        services
            .memory_type_statistics()
            .iter()
            .all(|s| s.reserved_pages == 0)
    );
}

#[test]
fn bins_are_reported_with_their_types() {
    let services = MemoryServices::new(TestRam::new(), bin_config()).expect("config");
    services
        .set_memory_type_information_range(addr(B), 5 * BIN)
        .expect("bins");
    services
        .add_memory_descriptor(
            MemoryType::CONVENTIONAL,
            addr(B - 16 * P),
            16,
            MemoryAttribute::WRITE_BACK,
        )
        .expect("low memory");
    services
        .add_memory_descriptor(
            MemoryType::CONVENTIONAL,
            addr(B),
            (5 * BIN) >> PAGE_SHIFT,
            MemoryAttribute::WRITE_BACK,
        )
        .expect("bin memory");

    let (descriptors, _) = services.memory_map_descriptors();
    assert_eq!(descriptors.len(), 7);
    // The descriptor page sits at the top of the default region.
    assert_eq!(descriptors[0].ty, MemoryType::CONVENTIONAL);
    assert_eq!(span(&descriptors[0]), (B - 16 * P, 15));
    assert_eq!(descriptors[1].ty, MemoryType::BOOT_SERVICES_DATA);
    assert_eq!(span(&descriptors[1]), (B - P, 1));

    // The first configured bin is placed highest.
    let bins: Vec<_> = descriptors[2..].iter().map(|d| (d.ty, d.phys_start)).collect();
    assert_eq!(
        bins,
        [
            (MemoryType::RESERVED, B),
            (MemoryType::ACPI_NON_VOLATILE, B + BIN),
            (MemoryType::ACPI_RECLAIM, B + 2 * BIN),
            (MemoryType::RUNTIME_SERVICES_DATA, B + 3 * BIN),
            (MemoryType::RUNTIME_SERVICES_CODE, B + 4 * BIN),
        ]
    );
    assert!(descriptors[5].att.contains(MemoryAttribute::RUNTIME));
    assert!(!descriptors[2].att.contains(MemoryAttribute::RUNTIME));
}

#[test]
fn bin_allocation_snapshot_has_three_categories() {
    let config = MemoryConfig::default().with_memory_type_information(vec![
        MemoryTypeInformation {
            memory_type: MemoryType::RUNTIME_SERVICES_DATA,
            pages: 16,
        },
    ]);
    let services = MemoryServices::new(TestRam::new(), config).expect("config");
    services
        .add_memory_descriptor(
            MemoryType::CONVENTIONAL,
            addr(0x10_0000),
            256,
            MemoryAttribute::WRITE_BACK,
        )
        .expect("add");

    let page = services
        .allocate_pages(AllocateType::AnyPages, MemoryType::RUNTIME_SERVICES_DATA, 1)
        .expect("bin page");
    assert_eq!(page, addr(0x1F_F000));
    let buffer = services
        .allocate_pages(AllocateType::AnyPages, MemoryType::BOOT_SERVICES_DATA, 1)
        .expect("buffer");

    let (descriptors, key) = services.memory_map_descriptors();
    assert_eq!(key, services.map_key());
    assert_eq!(descriptors.len(), 3, "{descriptors:#?}");

    let [free, data, bin] = [&descriptors[0], &descriptors[1], &descriptors[2]];
    assert_eq!(free.ty, MemoryType::CONVENTIONAL);
    assert_eq!(free.phys_start, 0x10_0000);

    assert_eq!(data.ty, MemoryType::BOOT_SERVICES_DATA);
    assert!(data.phys_start <= buffer.as_u64());
    assert!(buffer.as_u64() < data.phys_start + (data.page_count << PAGE_SHIFT));
    assert_eq!(free.phys_start + (free.page_count << PAGE_SHIFT), data.phys_start);

    assert_eq!(bin.ty, MemoryType::RUNTIME_SERVICES_DATA);
    assert_eq!(span(bin), (0x1F_0000, 16));
    assert!(bin.att.contains(MemoryAttribute::RUNTIME));

    let stats = services.memory_type_statistics();
    let runtime = stats
        .iter()
        .find(|s| s.memory_type == MemoryType::RUNTIME_SERVICES_DATA)
        .expect("runtime data statistics");
    assert_eq!(runtime.current_pages, 1);
    assert_eq!(runtime.reserved_pages, 16);
    assert_eq!(runtime.base, addr(0x1F_0000));
    assert!(runtime.is_runtime);
}

#[test]
fn snapshot_buffer_round_trip_and_size_check() {
    let services = MemoryServices::new(TestRam::new(), MemoryConfig::default()).expect("config");
    services
        .add_memory_descriptor(
            MemoryType::CONVENTIONAL,
            addr(0x10_0000),
            64,
            MemoryAttribute::WRITE_BACK,
        )
        .expect("add");
    let (expected, _) = services.memory_map_descriptors();
    let required = snapshot::required_size(expected.len());

    let mut small = vec![0u8; required - 1];
    assert_eq!(
        services.get_memory_map(&mut small),
        Err(MemoryError::BufferTooSmall { required })
    );

    let mut buffer = vec![0u8; required + 64];
    let info = services.get_memory_map(&mut buffer).expect("snapshot");
    assert_eq!(info.map_size, required);
    assert_eq!(info.entry_count(), expected.len());
    assert!(info.descriptor_size > size_of::<MemoryDescriptor>());
    assert_eq!(info.descriptor_version, MemoryDescriptor::VERSION);
    assert_eq!(info.map_key, services.map_key());

    let decoded = snapshot::decode(&buffer, info.map_size, info.descriptor_size);
    assert_eq!(decoded.len(), expected.len());
    for (a, b) in decoded.iter().zip(&expected) {
        assert_eq!((a.ty, a.phys_start, a.page_count, a.att), (b.ty, b.phys_start, b.page_count, b.att));
    }
}
