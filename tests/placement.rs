mod common;

use common::{
    TestDriver, VRAM_GPU_BASE, VRAM_PAGES, assert_clean, create, pages, setup, setup_sized,
    setup_with, test_config,
};
use std::sync::atomic::Ordering;
use std::thread;
use ttm_rs::{BoParams, BoType, Fence, MemGlobal, MemTypeConfig, PlacementFlags, TtmError, mem_type};

const VRAM_WC: PlacementFlags = PlacementFlags::VRAM.union(PlacementFlags::WC);

#[test]
fn new_buffers_start_in_system_memory() {
    let s = setup();
    let bo = create(&s.dev, 4, PlacementFlags::SYSTEM);

    assert_eq!(bo.mem_type(), mem_type::SYSTEM);
    assert!(bo.placement_flags().contains(PlacementFlags::SYSTEM | PlacementFlags::CACHED));
    assert!(bo.has_backing_pages());
    assert!(bo.extent().is_none());
    assert_eq!(bo.offset(), 0);
    assert_eq!(s.dev.object_count(), 1);
    assert_eq!(s.dev.swap_lru_len(), 1);
    assert_clean(&s.dev);
}

#[test]
fn zero_sized_buffer_is_rejected() {
    let s = setup();
    let err = s.dev.create(BoParams::new(0, BoType::Kernel)).unwrap_err();
    assert!(matches!(err, TtmError::InvalidArgument(_)));
    assert_eq!(s.dev.object_count(), 0);
    assert_eq!(s.glob.used(), 0);
}

#[test]
fn overflowing_sizes_are_rejected() {
    let s = setup();
    let err = s.dev.create(BoParams::new(u64::MAX, BoType::Kernel)).unwrap_err();
    assert!(matches!(err, TtmError::InvalidArgument(_)));

    // The in-page start offset pushes an otherwise valid size past the end.
    let err = s
        .dev
        .create(BoParams::new(u64::MAX - 4095, BoType::Kernel).buffer_start(0x800))
        .unwrap_err();
    assert!(matches!(err, TtmError::InvalidArgument(_)));

    let err = s
        .dev
        .create(BoParams::new(pages(1), BoType::Kernel).page_alignment(u64::MAX))
        .unwrap_err();
    assert!(matches!(err, TtmError::InvalidArgument(_)));

    assert_eq!(s.dev.object_count(), 0);
    assert_eq!(s.glob.used(), 0);
    assert_clean(&s.dev);
}

#[test]
fn huge_buffer_fails_accounting() {
    let s = setup_with(TestDriver::default(), MemGlobal::new(1 << 20, usize::MAX), test_config());
    let err = s
        .dev
        .create(BoParams::new(u64::MAX - 4095, BoType::Kernel))
        .unwrap_err();
    assert!(matches!(err, TtmError::OutOfMemory));
    assert_eq!(s.dev.object_count(), 0);
    assert_eq!(s.glob.used(), 0);
}

#[test]
fn unreachable_alignment_evicts_down_to_the_start() {
    let s = setup();
    let a = create(&s.dev, 4, PlacementFlags::VRAM);
    assert_eq!(a.extent().unwrap().start, 0);

    // Only page 0 satisfies the alignment, so `a` has to make room.
    let b = s
        .dev
        .create(
            BoParams::new(pages(1), BoType::Kernel)
                .flags(PlacementFlags::VRAM)
                .page_alignment(1 << 40),
        )
        .unwrap();
    assert_eq!(b.mem_type(), mem_type::VRAM);
    assert_eq!(b.extent().unwrap().start, 0);
    assert_eq!(a.mem_type(), mem_type::SYSTEM);
    assert_clean(&s.dev);
}

#[test]
fn validate_moves_into_fixed_memory() {
    let s = setup();
    let bo = create(&s.dev, 4, PlacementFlags::SYSTEM);
    let r = bo.reserve(false, false, None).unwrap();

    r.validate(VRAM_WC, false, false).unwrap();
    assert_eq!(bo.mem_type(), mem_type::VRAM);
    assert!(bo.placement_flags().contains(VRAM_WC));
    assert!(!bo.has_backing_pages());
    let extent = bo.extent().expect("vram range");
    assert_eq!(extent.num_pages, 4);
    assert_eq!(bo.offset(), VRAM_GPU_BASE + pages(extent.start));

    // Already satisfied: nothing moves.
    r.validate(VRAM_WC, false, false).unwrap();
    assert_eq!(bo.extent(), Some(extent));
    drop(r);

    let stats = s.dev.mem_type_stats(mem_type::VRAM).unwrap();
    assert_eq!(stats.used_pages, 4);
    assert_eq!(stats.lru_len, 1);
    assert_eq!(s.dev.swap_lru_len(), 0);
    assert_clean(&s.dev);
}

#[test]
fn validate_into_aperture_keeps_pages() {
    let s = setup();
    let bo = create(&s.dev, 4, PlacementFlags::SYSTEM);
    let r = bo.reserve(false, false, None).unwrap();
    r.write(0, b"aperture").unwrap();

    r.validate(PlacementFlags::TT | PlacementFlags::CACHED, false, false).unwrap();
    assert_eq!(bo.mem_type(), mem_type::TT);
    assert!(bo.has_backing_pages());
    assert_eq!(bo.offset(), pages(bo.extent().unwrap().start));

    let mut buf = [0u8; 8];
    r.read(0, &mut buf).unwrap();
    assert_eq!(&buf, b"aperture");
    drop(r);
    assert_clean(&s.dev);
}

#[test]
fn eviction_preserves_contents() {
    let s = setup();
    let a = create(&s.dev, VRAM_PAGES, PlacementFlags::VRAM);
    {
        let r = a.reserve(false, false, None).unwrap();
        r.write(100, b"payload").unwrap();
    }

    // VRAM is full: making room for `b` pushes `a` out to system memory.
    let b = create(&s.dev, 4, PlacementFlags::VRAM);
    assert_eq!(b.mem_type(), mem_type::VRAM);
    assert_eq!(a.mem_type(), mem_type::SYSTEM);
    assert!(a.is_evicted());
    assert!(a.has_backing_pages());
    assert!(s.mapping.unmapped.lock().is_empty());

    let mut buf = [0u8; 7];
    a.reserve(false, false, None).unwrap().read(100, &mut buf).unwrap();
    assert_eq!(&buf, b"payload");
    assert_clean(&s.dev);

    drop(b);
    let r = a.reserve(false, false, None).unwrap();
    r.validate(VRAM_WC, false, false).unwrap();
    assert_eq!(s.driver.invalidations.load(Ordering::SeqCst), 1);
    assert!(!a.is_evicted());

    let mut buf = [0u8; 7];
    r.read(100, &mut buf).unwrap();
    assert_eq!(&buf, b"payload");
    drop(r);
    assert_clean(&s.dev);
}

#[test]
fn eviction_falls_back_to_system_memory() {
    let mut driver = TestDriver::default();
    // The driver's preferred eviction target cannot hold anything.
    driver.evict_to = PlacementFlags::PRIV0;
    let s = setup_with(driver, MemGlobal::unlimited(), test_config());

    let a = create(&s.dev, VRAM_PAGES, PlacementFlags::VRAM);
    let _b = create(&s.dev, 1, PlacementFlags::VRAM);
    assert_eq!(a.mem_type(), mem_type::SYSTEM);
    assert!(a.placement_flags().contains(PlacementFlags::CACHED));
    assert_clean(&s.dev);
}

#[test]
fn pinned_buffers_are_never_evicted() {
    let s = setup();
    let pinned = s
        .dev
        .create(
            BoParams::new(pages(VRAM_PAGES), BoType::Kernel)
                .flags(PlacementFlags::VRAM | PlacementFlags::NO_EVICT)
                .privileged(),
        )
        .unwrap();
    assert_eq!(s.dev.mem_type_stats(mem_type::VRAM).unwrap().lru_len, 0);

    let err = s
        .dev
        .create(BoParams::new(pages(4), BoType::Kernel).flags(PlacementFlags::VRAM))
        .unwrap_err();
    assert!(matches!(err, TtmError::OutOfMemory));
    assert_eq!(pinned.mem_type(), mem_type::VRAM);
    assert_eq!(s.dev.object_count(), 1);
    assert_clean(&s.dev);
}

#[test]
fn eviction_frees_every_victim_it_needs() {
    let s = setup();
    let victims: Vec<_> = (0..4).map(|_| create(&s.dev, 4, PlacementFlags::VRAM)).collect();
    assert_eq!(s.dev.mem_type_stats(mem_type::VRAM).unwrap().lru_len, 4);

    let big = create(&s.dev, VRAM_PAGES, PlacementFlags::VRAM);
    assert_eq!(big.mem_type(), mem_type::VRAM);
    assert_eq!(big.extent().unwrap().start, 0);
    for bo in &victims {
        assert_eq!(bo.mem_type(), mem_type::SYSTEM);
        assert!(bo.is_evicted());
    }

    let stats = s.dev.mem_type_stats(mem_type::VRAM).unwrap();
    assert_eq!(stats.used_pages, VRAM_PAGES);
    assert_eq!(stats.lru_len, 1);
    assert_clean(&s.dev);
}

#[test]
fn reserved_occupants_mean_out_of_memory() {
    let s = setup();
    let occupants: Vec<_> = (0..4).map(|_| create(&s.dev, 4, PlacementFlags::VRAM)).collect();
    let held: Vec<_> = occupants
        .iter()
        .map(|bo| bo.reserve(false, false, None).unwrap())
        .collect();

    let err = s
        .dev
        .create(BoParams::new(pages(4), BoType::Kernel).flags(PlacementFlags::VRAM))
        .unwrap_err();
    assert!(matches!(err, TtmError::OutOfMemory));
    for bo in &occupants {
        assert_eq!(bo.mem_type(), mem_type::VRAM);
    }

    drop(held);
    assert_eq!(s.dev.object_count(), 4);
    assert_clean(&s.dev);
}

#[test]
fn preferred_type_wins_over_second_choice_after_one_eviction() {
    let mut driver = TestDriver::default();
    driver.prio = vec![mem_type::VRAM, mem_type::TT, mem_type::SYSTEM];
    driver.busy_prio = vec![mem_type::VRAM, mem_type::TT];
    let s = setup_sized(driver, MemGlobal::unlimited(), test_config(), 4, 4);

    // Both types are full; only the VRAM occupant can be evicted.
    let pinned = s
        .dev
        .create(
            BoParams::new(pages(4), BoType::Kernel)
                .flags(PlacementFlags::TT | PlacementFlags::NO_EVICT)
                .privileged(),
        )
        .unwrap();
    let occupant = create(&s.dev, 4, PlacementFlags::VRAM);
    assert_eq!(pinned.mem_type(), mem_type::TT);
    assert_eq!(occupant.mem_type(), mem_type::VRAM);

    let bo = create(&s.dev, 4, PlacementFlags::VRAM | PlacementFlags::TT);
    assert_eq!(bo.mem_type(), mem_type::VRAM);
    assert_eq!(occupant.mem_type(), mem_type::SYSTEM);
    assert!(occupant.is_evicted());
    assert_eq!(pinned.mem_type(), mem_type::TT);
    assert_clean(&s.dev);
}

#[test]
fn no_evict_requires_privilege() {
    let s = setup();
    let err = s
        .dev
        .create(
            BoParams::new(pages(1), BoType::Kernel)
                .flags(PlacementFlags::VRAM | PlacementFlags::NO_EVICT),
        )
        .unwrap_err();
    assert!(matches!(err, TtmError::InvalidArgument(_)));
    assert_eq!(s.dev.object_count(), 0);
}

#[test]
fn placement_changes_are_checked() {
    let s = setup();
    let user = s
        .dev
        .create(BoParams::new(pages(1), BoType::User).flags(PlacementFlags::TT))
        .unwrap();
    assert!(user.check_placement(PlacementFlags::TT, PlacementFlags::CACHED, true).is_err());
    assert!(
        user.check_placement(
            PlacementFlags::TT | PlacementFlags::CACHED,
            PlacementFlags::empty(),
            false
        )
        .is_ok()
    );

    let pinned = s
        .dev
        .create(
            BoParams::new(pages(1), BoType::Kernel)
                .flags(PlacementFlags::VRAM | PlacementFlags::NO_EVICT)
                .privileged(),
        )
        .unwrap();
    assert!(
        pinned
            .check_placement(PlacementFlags::empty(), PlacementFlags::NO_EVICT, false)
            .is_err()
    );
    assert!(pinned.check_placement(PlacementFlags::TT, PlacementFlags::VRAM, false).is_err());
    assert!(pinned.check_placement(PlacementFlags::TT, PlacementFlags::VRAM, true).is_ok());
}

#[test]
fn user_buffers_stay_out_of_fixed_memory() {
    let s = setup();
    let err = s
        .dev
        .create(BoParams::new(pages(1), BoType::User).flags(PlacementFlags::VRAM))
        .unwrap_err();
    assert!(matches!(err, TtmError::InvalidArgument(_)));

    let bo = s
        .dev
        .create(
            BoParams::new(pages(1), BoType::User).flags(PlacementFlags::VRAM | PlacementFlags::TT),
        )
        .unwrap();
    assert_eq!(bo.mem_type(), mem_type::TT);
    assert!(bo.placement_flags().contains(PlacementFlags::CACHED));
}

#[test]
fn busy_victim_turns_into_retry_without_waiting() {
    let s = setup();
    let a = create(&s.dev, VRAM_PAGES, PlacementFlags::VRAM);
    let fence = Fence::new();
    a.reserve(false, false, None).unwrap().set_sync_obj(fence.clone());
    assert!(a.busy());
    assert!(fence.flush_count() >= 1);
    assert!(matches!(a.wait(false, false, true), Err(TtmError::Busy)));

    let c = create(&s.dev, 4, PlacementFlags::SYSTEM);
    let r = c.reserve(false, false, None).unwrap();
    assert!(matches!(r.validate(VRAM_WC, false, true), Err(TtmError::Retry)));
    assert_eq!(c.mem_type(), mem_type::SYSTEM);
    assert_eq!(a.mem_type(), mem_type::VRAM);

    fence.signal();
    r.validate(VRAM_WC, false, true).unwrap();
    assert_eq!(c.mem_type(), mem_type::VRAM);
    assert_eq!(a.mem_type(), mem_type::SYSTEM);
    assert!(!a.has_sync_obj());
    drop(r);
    assert_clean(&s.dev);
}

#[test]
fn busy_buffer_refuses_no_wait_move() {
    let s = setup();
    let bo = create(&s.dev, 2, PlacementFlags::SYSTEM);
    let fence = Fence::new();
    let r = bo.reserve(false, false, None).unwrap();
    r.set_sync_obj(fence.clone());

    let tt = PlacementFlags::TT | PlacementFlags::CACHED;
    assert!(matches!(r.validate(tt, false, true), Err(TtmError::Busy)));
    assert_eq!(bo.mem_type(), mem_type::SYSTEM);

    fence.signal();
    r.validate(tt, false, true).unwrap();
    assert_eq!(bo.mem_type(), mem_type::TT);
}

#[test]
fn bus_placement_of_fixed_memory() {
    let s = setup();
    let vram = create(&s.dev, 4, PlacementFlags::VRAM);
    let reg = vram.mem_reg();
    assert!(s.dev.mem_reg_is_pci(&reg));

    let bus = s.dev.pci_offset(&reg).unwrap();
    assert_eq!(bus.base, 0xE000_0000);
    assert_eq!(bus.offset, pages(vram.extent().unwrap().start));
    assert_eq!(bus.size, pages(4));

    let sys = create(&s.dev, 4, PlacementFlags::SYSTEM);
    let reg = sys.mem_reg();
    assert!(!s.dev.mem_reg_is_pci(&reg));
    assert_eq!(s.dev.pci_offset(&reg).unwrap(), Default::default());
}

#[test]
fn memory_type_administration() {
    let mut driver = TestDriver::default();
    driver.types.insert(mem_type::PRIV0, MemTypeConfig::default());
    let s = setup_with(driver, MemGlobal::unlimited(), test_config());

    assert!(matches!(s.dev.init_mm(8, 0, 16), Err(TtmError::InvalidMemType(8))));
    assert!(matches!(s.dev.init_mm(mem_type::TT, 0, 16), Err(TtmError::InvalidArgument(_))));
    assert!(matches!(s.dev.init_mm(mem_type::PRIV0, 0, 0), Err(TtmError::InvalidArgument(_))));
    assert!(matches!(s.dev.init_mm(mem_type::PRIV1, 0, 16), Err(TtmError::InvalidMemType(_))));
    assert!(matches!(s.dev.evict_mm(mem_type::SYSTEM), Err(TtmError::InvalidMemType(_))));
    assert!(matches!(s.dev.clean_mm(mem_type::PRIV1), Err(TtmError::InvalidArgument(_))));

    s.dev.init_mm(mem_type::PRIV0, 0, 8).unwrap();
    let stats = s.dev.mem_type_stats(mem_type::PRIV0).unwrap();
    assert!(stats.enabled);
    assert_eq!(stats.size, 8);
}

#[test]
fn concurrent_churn_keeps_occupancy_consistent() {
    let s = setup();

    let handles: Vec<_> = (0..4u64)
        .map(|t| {
            let dev = s.dev.clone();
            thread::spawn(move || {
                for i in 0..60u64 {
                    let n = 1 + (t * 7 + i * 3) % 4;
                    let params =
                        BoParams::new(pages(n), BoType::Kernel).flags(PlacementFlags::VRAM);
                    let Ok(bo) = dev.create(params) else {
                        continue;
                    };
                    let target = if i % 2 == 0 {
                        PlacementFlags::TT | PlacementFlags::CACHED
                    } else {
                        VRAM_WC
                    };
                    if let Ok(r) = bo.reserve(false, false, None) {
                        match r.validate(target, false, false) {
                            Ok(()) | Err(TtmError::Retry | TtmError::OutOfMemory) => {}
                            Err(e) => panic!("unexpected error {e}"),
                        }
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(s.dev.object_count(), 0);
    assert_eq!(s.dev.mem_type_stats(mem_type::VRAM).unwrap().used_pages, 0);
    assert_eq!(s.dev.mem_type_stats(mem_type::TT).unwrap().used_pages, 0);
    assert_clean(&s.dev);
}
