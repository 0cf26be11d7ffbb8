#![allow(dead_code)]

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use ttm_rs::{
    AddressSpaceMapping, BoDevice, BoDriver, BoParams, BoRef, BoType, BufferObject, DeviceConfig,
    MemGlobal, MemReg, MemTypeConfig, PlacementFlags, TtmError, TtmResult, mem_type,
};

pub const VRAM_PAGES: u64 = 16;
pub const TT_PAGES: u64 = 32;
pub const VRAM_GPU_BASE: u64 = 0x1000_0000;

/// Scripted driver: system, a non-fixed aperture (`TT`) and fixed `VRAM`.
pub struct TestDriver {
    pub types: HashMap<u32, MemTypeConfig>,
    pub prio: Vec<u32>,
    pub busy_prio: Vec<u32>,
    pub evict_to: PlacementFlags,
    pub invalidations: AtomicUsize,
}

impl Default for TestDriver {
    fn default() -> Self {
        let mut types = HashMap::new();
        types.insert(mem_type::SYSTEM, MemTypeConfig::system());
        types.insert(mem_type::TT, MemTypeConfig::default());
        types.insert(mem_type::VRAM, MemTypeConfig::fixed(VRAM_GPU_BASE).io(0xE000_0000));
        Self {
            types,
            prio: vec![mem_type::VRAM, mem_type::TT, mem_type::SYSTEM],
            busy_prio: vec![mem_type::VRAM, mem_type::TT],
            evict_to: PlacementFlags::SYSTEM | PlacementFlags::CACHED,
            invalidations: AtomicUsize::new(0),
        }
    }
}

impl BoDriver for TestDriver {
    fn init_mem_type(&self, mem_type: u32) -> TtmResult<MemTypeConfig> {
        self.types.get(&mem_type).cloned().ok_or(TtmError::InvalidMemType(mem_type))
    }

    fn mem_type_prio(&self) -> &[u32] {
        &self.prio
    }

    fn mem_busy_prio(&self) -> &[u32] {
        &self.busy_prio
    }

    fn evict_flags(&self, _bo: &BufferObject, _mem: &MemReg) -> PlacementFlags {
        self.evict_to
    }

    fn invalidate_caches(&self, _flags: PlacementFlags) -> TtmResult<()> {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Records every unmap request.
#[derive(Default)]
pub struct RecordingMapping {
    pub unmapped: Mutex<Vec<(u64, u64)>>,
}

impl AddressSpaceMapping for RecordingMapping {
    fn unmap_range(&self, offset: u64, len: u64) {
        self.unmapped.lock().push((offset, len));
    }
}

pub struct Setup {
    pub dev: Arc<BoDevice>,
    pub driver: Arc<TestDriver>,
    pub glob: Arc<MemGlobal>,
    pub mapping: Arc<RecordingMapping>,
}

pub fn test_config() -> DeviceConfig {
    DeviceConfig::default()
        .spawn_workers(false)
        .nice_mode_timeout(Duration::from_millis(50))
}

pub fn setup_with(driver: TestDriver, glob: MemGlobal, config: DeviceConfig) -> Setup {
    setup_sized(driver, glob, config, TT_PAGES, VRAM_PAGES)
}

pub fn setup_sized(
    driver: TestDriver,
    glob: MemGlobal,
    config: DeviceConfig,
    tt_pages: u64,
    vram_pages: u64,
) -> Setup {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let driver = Arc::new(driver);
    let glob = Arc::new(glob);
    let dev = BoDevice::new(driver.clone(), glob.clone(), config).expect("device");
    dev.init_mm(mem_type::TT, 0, tt_pages).expect("tt");
    dev.init_mm(mem_type::VRAM, 0, vram_pages).expect("vram");

    let mapping = Arc::new(RecordingMapping::default());
    dev.set_dev_mapping(mapping.clone());

    Setup {
        dev,
        driver,
        glob,
        mapping,
    }
}

pub fn setup() -> Setup {
    setup_with(TestDriver::default(), MemGlobal::unlimited(), test_config())
}

pub fn pages(n: u64) -> u64 {
    n << 12
}

pub fn create(dev: &Arc<BoDevice>, num_pages: u64, flags: PlacementFlags) -> BoRef {
    dev.create(BoParams::new(pages(num_pages), BoType::Kernel).flags(flags))
        .expect("create")
}

pub fn assert_clean(dev: &BoDevice) {
    let violations = dev.check_invariants();
    assert!(violations.is_empty(), "invariant violations: {violations:#?}");
}
