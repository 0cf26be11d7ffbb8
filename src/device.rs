use crate::bo::{BoId, BufferObject};
use crate::driver::{AddressSpaceMapping, BoDriver, MemTypeFlags};
use crate::error::{TtmError, TtmResult};
use crate::memory::{
    Extent, LruList, MemAccounting, MemTypeManager, MemTypeStats, RangeAllocator, RangeManager,
};
use crate::placement::{MemReg, NUM_MEM_TYPES, PlacementFlags, mem_type};
use crate::sync::{Interrupt, InterruptToken};
use crate::utils::PAGE_SHIFT;
use crate::workqueue::DelayedWork;
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Device-wide tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConfig {
    /// First page of the mmap address space handed to device buffers.
    pub file_page_offset: u64,
    /// Size of that address space in pages.
    pub addr_space_pages: u64,
    /// How long the delayed-destroy worker waits before each pass.
    pub delayed_delete_period: Duration,
    /// How long teardown waits on a sync object before assuming a GPU lockup.
    pub nice_mode_timeout: Duration,
    /// How often the swap worker checks for memory pressure.
    pub swap_poll_period: Duration,
    /// Start the delayed-destroy and swap worker threads.
    pub spawn_workers: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            file_page_offset: 0x1_0000_0000 >> PAGE_SHIFT,
            addr_space_pages: 0x1000_0000,
            delayed_delete_period: Duration::from_millis(10),
            nice_mode_timeout: Duration::from_secs(3),
            swap_poll_period: Duration::from_millis(100),
            spawn_workers: true,
        }
    }
}

impl DeviceConfig {
    #[must_use]
    pub const fn addr_space(mut self, file_page_offset: u64, pages: u64) -> Self {
        self.file_page_offset = file_page_offset;
        self.addr_space_pages = pages;
        self
    }

    #[must_use]
    pub const fn delayed_delete_period(mut self, period: Duration) -> Self {
        self.delayed_delete_period = period;
        self
    }

    #[must_use]
    pub const fn nice_mode_timeout(mut self, timeout: Duration) -> Self {
        self.nice_mode_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn swap_poll_period(mut self, period: Duration) -> Self {
        self.swap_poll_period = period;
        self
    }

    #[must_use]
    pub const fn spawn_workers(mut self, spawn: bool) -> Self {
        self.spawn_workers = spawn;
        self
    }
}

/// Where an unreserved buffer goes on the LRU lists, read from its state
/// before the LRU lock is taken.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LruEntry {
    mem_type: u32,
    evictable: bool,
    has_ttm: bool,
}

impl BufferObject {
    pub(crate) fn lru_entry(&self) -> LruEntry {
        let st = self.state.lock();
        LruEntry {
            mem_type: st.mem.mem_type,
            evictable: !st.mem.flags.contains(PlacementFlags::NO_EVICT),
            has_ttm: st.ttm.is_some(),
        }
    }
}

/// Everything guarded by the LRU lock.
#[derive(Debug)]
pub(crate) struct LruState {
    pub(crate) man: [MemTypeManager; NUM_MEM_TYPES],
    pub(crate) swap_lru: LruList,
    pub(crate) ddestroy: LruList,
    /// Every live buffer object, by handle.
    pub(crate) objects: HashMap<BoId, Arc<BufferObject>>,
}

impl LruState {
    /// Links an unreserved buffer into the LRU of its type and the swap LRU.
    /// Each membership holds a list reference.
    pub(crate) fn add_to_lru(&mut self, bo: &BufferObject, entry: LruEntry) {
        debug_assert!(bo.is_reserved());
        if !entry.evictable {
            return;
        }
        // A destroyed buffer that already went through cleanup stays unlinked.
        if bo.strong_count() == 0 && !self.ddestroy.contains(bo.id()) {
            return;
        }
        if self.man[entry.mem_type as usize].lru.push_back(bo.id()) {
            bo.list_get();
        }
        if entry.has_ttm && self.swap_lru.push_back(bo.id()) {
            bo.list_get();
        }
    }

    /// Unlinks a buffer from its LRU and the swap LRU. Returns how many list
    /// references the caller now has to drop.
    pub(crate) fn del_from_lru(&mut self, id: BoId) -> usize {
        let mut put_count = usize::from(self.swap_lru.remove(id));
        for man in &mut self.man {
            if man.lru.remove(id) {
                put_count += 1;
            }
        }
        put_count
    }

    fn is_linked(&self, id: BoId) -> bool {
        self.swap_lru.contains(id)
            || self.ddestroy.contains(id)
            || self.man.iter().any(|man| man.lru.contains(id))
    }
}

/// Device address-space state, guarded by the vm lock.
#[derive(Debug, Default)]
pub(crate) struct VmState {
    mm: RangeManager,
    /// Start page of each allocated range.
    index: BTreeMap<u64, BoId>,
    nodes: HashMap<BoId, Extent>,
}

impl VmState {
    /// Drops the buffer's address-space range, if it has one.
    pub(crate) fn remove(&mut self, id: BoId) {
        if let Some(node) = self.nodes.remove(&id) {
            self.index.remove(&node.start);
            self.mm.free(node);
        }
    }
}

/// Bus window of a placement, for CPU mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BusPlacement {
    pub base: u64,
    pub offset: u64,
    pub size: u64,
}

/// The buffer manager of one GPU device.
///
/// Lock order: a buffer mutex may be taken before the LRU lock or the vm
/// lock, and the vm lock before the LRU lock. Never the reverse.
pub struct BoDevice {
    driver: Arc<dyn BoDriver>,
    mem_glob: Arc<dyn MemAccounting>,
    config: DeviceConfig,

    pub(crate) lru: Mutex<LruState>,
    vm: RwLock<VmState>,
    dev_mapping: RwLock<Option<Arc<dyn AddressSpaceMapping>>>,

    interrupt: Interrupt,
    /// Cleared after the first probable GPU lockup at teardown.
    pub(crate) nice_mode: AtomicBool,
    next_id: AtomicU64,

    pub(crate) ddestroy_work: DelayedWork,
    pub(crate) swap_work: DelayedWork,
}

impl BoDevice {
    /// Creates the device with system memory enabled.
    ///
    /// # Errors
    /// Fails if the driver cannot describe system memory.
    pub fn new(
        driver: Arc<dyn BoDriver>,
        mem_glob: Arc<dyn MemAccounting>,
        config: DeviceConfig,
    ) -> TtmResult<Arc<Self>> {
        let dev = Arc::new_cyclic(|weak: &Weak<Self>| {
            let (ddestroy_work, swap_work) = Self::start_workers(weak, &config);
            Self {
                driver,
                mem_glob,
                config,
                lru: Mutex::new(LruState {
                    man: std::array::from_fn(|_| MemTypeManager::default()),
                    swap_lru: LruList::new(),
                    ddestroy: LruList::new(),
                    objects: HashMap::new(),
                }),
                vm: RwLock::new(VmState {
                    mm: RangeManager::new(config.file_page_offset, config.addr_space_pages),
                    ..VmState::default()
                }),
                dev_mapping: RwLock::new(None),
                interrupt: Interrupt::new(),
                nice_mode: AtomicBool::new(true),
                next_id: AtomicU64::new(1),
                ddestroy_work,
                swap_work,
            }
        });

        dev.init_mm(mem_type::SYSTEM, 0, 0)?;
        if dev.config.spawn_workers {
            dev.swap_work.schedule(dev.config.swap_poll_period);
        }
        info!(
            addr_space_pages = config.addr_space_pages,
            workers = config.spawn_workers,
            "Buffer object device ready"
        );
        Ok(dev)
    }

    fn start_workers(weak: &Weak<Self>, config: &DeviceConfig) -> (DelayedWork, DelayedWork) {
        if !config.spawn_workers {
            return (DelayedWork::idle(), DelayedWork::idle());
        }

        let ddestroy = {
            let weak = weak.clone();
            DelayedWork::spawn("ttm-ddestroy", move || {
                if let Some(dev) = weak.upgrade() {
                    dev.delayed_workqueue();
                }
            })
        };
        let swap = {
            let weak = weak.clone();
            DelayedWork::spawn("ttm-swap", move || {
                if let Some(dev) = weak.upgrade() {
                    dev.swap_workqueue();
                }
            })
        };

        match (ddestroy, swap) {
            (Ok(ddestroy), Ok(swap)) => (ddestroy, swap),
            (ddestroy, swap) => {
                warn!("Could not start buffer object workers, running without them");
                drop((ddestroy, swap));
                (DelayedWork::idle(), DelayedWork::idle())
            }
        }
    }

    pub(crate) fn driver(&self) -> &dyn BoDriver {
        self.driver.as_ref()
    }

    pub(crate) const fn mem_glob(&self) -> &Arc<dyn MemAccounting> {
        &self.mem_glob
    }

    #[must_use]
    pub const fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub(crate) fn next_bo_id(&self) -> BoId {
        BoId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn insert_object(&self, bo: &Arc<BufferObject>) {
        self.lru.lock().objects.insert(bo.id(), bo.clone());
    }

    pub(crate) fn remove_object(&self, id: BoId) {
        let mut lru = self.lru.lock();
        debug_assert!(!lru.is_linked(id), "{id} freed while still linked");
        lru.objects.remove(&id);
    }

    pub(crate) fn interrupt_token(&self, interruptible: bool) -> Option<InterruptToken<'_>> {
        interruptible.then(|| self.interrupt.token())
    }

    /// Interrupts every interruptible wait in flight; they return `Retry`.
    pub fn raise_signal(&self) {
        self.interrupt.raise();
    }

    /// Installs the CPU mapping space that moves must invalidate.
    pub fn set_dev_mapping(&self, mapping: Arc<dyn AddressSpaceMapping>) {
        *self.dev_mapping.write() = Some(mapping);
    }

    pub(crate) fn dev_mapping(&self) -> Option<Arc<dyn AddressSpaceMapping>> {
        self.dev_mapping.read().clone()
    }

    #[must_use]
    pub fn nice_mode(&self) -> bool {
        self.nice_mode.load(Ordering::Acquire)
    }

    pub(crate) fn vm_write(&self) -> RwLockWriteGuard<'_, VmState> {
        self.vm.write()
    }

    /// Enables memory type `mem_type` with `size` pages starting at page
    /// `offset`.
    ///
    /// # Errors
    /// `InvalidMemType` out of range, `InvalidArgument` if already
    /// initialized or zero-sized, or the driver's error.
    pub fn init_mm(&self, mem_type: u32, offset: u64, size: u64) -> TtmResult<()> {
        let idx = mem_type as usize;
        if idx >= NUM_MEM_TYPES {
            error!(mem_type, "Illegal memory type");
            return Err(TtmError::InvalidMemType(mem_type));
        }
        if self.lru.lock().man[idx].has_type {
            error!(mem_type, "Memory manager already initialized");
            return Err(TtmError::InvalidArgument(format!(
                "memory type {mem_type} already initialized"
            )));
        }

        let config = self.driver.init_mem_type(mem_type)?;
        if mem_type != mem_type::SYSTEM && size == 0 {
            error!(mem_type, "Zero size memory manager type");
            return Err(TtmError::InvalidArgument(format!("memory type {mem_type} has no pages")));
        }

        let mut lru = self.lru.lock();
        let man = &mut lru.man[idx];
        if man.has_type {
            return Err(TtmError::InvalidArgument(format!(
                "memory type {mem_type} already initialized"
            )));
        }
        man.init(mem_type, config, offset, size);
        debug!(mem_type, offset, size, "Initialized memory type");
        Ok(())
    }

    /// Disables `mem_type`, evicts its buffers and takes its allocator down.
    ///
    /// # Errors
    /// `InvalidMemType`/`InvalidArgument` for a bad or uninitialized type,
    /// `Busy` if ranges are still allocated afterwards.
    pub fn clean_mm(&self, mem_type: u32) -> TtmResult<()> {
        let idx = mem_type as usize;
        if idx >= NUM_MEM_TYPES {
            error!(mem_type, "Illegal memory type");
            return Err(TtmError::InvalidMemType(mem_type));
        }
        {
            let mut lru = self.lru.lock();
            let man = &mut lru.man[idx];
            if !man.has_type {
                error!(mem_type, "Trying to take down uninitialized memory manager type");
                return Err(TtmError::InvalidArgument(format!(
                    "memory type {mem_type} not initialized"
                )));
            }
            man.use_type = false;
            man.has_type = false;
        }

        if mem_type == mem_type::SYSTEM {
            return Ok(());
        }

        // Failed evictions are logged and skipped; the allocator check below
        // reports what is left behind.
        if let Err(e) = self.force_list_clean(mem_type, false) {
            warn!(mem_type, error = %e, "Memory type cleanup stopped early");
        }

        let mut lru = self.lru.lock();
        let man = &mut lru.man[idx];
        if man.manager.is_clean() {
            man.takedown();
            debug!(mem_type, "Took down memory type");
            Ok(())
        } else {
            error!(mem_type, used = man.manager.used_pages(), "Memory type is not clean");
            Err(TtmError::Busy)
        }
    }

    /// Evicts every buffer out of `mem_type`, leaving the type enabled.
    ///
    /// # Errors
    /// `InvalidMemType` for system or out-of-range types; otherwise the first
    /// eviction error.
    pub fn evict_mm(&self, mem_type: u32) -> TtmResult<()> {
        let idx = mem_type as usize;
        if mem_type == mem_type::SYSTEM || idx >= NUM_MEM_TYPES {
            error!(mem_type, "Illegal memory manager memory type");
            return Err(TtmError::InvalidMemType(mem_type));
        }
        if !self.lru.lock().man[idx].has_type {
            error!(mem_type, "Memory manager type is not initialized");
            return Ok(());
        }
        self.force_list_clean(mem_type, true)
    }

    /// Evicts the LRU of `mem_type` until it is empty.
    fn force_list_clean(&self, mem_type: u32, allow_errors: bool) -> TtmResult<()> {
        let idx = mem_type as usize;
        let mut failed = std::collections::HashSet::new();

        loop {
            let mut lru = self.lru.lock();
            let Some(bo) = lru.man[idx]
                .lru
                .iter()
                .find(|id| !failed.contains(id))
                .and_then(|id| lru.objects.get(&id).cloned())
            else {
                return Ok(());
            };
            let entry = crate::bo::refs::ListRef::new(self, &bo);

            let reserved = bo.reserve_locked(&mut lru, None, false, None);
            if reserved.is_err() {
                drop(lru);
                continue;
            }
            let put_count = lru.del_from_lru(bo.id());
            drop(lru);
            bo.list_put_nonfinal(put_count);

            let ret = self.leave_list(&bo, mem_type, allow_errors);
            self.unreserve_bo(&bo);
            drop(entry);

            if let Err(e) = ret {
                if allow_errors {
                    return Err(e);
                }
                error!(bo = %bo.id(), mem_type, error = %e, "Cleanup eviction failed");
                failed.insert(bo.id());
            }
        }
    }

    fn leave_list(&self, bo: &BufferObject, mem_type: u32, allow_errors: bool) -> TtmResult<()> {
        let mut st = bo.state.lock();
        self.expire_sync_obj(&mut st, allow_errors)?;
        self.evict(bo, &mut st, mem_type, None, false)
    }

    /// Allocates the buffer's range in the device address space.
    pub(crate) fn setup_vm(&self, bo: &BufferObject) -> TtmResult<()> {
        let mut vm = self.vm.write();
        let Some(node) = vm.mm.allocate(bo.num_pages(), 0) else {
            error!(bo = %bo.id(), pages = bo.num_pages(), "Out of address space");
            return Err(TtmError::OutOfMemory);
        };
        vm.index.insert(node.start, bo.id());
        vm.nodes.insert(bo.id(), node);
        bo.set_addr_space_offset(node.start << PAGE_SHIFT);
        Ok(())
    }

    /// Finds the buffer whose address-space range covers `page_offset` and
    /// takes a strong reference to it.
    #[must_use]
    pub fn lookup_offset(self: &Arc<Self>, page_offset: u64) -> Option<crate::bo::BoRef> {
        let vm = self.vm.read();
        let (_, &id) = vm.index.range(..=page_offset).next_back()?;
        let node = vm.nodes.get(&id)?;
        if !node.contains(page_offset) {
            return None;
        }
        let bo = self.lru.lock().objects.get(&id)?.clone();
        bo.kref.fetch_add(1, Ordering::Relaxed);
        Some(crate::bo::BoRef::from_counted(self.clone(), bo))
    }

    /// Whether a placement is reached over the bus rather than as system
    /// pages.
    #[must_use]
    pub fn mem_reg_is_pci(&self, mem: &MemReg) -> bool {
        self.lru
            .lock()
            .man
            .get(mem.mem_type as usize)
            .is_some_and(|man| man.reg_is_pci(mem))
    }

    /// Bus window for CPU-mapping a placement. All zero for system pages.
    ///
    /// # Errors
    /// `InvalidArgument` if the placement is on the bus but not mappable.
    pub fn pci_offset(&self, mem: &MemReg) -> TtmResult<BusPlacement> {
        let lru = self.lru.lock();
        let Some(man) = lru.man.get(mem.mem_type as usize) else {
            return Err(TtmError::InvalidMemType(mem.mem_type));
        };
        if !man.reg_is_pci(mem) {
            return Ok(BusPlacement::default());
        }
        if !man.flags().contains(MemTypeFlags::MAPPABLE) {
            return Err(TtmError::InvalidArgument(format!(
                "memory type {} is not mappable",
                mem.mem_type
            )));
        }
        Ok(BusPlacement {
            base: man.io_offset(),
            offset: mem.node.map_or(0, |node| node.start << PAGE_SHIFT),
            size: mem.num_pages << PAGE_SHIFT,
        })
    }

    #[must_use]
    pub fn mem_type_stats(&self, mem_type: u32) -> Option<MemTypeStats> {
        self.lru.lock().man.get(mem_type as usize).map(MemTypeManager::stats)
    }

    #[must_use]
    pub fn object_count(&self) -> usize {
        self.lru.lock().objects.len()
    }

    #[must_use]
    pub fn ddestroy_len(&self) -> usize {
        self.lru.lock().ddestroy.len()
    }

    #[must_use]
    pub fn swap_lru_len(&self) -> usize {
        self.lru.lock().swap_lru.len()
    }

    /// Cross-checks allocator occupancy and list membership against the
    /// buffers' own state. Meant for quiescent devices; returns every
    /// violation found.
    #[must_use]
    pub fn check_invariants(&self) -> Vec<String> {
        let objects: Vec<_> = self.lru.lock().objects.values().cloned().collect();

        let mut resident: [Vec<Extent>; NUM_MEM_TYPES] = Default::default();
        let mut placements = HashMap::new();
        for bo in &objects {
            let st = bo.state.lock();
            if let Some(node) = st.mem.node {
                resident[st.mem.mem_type as usize].push(node);
            }
            placements.insert(bo.id(), (st.mem.mem_type, bo.is_reserved()));
        }

        let mut violations = Vec::new();
        let lru = self.lru.lock();
        for (idx, man) in lru.man.iter().enumerate() {
            let mut extents: Vec<_> = man.manager.extents().collect();
            extents.sort_by_key(|e| e.start);
            let mut held = std::mem::take(&mut resident[idx]);
            held.sort_by_key(|e| e.start);
            if extents != held {
                violations.push(format!(
                    "memory type {idx}: allocator holds {extents:?}, buffers hold {held:?}"
                ));
            }

            for id in man.lru.iter() {
                match placements.get(&id) {
                    Some(&(_, true)) => {
                        violations.push(format!("{id} is reserved but on the LRU of type {idx}"));
                    }
                    Some(&(t, _)) if t as usize != idx => {
                        violations.push(format!(
                            "{id} lives in type {t} but is on the LRU of type {idx}"
                        ));
                    }
                    None => {
                        violations.push(format!(
                            "{id} on the LRU of type {idx} is not a live object"
                        ));
                    }
                    _ => {}
                }
            }
        }
        for id in lru.swap_lru.iter() {
            if matches!(placements.get(&id), Some(&(_, true))) {
                violations.push(format!("{id} is reserved but on the swap LRU"));
            }
        }
        violations
    }

    /// Tears the device down: cleans every memory type, drains delayed
    /// destruction and stops the workers.
    ///
    /// # Errors
    /// `Busy` if some memory type or the address space was not clean.
    pub fn release(&self) -> TtmResult<()> {
        let mut ret = Ok(());

        for mem_type in (0..NUM_MEM_TYPES as u32).rev() {
            let has_type = self.lru.lock().man[mem_type as usize].has_type;
            if !has_type || mem_type == mem_type::SYSTEM {
                continue;
            }
            if self.clean_mm(mem_type).is_err() {
                error!(mem_type, "Memory type not clean at device release");
                ret = Err(TtmError::Busy);
            }
        }

        self.ddestroy_work.cancel();
        while self.delayed_delete(true) {}
        self.ddestroy_work.stop();
        self.swap_work.stop();

        self.lru.lock().man[mem_type::SYSTEM as usize].takedown();

        {
            let lru = self.lru.lock();
            if lru.ddestroy.is_empty() {
                debug!("Delayed destroy list was clean");
            }
            if lru.swap_lru.is_empty() {
                debug!("Swap list was clean");
            }
        }

        if !self.vm.read().mm.is_clean() {
            error!("Device address space is not clean at release");
            ret = Err(TtmError::Busy);
        }
        ret
    }
}

impl Drop for BoDevice {
    fn drop(&mut self) {
        self.ddestroy_work.stop();
        self.swap_work.stop();
    }
}

impl std::fmt::Debug for BoDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoDevice")
            .field("config", &self.config)
            .field("nice_mode", &self.nice_mode())
            .finish_non_exhaustive()
    }
}
