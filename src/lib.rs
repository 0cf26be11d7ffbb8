//! Buffer-object memory manager for GPU drivers.
//!
//! Buffers are placed across system pages and device memory types,
//! reserved for exclusive placement changes, evicted and swapped out under
//! pressure, and destroyed once their GPU work has retired.

pub mod bo;
pub mod device;
pub mod driver;
pub mod error;
pub mod memory;
pub mod placement;
pub mod sync;
pub mod tt;
pub mod utils;

mod destroy;
mod swap;
mod workqueue;

pub use bo::{BoId, BoParams, BoRef, BoType, BufferObject, Reserved};
pub use device::{BoDevice, BusPlacement, DeviceConfig};
pub use driver::{AddressSpaceMapping, BoDriver, BoMover, MemTypeConfig, MemTypeFlags};
pub use error::{TtmError, TtmResult};
pub use memory::{MemAccounting, MemGlobal, MemTypeStats};
pub use placement::{MemReg, PlacementFlags, mem_type};
pub use sync::{Fence, SyncObj, SyncRef};
