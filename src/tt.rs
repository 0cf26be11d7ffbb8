#![allow(clippy::cast_possible_truncation)]

use crate::error::{TtmError, TtmResult};
use crate::memory::MemAccounting;
use crate::placement::{Caching, PlacementFlags};
use crate::utils::pages_to_bytes;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use tracing::{debug, error, trace};

/// Binding state of a backing page array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtState {
    Unbound,
    /// Bound into the GPU aperture of the given memory type.
    Bound(u32),
}

/// Where swapped-out contents went.
#[derive(Debug)]
enum SwapStorage {
    /// Anonymous file owned by the page array.
    Anonymous(File),
    /// Caller-supplied file that outlives the page array.
    Persistent(Arc<File>),
}

impl SwapStorage {
    fn file(&self) -> &File {
        match self {
            Self::Anonymous(file) => file,
            Self::Persistent(file) => file.as_ref(),
        }
    }
}

/// The CPU-side page array backing a buffer object.
///
/// Pages are allocated on first use. Contents can be handed to swap storage
/// and come back on the next access.
#[derive(Debug)]
pub struct Tt {
    num_pages: u64,
    user: bool,
    caching: Caching,
    state: TtState,
    pages: Option<Vec<u8>>,
    swap: Option<SwapStorage>,
    /// Charged for resident pages.
    accounting: Option<Arc<dyn MemAccounting>>,
}

impl Tt {
    #[must_use]
    pub const fn new(num_pages: u64, user: bool) -> Self {
        Self {
            num_pages,
            user,
            caching: Caching::Cached,
            state: TtState::Unbound,
            pages: None,
            swap: None,
            accounting: None,
        }
    }

    /// Charges resident pages against `accounting`.
    #[must_use]
    pub fn with_accounting(mut self, accounting: Arc<dyn MemAccounting>) -> Self {
        self.accounting = Some(accounting);
        self
    }

    #[must_use]
    pub const fn num_pages(&self) -> u64 {
        self.num_pages
    }

    #[must_use]
    pub const fn is_user(&self) -> bool {
        self.user
    }

    #[must_use]
    pub const fn caching(&self) -> Caching {
        self.caching
    }

    #[must_use]
    pub const fn state(&self) -> TtState {
        self.state
    }

    #[must_use]
    pub const fn is_swapped(&self) -> bool {
        self.swap.is_some()
    }

    #[must_use]
    pub const fn is_populated(&self) -> bool {
        self.pages.is_some()
    }

    fn byte_len(&self) -> usize {
        pages_to_bytes(self.num_pages) as usize
    }

    /// Makes the pages resident, reading them back from swap if needed.
    ///
    /// # Errors
    /// Propagates I/O errors from the swap storage.
    pub fn populate(&mut self) -> TtmResult<()> {
        if self.pages.is_some() {
            return Ok(());
        }
        let len = self.byte_len();
        if let Some(acc) = &self.accounting {
            acc.alloc(len, false)?;
        }
        let mut pages = Vec::new();
        if pages.try_reserve_exact(len).is_err() {
            if let Some(acc) = &self.accounting {
                acc.free(len);
            }
            error!(pages = self.num_pages, "Backing page allocation failed");
            return Err(TtmError::OutOfMemory);
        }
        pages.resize(len, 0);
        if let Some(swap) = self.swap.take() {
            let mut file = swap.file();
            let read = file
                .seek(SeekFrom::Start(0))
                .and_then(|_| file.read_exact(&mut pages));
            if let Err(e) = read {
                self.swap = Some(swap);
                if let Some(acc) = &self.accounting {
                    acc.free(len);
                }
                return Err(e.into());
            }
            debug!(pages = self.num_pages, "Swapped in backing pages");
        }
        self.pages = Some(pages);
        Ok(())
    }

    /// Applies the caching bits of a placement to the pages.
    pub fn set_placement_caching(&mut self, flags: PlacementFlags) {
        let caching = Caching::from_flags(flags);
        if caching != self.caching {
            trace!(?caching, "Changing page caching");
            self.caching = caching;
        }
    }

    /// Binds the pages into the aperture of `mem_type`.
    ///
    /// # Errors
    /// Fails if the pages cannot be made resident.
    pub fn bind(&mut self, mem_type: u32) -> TtmResult<()> {
        self.populate()?;
        self.state = TtState::Bound(mem_type);
        Ok(())
    }

    pub fn unbind(&mut self) {
        self.state = TtState::Unbound;
    }

    /// Writes the page contents to swap storage and releases them.
    ///
    /// `persistent` receives the contents if given; otherwise an anonymous
    /// temporary file is used.
    ///
    /// # Errors
    /// Returns `Busy` while bound, or the I/O error from writing the storage.
    pub fn swap_out(&mut self, persistent: Option<&Arc<File>>) -> TtmResult<()> {
        if matches!(self.state, TtState::Bound(_)) {
            return Err(TtmError::Busy);
        }
        let Some(pages) = self.pages.take() else {
            return Ok(());
        };

        let storage = match persistent {
            Some(file) => SwapStorage::Persistent(file.clone()),
            None => match tempfile::tempfile() {
                Ok(file) => SwapStorage::Anonymous(file),
                Err(e) => {
                    self.pages = Some(pages);
                    return Err(e.into());
                }
            },
        };

        let mut file = storage.file();
        let written = file
            .seek(SeekFrom::Start(0))
            .and_then(|_| file.write_all(&pages))
            .and_then(|()| file.flush());
        if let Err(e) = written {
            self.pages = Some(pages);
            return Err(e.into());
        }

        debug!(pages = self.num_pages, "Swapped out backing pages");
        self.swap = Some(storage);
        if let Some(acc) = &self.accounting {
            acc.free(pages.len());
        }
        Ok(())
    }

    /// Copies bytes starting at `offset` into `dst`.
    ///
    /// # Errors
    /// Returns `InvalidArgument` for out-of-range access, or swap-in errors.
    pub fn read(&mut self, offset: usize, dst: &mut [u8]) -> TtmResult<()> {
        self.check_range(offset, dst.len())?;
        self.populate()?;
        if let Some(pages) = &self.pages {
            dst.copy_from_slice(&pages[offset..offset + dst.len()]);
        }
        Ok(())
    }

    /// Copies `src` into the pages starting at `offset`.
    ///
    /// # Errors
    /// Returns `InvalidArgument` for out-of-range access, or swap-in errors.
    pub fn write(&mut self, offset: usize, src: &[u8]) -> TtmResult<()> {
        self.check_range(offset, src.len())?;
        self.populate()?;
        if let Some(pages) = &mut self.pages {
            pages[offset..offset + src.len()].copy_from_slice(src);
        }
        Ok(())
    }

    fn check_range(&self, offset: usize, len: usize) -> TtmResult<()> {
        if offset.checked_add(len).is_none_or(|end| end > self.byte_len()) {
            return Err(TtmError::InvalidArgument(format!(
                "access {offset}+{len} beyond {} pages",
                self.num_pages
            )));
        }
        Ok(())
    }
}

impl Drop for Tt {
    fn drop(&mut self) {
        if let (Some(pages), Some(acc)) = (&self.pages, &self.accounting) {
            acc.free(pages.len());
        }
    }
}
