//! # Memory-Mapped File
//!
//! One OS file with one shared read-write mapping that grows in place.
//! `MappedFile` is the only owner of the mapping; everything above it works
//! in terms of offsets plus a `MapPin` that keeps the base address stable.
//!
//! ## Remap safety
//!
//! Growing the file remaps it, which can move the base address. All files
//! of one database share a `RemapMutex`; a `MapPin` holds the shared side
//! so a concurrent `reserve`/`resize` (exclusive side) cannot pull the
//! mapping out from under a reader mid-operation. Pins use the recursive
//! read acquire, so a thread that already holds a pin can take another
//! without deadlocking behind a queued writer. The one discipline callers
//! must keep: never allocate (anything that may `reserve`) while holding a
//! pin on the same thread.
//!
//! ## Growth
//!
//! `reserve(n)` is idempotent when `n` fits the current size; otherwise it
//! grows to `n` plus the configured percentage (default 50%, i.e. 1.5×) and
//! remaps. A failed map clears `(data, size)` to null/zero and reports the
//! failure; the file must then be treated as unusable.
//!
//! ## Concurrent byte access
//!
//! Rows written through a pin are disjoint by construction (allocation
//! hands out non-overlapping regions; in-place updates are serialized by
//! their table's locks). The documented exception is per-output spender
//! heights, which use the 32-bit atomic helpers below: aligned addresses
//! get real atomic loads/stores; unaligned ones fall back to plain
//! unaligned access, which is valid only under the serialized validation
//! sequence.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;
use parking_lot::lock_api::ArcRwLockReadGuard;
use parking_lot::{Mutex, RawRwLock, RwLock};
use tracing::debug;

use crate::error::StoreError;

/// Remap coordination lock shared by every file of one database.
pub type RemapMutex = Arc<RwLock<()>>;

/// Creates a fresh remap mutex for a database instance.
pub fn new_remap_mutex() -> RemapMutex {
    Arc::new(RwLock::new(()))
}

type PinGuard = ArcRwLockReadGuard<RawRwLock, ()>;

pub struct MappedFile {
    path: PathBuf,
    file: File,
    remap: RemapMutex,
    growth_rate: u64,
    map: Mutex<Option<MmapMut>>,
    data: AtomicPtr<u8>,
    size: AtomicUsize,
}

// SAFETY: the raw base pointer is only dereferenced through MapPin, which
// holds the shared remap lock; remapping (the only mutation of `data` and
// `size`) happens under the exclusive side. `map` is internally locked.
unsafe impl Send for MappedFile {}
unsafe impl Sync for MappedFile {}

impl MappedFile {
    /// Opens (creating if absent) and maps `path`. An empty file stays
    /// unmapped until the first `resize`.
    pub fn open<P: AsRef<Path>>(
        path: P,
        remap: RemapMutex,
        growth_rate: u64,
    ) -> Result<Arc<Self>> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .wrap_err_with(|| format!("failed to open store file '{}'", path.display()))?;

        let len = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len() as usize;

        let this = Arc::new(Self {
            path,
            file,
            remap,
            growth_rate,
            map: Mutex::new(None),
            data: AtomicPtr::new(ptr::null_mut()),
            size: AtomicUsize::new(0),
        });

        if len > 0 {
            let _exclusive = this.remap.write();
            this.remap_under_lock(len)?;
        }

        debug!(path = %this.path.display(), size = len, "mapped store file");
        Ok(this)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    /// Grows the file so that at least `required` bytes are mapped, adding
    /// the configured growth percentage. Idempotent when `required` already
    /// fits.
    pub fn reserve(&self, required: u64) -> Result<()> {
        let required = required as usize;
        if required <= self.size.load(Ordering::Acquire) {
            return Ok(());
        }

        let _exclusive = self.remap.write();

        // Another writer may have grown the file while we waited.
        if required <= self.size.load(Ordering::Acquire) {
            return Ok(());
        }

        let target = required + required * self.growth_rate as usize / 100;
        self.grow_under_lock(target)
    }

    /// Truncates the file up to exactly `new_size` and remaps.
    pub fn resize(&self, new_size: u64) -> Result<()> {
        let _exclusive = self.remap.write();
        self.grow_under_lock(new_size as usize)
    }

    fn grow_under_lock(&self, new_size: usize) -> Result<()> {
        self.file
            .set_len(new_size as u64)
            .wrap_err_with(|| {
                format!(
                    "failed to grow '{}' to {} bytes",
                    self.path.display(),
                    new_size
                )
            })?;
        self.remap_under_lock(new_size)
    }

    /// Drops the old mapping and maps the file at its new length. Requires
    /// the exclusive remap lock (or construction-time uniqueness).
    fn remap_under_lock(&self, new_size: usize) -> Result<()> {
        let mut map = self.map.lock();

        // Release the previous mapping first so platforms without an
        // in-place remap do not hold both address ranges at once.
        *map = None;

        // SAFETY: the file is open read-write and private to this process
        // (the database directory is exclusively locked); the mapping's
        // lifetime is bounded by `map`, and every dereference goes through
        // a MapPin holding the shared remap lock.
        match unsafe { MmapMut::map_mut(&self.file) } {
            Ok(mut mapped) => {
                self.data.store(mapped.as_mut_ptr(), Ordering::Release);
                self.size.store(new_size, Ordering::Release);
                *map = Some(mapped);
                Ok(())
            }
            Err(source) => {
                self.data.store(ptr::null_mut(), Ordering::Release);
                self.size.store(0, Ordering::Release);
                Err(source).wrap_err_with(|| format!("failed to map '{}'", self.path.display()))
            }
        }
    }

    /// Pins the current mapping for reading or in-row writing.
    pub fn pin(self: &Arc<Self>) -> MapPin {
        let guard = RwLock::read_arc_recursive(&self.remap);
        MapPin {
            ptr: self.data.load(Ordering::Acquire),
            len: self.size.load(Ordering::Acquire),
            _guard: guard,
        }
    }

    /// Advises the kernel that access will be random (hash-table lookups).
    pub fn advise_random(&self) {
        #[cfg(unix)]
        {
            let ptr = self.data.load(Ordering::Acquire);
            let len = self.size.load(Ordering::Acquire);
            if !ptr.is_null() && len > 0 {
                // SAFETY: madvise is a hint; the range is the live mapping,
                // and we hold no pin because the call does not dereference.
                unsafe {
                    libc::madvise(ptr as *mut libc::c_void, len, libc::MADV_RANDOM);
                }
            }
        }
    }

    /// Synchronously writes dirty pages back to the file.
    pub fn flush(&self) -> Result<()> {
        let _pin = RwLock::read_arc_recursive(&self.remap);
        let map = self.map.lock();
        if let Some(mapped) = map.as_ref() {
            mapped
                .flush()
                .wrap_err_with(|| format!("failed to flush '{}'", self.path.display()))?;
        }
        Ok(())
    }

    /// Flushes and fsyncs; called on close.
    pub fn close(&self) -> Result<()> {
        self.flush()?;
        self.file
            .sync_all()
            .wrap_err_with(|| format!("failed to fsync '{}'", self.path.display()))?;
        debug!(path = %self.path.display(), "closed store file");
        Ok(())
    }
}

/// A pinned view of one file's mapping. The base address is stable for the
/// life of the pin; offsets into it are bounds-checked against the pinned
/// length. Holding a pin across an allocation on the same thread deadlocks;
/// holding one long-term (a deferred result) delays growth, so results
/// should stay short-lived.
pub struct MapPin {
    ptr: *const u8,
    len: usize,
    _guard: PinGuard,
}

// SAFETY: the pin keeps the mapping alive and in place (shared remap lock);
// the pointer is valid for `len` bytes on any thread for the pin's life.
unsafe impl Send for MapPin {}
unsafe impl Sync for MapPin {}

impl MapPin {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn check(&self, offset: u64, width: usize) -> Result<usize> {
        let offset = offset as usize;
        ensure!(
            !self.ptr.is_null() && offset.checked_add(width).is_some_and(|end| end <= self.len),
            StoreError::CorruptStore
        );
        Ok(offset)
    }

    /// Borrows `len` bytes at `offset` for the life of the pin.
    pub fn bytes(&self, offset: u64, len: usize) -> Result<&[u8]> {
        let offset = self.check(offset, len)?;
        // SAFETY: bounds checked above; the mapping cannot move while the
        // pin is held.
        Ok(unsafe { std::slice::from_raw_parts(self.ptr.add(offset), len) })
    }

    /// Copies `src` into the mapping at `offset`. Callers guarantee the
    /// target region is theirs alone (fresh allocation or an update
    /// serialized by a table lock).
    pub fn write(&self, offset: u64, src: &[u8]) -> Result<()> {
        let offset = self.check(offset, src.len())?;
        // SAFETY: bounds checked; disjointness is the caller's contract.
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.add(offset) as *mut u8, src.len());
        }
        Ok(())
    }

    pub fn read_u8(&self, offset: u64) -> Result<u8> {
        Ok(self.bytes(offset, 1)?[0])
    }

    pub fn read_u16(&self, offset: u64) -> Result<u16> {
        let bytes = self.bytes(offset, 2)?;
        Ok(u16::from_le_bytes(bytes.try_into().expect("length checked")))
    }

    pub fn read_u32(&self, offset: u64) -> Result<u32> {
        let bytes = self.bytes(offset, 4)?;
        Ok(u32::from_le_bytes(bytes.try_into().expect("length checked")))
    }

    pub fn read_u64(&self, offset: u64) -> Result<u64> {
        let bytes = self.bytes(offset, 8)?;
        Ok(u64::from_le_bytes(bytes.try_into().expect("length checked")))
    }

    pub fn write_u16(&self, offset: u64, value: u16) -> Result<()> {
        self.write(offset, &value.to_le_bytes())
    }

    pub fn write_u32(&self, offset: u64, value: u32) -> Result<()> {
        self.write(offset, &value.to_le_bytes())
    }

    pub fn write_u64(&self, offset: u64, value: u64) -> Result<()> {
        self.write(offset, &value.to_le_bytes())
    }

    /// Atomic 32-bit load when `offset` is 4-byte aligned in memory;
    /// otherwise a plain unaligned load, valid only under the validation
    /// sequence.
    pub fn load_u32_atomic(&self, offset: u64) -> Result<u32> {
        let checked = self.check(offset, 4)?;
        // SAFETY: bounds checked; alignment checked before the atomic path.
        unsafe {
            let address = self.ptr.add(checked);
            if address as usize % 4 == 0 {
                let atomic = &*(address as *const AtomicU32);
                Ok(u32::from_le(atomic.load(Ordering::Acquire)))
            } else {
                Ok(u32::from_le(ptr::read_unaligned(address as *const u32)))
            }
        }
    }

    /// Atomic counterpart of `write_u32` for spender-height cells; same
    /// alignment rule as `load_u32_atomic`.
    pub fn store_u32_atomic(&self, offset: u64, value: u32) -> Result<()> {
        let checked = self.check(offset, 4)?;
        // SAFETY: bounds checked; alignment checked before the atomic path.
        unsafe {
            let address = self.ptr.add(checked) as *mut u32;
            if address as usize % 4 == 0 {
                let atomic = &*(address as *const AtomicU32);
                atomic.store(value.to_le(), Ordering::Release);
            } else {
                ptr::write_unaligned(address, value.to_le());
            }
        }
        Ok(())
    }
}
