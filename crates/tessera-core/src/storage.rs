use std::sync::{Arc, Weak};

use bytemuck::Zeroable;
use parking_lot::RwLock;

use crate::error::TesseraError;
use crate::Result;

/// Element buffer shared between an owner and its views.
pub type SharedBuffer<T> = Arc<RwLock<Vec<T>>>;

/// Backing storage for one backend.
///
/// An `Owned` buffer is held by exactly one backend. Views created from it
/// hold only a `Weak` reference plus an element offset, so they never extend
/// the buffer's lifetime: once the owner deallocates or drops, every access
/// through a view fails with a state error instead of touching freed memory.
#[derive(Debug)]
pub enum Storage<T> {
    Unallocated,
    Owned(SharedBuffer<T>),
    Shared {
        source: Weak<RwLock<Vec<T>>>,
        offset: usize,
    },
}

impl<T: Zeroable + Clone> Storage<T> {
    /// Zero-filled owned buffer of `len` elements.
    pub fn zeros(len: usize) -> Self {
        Storage::Owned(Arc::new(RwLock::new(vec![T::zeroed(); len])))
    }
}

impl<T> Storage<T> {
    /// Adopt a caller-provided buffer without copying.
    pub fn from_vec(data: Vec<T>) -> Self {
        Storage::Owned(Arc::new(RwLock::new(data)))
    }

    /// Whether the storage can currently be read.
    pub fn is_allocated(&self) -> bool {
        match self {
            Storage::Unallocated => false,
            Storage::Owned(_) => true,
            Storage::Shared { source, .. } => source.strong_count() > 0,
        }
    }

    /// Whether this storage borrows another backend's buffer.
    pub fn is_view(&self) -> bool {
        matches!(self, Storage::Shared { .. })
    }

    /// Element offset into the underlying buffer.
    pub fn offset(&self) -> usize {
        match self {
            Storage::Shared { offset, .. } => *offset,
            _ => 0,
        }
    }

    /// Number of elements reachable from this storage's offset.
    pub fn available(&self) -> usize {
        match self {
            Storage::Unallocated => 0,
            Storage::Owned(buf) => buf.read().len(),
            Storage::Shared { source, offset } => source
                .upgrade()
                .map_or(0, |buf| buf.read().len().saturating_sub(*offset)),
        }
    }

    /// Number of views still pointing into an owned buffer.
    pub fn live_views(&self) -> usize {
        match self {
            Storage::Owned(buf) => Arc::weak_count(buf),
            _ => 0,
        }
    }

    /// Create a non-owning view `offset` elements past this storage's own offset.
    pub fn share(&self, offset: usize, name: &str) -> Result<Storage<T>> {
        match self {
            Storage::Unallocated => Err(TesseraError::NotAllocated(name.to_string())),
            Storage::Owned(buf) => Ok(Storage::Shared {
                source: Arc::downgrade(buf),
                offset,
            }),
            Storage::Shared { source, offset: base } => {
                if source.strong_count() == 0 {
                    return Err(released(name));
                }
                Ok(Storage::Shared {
                    source: source.clone(),
                    offset: base + offset,
                })
            }
        }
    }

    fn buffer(&self, name: &str) -> Result<SharedBuffer<T>> {
        match self {
            Storage::Unallocated => Err(TesseraError::NotAllocated(name.to_string())),
            Storage::Owned(buf) => Ok(Arc::clone(buf)),
            Storage::Shared { source, .. } => source.upgrade().ok_or_else(|| released(name)),
        }
    }

    /// Run `f` over the elements starting at this storage's offset.
    pub fn read<R>(&self, name: &str, f: impl FnOnce(&[T]) -> R) -> Result<R> {
        let buf = self.buffer(name)?;
        let guard = buf.read();
        let offset = self.offset().min(guard.len());
        Ok(f(&guard[offset..]))
    }

    /// Run `f` over the mutable elements starting at this storage's offset.
    ///
    /// Writes through a view land in the owner's buffer.
    pub fn write<R>(&self, name: &str, f: impl FnOnce(&mut [T]) -> R) -> Result<R> {
        let buf = self.buffer(name)?;
        let mut guard = buf.write();
        let offset = self.offset().min(guard.len());
        Ok(f(&mut guard[offset..]))
    }
}

fn released(name: &str) -> TesseraError {
    TesseraError::StorageError(format!(
        "view '{name}' outlived the buffer it was created from"
    ))
}
