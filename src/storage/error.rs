//! Storage layer error types.

use crate::storage::page_id::{DeviceId, VirtualPageId};
use thiserror::Error;

/// Errors that can occur in the storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("page address out of range: {page_id} offset by {offset}")]
    AddressOutOfRange {
        page_id: VirtualPageId,
        offset: i64,
    },

    #[error("mutation attempted on read-only {target}")]
    ReadOnlyViolation { target: &'static str },

    #[error("buffer for {page_id} is in use: {ref_count} reference(s), dirty: {dirty}")]
    BufferInUse {
        page_id: VirtualPageId,
        ref_count: u32,
        dirty: bool,
    },

    #[error("release without matching add_ref on buffer for {page_id}")]
    Underflow { page_id: VirtualPageId },

    #[error("device {device_id} is already open")]
    AlreadyOpen { device_id: DeviceId },

    #[error("device {device_id} is not open")]
    NotOpen { device_id: DeviceId },

    #[error("{target} has already been disposed")]
    AlreadyDisposed { target: &'static str },

    #[error("unuse without matching use on device {device_id}")]
    NotInUse { device_id: DeviceId },

    #[error("page operation requires state {expected}, found {found}")]
    InvalidPageState {
        expected: &'static str,
        found: &'static str,
    },

    #[error("range [{offset}, {offset}+{count}) exceeds buffer of {buffer_size} bytes")]
    OutOfRange {
        offset: usize,
        count: usize,
        buffer_size: usize,
    },

    #[error("lock on {target} not acquired within {timeout_ms}ms")]
    LockTimeout { target: String, timeout_ms: u64 },

    #[error("page {0} does not exist on its device")]
    PageNotFound(VirtualPageId),

    #[error("no device registered with id {0}")]
    DeviceNotFound(DeviceId),

    #[error("corrupt header on page {page_id}: {reason}")]
    CorruptHeader {
        page_id: VirtualPageId,
        reason: &'static str,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Lock timeouts are the one condition a caller is expected to retry;
    /// everything else in the taxonomy is surfaced immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::LockTimeout { .. })
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
