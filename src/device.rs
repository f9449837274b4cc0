//! Mountable database devices.
//!
//! A [`DatabaseDevice`] pairs file-backed storage with a mount state
//! machine and a usage lock. Opening registers the device's storage with
//! the shared [`DeviceRegistry`] so the buffer cache can resolve its
//! pages; closing unregisters it. Usage follows the shared/exclusive
//! policy: any number of concurrent users for normal query execution, an
//! exclusive hold for structural maintenance, both bounded by a lock
//! timeout rather than waiting forever.

use crate::event::SharedEventSink;
use crate::storage::disk::{DeviceRegistry, DeviceStorage};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page_id::DeviceId;
use log::debug;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tokio::time::timeout;

/// Mount lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceState {
    Closed = 0,
    Opening = 1,
    Open = 2,
    Closing = 3,
}

impl DeviceState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => DeviceState::Closed,
            1 => DeviceState::Opening,
            2 => DeviceState::Open,
            _ => DeviceState::Closing,
        }
    }
}

enum UsageGuard {
    Shared(OwnedRwLockReadGuard<()>),
    Exclusive(OwnedRwLockWriteGuard<()>),
}

/// A mountable, lockable logical storage device.
pub struct DatabaseDevice {
    device_id: DeviceId,
    name: String,
    path: PathBuf,
    page_size: usize,
    state: AtomicU8,
    registry: Arc<DeviceRegistry>,
    usage_lock: Arc<RwLock<()>>,
    usages: parking_lot::Mutex<Vec<UsageGuard>>,
    sink: SharedEventSink,
}

impl DatabaseDevice {
    pub fn new(
        device_id: DeviceId,
        name: impl Into<String>,
        path: PathBuf,
        page_size: usize,
        registry: Arc<DeviceRegistry>,
        sink: SharedEventSink,
    ) -> Self {
        Self {
            device_id,
            name: name.into(),
            path,
            page_size,
            state: AtomicU8::new(DeviceState::Closed as u8),
            registry,
            usage_lock: Arc::new(RwLock::new(())),
            usages: parking_lot::Mutex::new(Vec::new()),
            sink,
        }
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> DeviceState {
        DeviceState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_open(&self) -> bool {
        self.state() == DeviceState::Open
    }

    /// Number of currently held usages (shared and exclusive).
    pub fn usage_count(&self) -> usize {
        self.usages.lock().len()
    }

    /// Opens the device, creating the backing file when `is_create` is
    /// set. A second open without an intervening close fails with
    /// [`StorageError::AlreadyOpen`].
    pub async fn open(&self, is_create: bool) -> StorageResult<()> {
        self.transition(DeviceState::Closed, DeviceState::Opening)
            .map_err(|_| StorageError::AlreadyOpen {
                device_id: self.device_id,
            })?;

        let result: StorageResult<()> = async {
            let storage = if is_create {
                DeviceStorage::create(&self.path, self.page_size).await?
            } else {
                DeviceStorage::open(&self.path, self.page_size).await?
            };
            self.registry.register(self.device_id, Arc::new(storage));
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                self.state.store(DeviceState::Open as u8, Ordering::SeqCst);
                debug!("device {} ({}) opened", self.device_id, self.name);
                Ok(())
            }
            Err(err) => {
                self.state
                    .store(DeviceState::Closed as u8, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    /// Closes the device, unregistering its storage. Closing a device
    /// that is not open fails with [`StorageError::NotOpen`].
    pub async fn close(&self) -> StorageResult<()> {
        self.transition(DeviceState::Open, DeviceState::Closing)
            .map_err(|_| StorageError::NotOpen {
                device_id: self.device_id,
            })?;

        self.registry.unregister(self.device_id);
        self.state
            .store(DeviceState::Closed as u8, Ordering::SeqCst);
        debug!("device {} ({}) closed", self.device_id, self.name);
        Ok(())
    }

    /// Acquires shared usage for normal query execution. Fails with
    /// [`StorageError::LockTimeout`] when the lock is not granted within
    /// `lock_timeout`.
    pub async fn use_database(&self, lock_timeout: Duration) -> StorageResult<()> {
        self.ensure_open()?;
        let guard = timeout(lock_timeout, self.usage_lock.clone().read_owned())
            .await
            .map_err(|_| self.lock_timeout_error(lock_timeout))?;
        self.usages.lock().push(UsageGuard::Shared(guard));
        self.sink.device_lock_acquired(self.device_id, false);
        Ok(())
    }

    /// Acquires exclusive usage for structural maintenance. No other
    /// usage, shared or exclusive, may be held concurrently.
    pub async fn use_database_exclusive(&self, lock_timeout: Duration) -> StorageResult<()> {
        self.ensure_open()?;
        let guard = timeout(lock_timeout, self.usage_lock.clone().write_owned())
            .await
            .map_err(|_| self.lock_timeout_error(lock_timeout))?;
        self.usages.lock().push(UsageGuard::Exclusive(guard));
        self.sink.device_lock_acquired(self.device_id, true);
        Ok(())
    }

    /// Releases one usage. Use/unuse calls must balance: an unmatched
    /// unuse fails with [`StorageError::NotInUse`]. Synchronous because
    /// dropping a guard never awaits, which lets connection teardown
    /// release device locks without an executor.
    pub fn unuse_database(&self) -> StorageResult<()> {
        let released = self.usages.lock().pop();
        if released.is_none() {
            return Err(StorageError::NotInUse {
                device_id: self.device_id,
            });
        }
        self.sink.device_lock_released(self.device_id);
        Ok(())
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if !self.is_open() {
            return Err(StorageError::NotOpen {
                device_id: self.device_id,
            });
        }
        Ok(())
    }

    fn transition(&self, from: DeviceState, to: DeviceState) -> Result<(), ()> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|_| ())
    }

    fn lock_timeout_error(&self, lock_timeout: Duration) -> StorageError {
        StorageError::LockTimeout {
            target: format!("device {}", self.name),
            timeout_ms: lock_timeout.as_millis() as u64,
        }
    }
}
