//! File-backed page storage.
//!
//! [`DeviceStorage`] is the byte-storage primitive a single device consumes:
//! bounded page reads and writes against one file, async via tokio so no
//! scheduling thread ever blocks on device I/O. [`DeviceRegistry`] resolves
//! a [`VirtualPageId`] to the storage owning it, which is what gives the
//! cache a single lookup path across every mounted device.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page_id::{DeviceId, VirtualPageId};
use dashmap::DashMap;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

/// Page-granular storage over a single file.
pub struct DeviceStorage {
    file: Mutex<File>,
    page_size: usize,
}

impl DeviceStorage {
    /// Creates a new storage file, truncating any existing content.
    pub async fn create(path: &Path, page_size: usize) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .await?;
        Ok(Self {
            file: Mutex::new(file),
            page_size,
        })
    }

    /// Opens an existing storage file.
    pub async fn open(path: &Path, page_size: usize) -> StorageResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path).await?;
        Ok(Self {
            file: Mutex::new(file),
            page_size,
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Reads one page into `buf`, which must be exactly one page long.
    pub async fn read_page(&self, page_id: VirtualPageId, buf: &mut [u8]) -> StorageResult<()> {
        self.check_buffer_len(buf.len())?;

        let offset = self.page_offset(page_id);
        let mut file = self.file.lock().await;
        let file_size = file.metadata().await?.len();
        if offset >= file_size {
            return Err(StorageError::PageNotFound(page_id));
        }

        file.seek(SeekFrom::Start(offset)).await?;
        file.read_exact(buf).await?;
        Ok(())
    }

    /// Writes one page, extending the file if needed. The write is synced
    /// before returning so a confirmed write is durable.
    pub async fn write_page(&self, page_id: VirtualPageId, data: &[u8]) -> StorageResult<()> {
        self.check_buffer_len(data.len())?;

        let offset = self.page_offset(page_id);
        let mut file = self.file.lock().await;
        let file_size = file.metadata().await?.len();
        if offset >= file_size {
            file.set_len(offset + self.page_size as u64).await?;
        }

        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Number of pages the file currently holds.
    pub async fn page_count(&self) -> StorageResult<u32> {
        let file = self.file.lock().await;
        let file_size = file.metadata().await?.len();
        Ok((file_size / self.page_size as u64) as u32)
    }

    /// Extends the file by one page and returns the new physical page id.
    pub async fn allocate(&self) -> StorageResult<u32> {
        let mut file = self.file.lock().await;
        let file_size = file.metadata().await?.len();
        let current_pages = file_size / self.page_size as u64;
        if current_pages > VirtualPageId::MAX_PHYSICAL_PAGE_ID as u64 {
            return Err(StorageError::AddressOutOfRange {
                page_id: VirtualPageId::ZERO,
                offset: current_pages as i64,
            });
        }

        file.set_len((current_pages + 1) * self.page_size as u64)
            .await?;
        Ok(current_pages as u32)
    }

    fn check_buffer_len(&self, len: usize) -> StorageResult<()> {
        if len != self.page_size {
            return Err(StorageError::OutOfRange {
                offset: 0,
                count: len,
                buffer_size: self.page_size,
            });
        }
        Ok(())
    }

    fn page_offset(&self, page_id: VirtualPageId) -> u64 {
        page_id.physical_page_id() as u64 * self.page_size as u64
    }
}

/// Resolves device ids to their backing storage.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: DashMap<DeviceId, Arc<DeviceStorage>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, device_id: DeviceId, storage: Arc<DeviceStorage>) {
        self.devices.insert(device_id, storage);
    }

    pub fn unregister(&self, device_id: DeviceId) -> Option<Arc<DeviceStorage>> {
        self.devices.remove(&device_id).map(|(_, storage)| storage)
    }

    pub fn get(&self, device_id: DeviceId) -> StorageResult<Arc<DeviceStorage>> {
        self.devices
            .get(&device_id)
            .map(|entry| entry.value().clone())
            .ok_or(StorageError::DeviceNotFound(device_id))
    }

    pub fn is_registered(&self, device_id: DeviceId) -> bool {
        self.devices.contains_key(&device_id)
    }

    /// Reads a page from whichever device owns it.
    pub async fn read_page(&self, page_id: VirtualPageId, buf: &mut [u8]) -> StorageResult<()> {
        self.get(page_id.device_id())?.read_page(page_id, buf).await
    }

    /// Writes a page to whichever device owns it.
    pub async fn write_page(&self, page_id: VirtualPageId, data: &[u8]) -> StorageResult<()> {
        self.get(page_id.device_id())?
            .write_page(page_id, data)
            .await
    }
}
