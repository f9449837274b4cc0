//! Caching buffer manager.
//!
//! [`BufferCache`] owns the live set of [`StatefulBuffer`]s keyed by
//! [`VirtualPageId`] and enforces an advisory capacity threshold. When an
//! insert pushes the cache over the threshold a scavenge pass walks
//! buffers in least-recently-used order and retires every one whose
//! `can_free` still holds at the instant of removal. The threshold is a
//! soft limit: if every remaining buffer is pinned the triggering
//! operation proceeds over-threshold and later releases shrink the cache.
//!
//! All mutation of the buffer map goes through this type; nothing else
//! touches it.

use crate::config::StorageSettings;
use crate::event::SharedEventSink;
use crate::storage::buffer::StatefulBuffer;
use crate::storage::disk::DeviceRegistry;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page_id::VirtualPageId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::trace;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

struct CacheEntry {
    buffer: Arc<StatefulBuffer>,
    /// Logical access tick, not wall time. Larger is more recent.
    last_access: AtomicU64,
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub cached_buffers: usize,
    pub scavenge_threshold: usize,
    pub scavenge_passes: u64,
}

/// Virtual-memory-backed cache of page buffers with threshold-triggered
/// eviction.
pub struct BufferCache {
    entries: DashMap<VirtualPageId, CacheEntry>,
    devices: Arc<DeviceRegistry>,
    page_size: usize,
    scavenge_threshold: usize,
    clock: AtomicU64,
    scavenge_passes: AtomicU64,
    sink: SharedEventSink,
}

impl BufferCache {
    pub fn new(
        devices: Arc<DeviceRegistry>,
        settings: &StorageSettings,
        sink: SharedEventSink,
    ) -> Self {
        Self {
            entries: DashMap::new(),
            devices,
            page_size: settings.page_size,
            scavenge_threshold: settings.scavenge_threshold,
            clock: AtomicU64::new(0),
            scavenge_passes: AtomicU64::new(0),
            sink,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, page_id: VirtualPageId) -> bool {
        self.entries.contains_key(&page_id)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            cached_buffers: self.entries.len(),
            scavenge_threshold: self.scavenge_threshold,
            scavenge_passes: self.scavenge_passes.load(Ordering::SeqCst),
        }
    }

    /// Fetches the buffer for `page_id`, loading it from the owning device
    /// on a miss. The returned buffer carries one reference owned by the
    /// caller; balance it with [`BufferCache::release`].
    pub async fn fetch(&self, page_id: VirtualPageId) -> StorageResult<Arc<StatefulBuffer>> {
        if let Some(buffer) = self.try_fetch_cached(page_id)? {
            return Ok(buffer);
        }

        // Miss: read from the device before touching the map, so a failed
        // or cancelled load leaves no cache state behind and a retry is
        // safe.
        let mut data = vec![0u8; self.page_size].into_boxed_slice();
        self.devices.read_page(page_id, &mut data).await?;
        trace!("loaded page {} from device", page_id);

        self.insert(page_id, data)
    }

    /// Materializes a zeroed buffer for a page that is about to be
    /// initialized, without reading the device. The returned buffer
    /// carries one caller-owned reference.
    pub fn allocate(&self, page_id: VirtualPageId) -> StorageResult<Arc<StatefulBuffer>> {
        let data = vec![0u8; self.page_size].into_boxed_slice();
        self.insert(page_id, data)
    }

    /// Drops one caller reference on the buffer for `page_id`.
    pub fn release(&self, page_id: VirtualPageId) -> StorageResult<()> {
        match self.entries.get(&page_id) {
            Some(entry) => entry.buffer.release(),
            None => Err(StorageError::PageNotFound(page_id)),
        }
    }

    /// Flushes one page's buffer to its device. The dirty flag is cleared
    /// only after the device confirms the write.
    pub async fn flush_page(&self, page_id: VirtualPageId) -> StorageResult<()> {
        let buffer = self
            .entries
            .get(&page_id)
            .map(|entry| entry.buffer.clone())
            .ok_or(StorageError::PageNotFound(page_id))?;
        self.flush_buffer(&buffer).await
    }

    /// Flushes every dirty buffer to its device.
    pub async fn flush_all(&self) -> StorageResult<()> {
        let dirty: Vec<Arc<StatefulBuffer>> = self
            .entries
            .iter()
            .filter(|entry| entry.value().buffer.is_dirty())
            .map(|entry| entry.value().buffer.clone())
            .collect();

        for buffer in dirty {
            self.flush_buffer(&buffer).await?;
        }
        Ok(())
    }

    /// Cache hit path. The reference is taken while the map guard is held
    /// so the scavenger's eligibility check cannot interleave between the
    /// lookup and the `add_ref`.
    fn try_fetch_cached(
        &self,
        page_id: VirtualPageId,
    ) -> StorageResult<Option<Arc<StatefulBuffer>>> {
        match self.entries.get(&page_id) {
            Some(entry) => {
                entry.buffer.add_ref()?;
                entry.last_access.store(self.tick(), Ordering::SeqCst);
                Ok(Some(entry.buffer.clone()))
            }
            None => Ok(None),
        }
    }

    fn insert(
        &self,
        page_id: VirtualPageId,
        data: Box<[u8]>,
    ) -> StorageResult<Arc<StatefulBuffer>> {
        let buffer = match self.entries.entry(page_id) {
            // Another caller materialized the buffer while we were off the
            // map; adopt theirs so exactly one instance stays live per id.
            Entry::Occupied(entry) => {
                entry.get().buffer.add_ref()?;
                entry.get().last_access.store(self.tick(), Ordering::SeqCst);
                entry.get().buffer.clone()
            }
            Entry::Vacant(slot) => {
                let buffer = Arc::new(StatefulBuffer::new(page_id, data));
                buffer.add_ref()?;
                slot.insert(CacheEntry {
                    buffer: buffer.clone(),
                    last_access: AtomicU64::new(self.tick()),
                });
                buffer
            }
        };

        if self.entries.len() > self.scavenge_threshold {
            self.scavenge();
        }
        Ok(buffer)
    }

    /// One eviction pass. Walks eligible buffers oldest-first and retires
    /// each whose `can_free` still holds at removal time. Stops at the
    /// threshold or when no candidates remain; falling short is tolerated.
    fn scavenge(&self) {
        let threshold = self.scavenge_threshold;
        self.sink.scavenge_begin(self.entries.len(), threshold);

        let mut candidates: Vec<(VirtualPageId, u64)> = self
            .entries
            .iter()
            .filter(|entry| entry.value().buffer.can_free())
            .map(|entry| (*entry.key(), entry.value().last_access.load(Ordering::SeqCst)))
            .collect();
        candidates.sort_by_key(|&(_, last_access)| last_access);

        for (page_id, _) in candidates {
            if self.entries.len() <= threshold {
                break;
            }
            // Eligibility is re-checked under the map's shard write lock:
            // a concurrent fetch either took its reference before we got
            // here (the predicate sees it and skips) or finds the entry
            // gone and reloads from the device.
            let removed = self
                .entries
                .remove_if(&page_id, |_, entry| entry.buffer.can_free());
            if let Some((_, entry)) = removed {
                let _ = entry.buffer.try_retire();
                trace!("scavenged buffer for page {}", page_id);
            }
        }

        self.scavenge_passes.fetch_add(1, Ordering::SeqCst);
        self.sink.scavenge_end(self.entries.len(), threshold);
    }

    async fn flush_buffer(&self, buffer: &Arc<StatefulBuffer>) -> StorageResult<()> {
        buffer.lock_read_only();
        let result = {
            let data = buffer.snapshot();
            self.devices.write_page(buffer.page_id(), &data).await
        };
        buffer.unlock_read_only();

        // A failed write leaves the dirty flag (and ref count) untouched
        // so the caller can retry.
        result?;
        buffer.mark_clean();
        Ok(())
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst)
    }
}
