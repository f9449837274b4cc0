//! Notification sink for cache and device lifecycle events.
//!
//! Notifications are fire-and-forget: a sink must not block and its
//! behaviour never affects the outcome of the operation that emitted the
//! event.

use crate::storage::page_id::DeviceId;
use log::{debug, info};
use std::sync::Arc;

/// Receives engine notifications.
pub trait EventSink: Send + Sync {
    /// A scavenge pass is starting because the cache exceeded its threshold.
    fn scavenge_begin(&self, buffer_count: usize, threshold: usize) {
        let _ = (buffer_count, threshold);
    }

    /// A scavenge pass finished, successfully or not.
    fn scavenge_end(&self, buffer_count: usize, threshold: usize) {
        let _ = (buffer_count, threshold);
    }

    /// A device usage lock was acquired.
    fn device_lock_acquired(&self, device_id: DeviceId, exclusive: bool) {
        let _ = (device_id, exclusive);
    }

    /// A device usage lock was released.
    fn device_lock_released(&self, device_id: DeviceId) {
        let _ = device_id;
    }
}

pub type SharedEventSink = Arc<dyn EventSink>;

/// Default sink: forwards everything to the `log` facade.
#[derive(Debug, Default)]
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn scavenge_begin(&self, buffer_count: usize, threshold: usize) {
        info!(
            "scavenge begin: {} buffers cached, threshold {}",
            buffer_count, threshold
        );
    }

    fn scavenge_end(&self, buffer_count: usize, threshold: usize) {
        info!(
            "scavenge end: {} buffers cached, threshold {}",
            buffer_count, threshold
        );
    }

    fn device_lock_acquired(&self, device_id: DeviceId, exclusive: bool) {
        debug!(
            "device {} usage lock acquired (exclusive: {})",
            device_id, exclusive
        );
    }

    fn device_lock_released(&self, device_id: DeviceId) {
        debug!("device {} usage lock released", device_id);
    }
}

/// Sink that discards every notification.
#[derive(Debug, Default)]
pub struct NullEventSink;

impl EventSink for NullEventSink {}
