use anyhow::Result;
use pagestore::config::StorageSettings;
use pagestore::device::DatabaseDevice;
use pagestore::event::{EventSink, NullEventSink, SharedEventSink};
use pagestore::session::{Connection, SessionManager};
use pagestore::storage::{
    BufferCache, DeviceId, DeviceRegistry, Page, PageType, StorageError, VirtualPageId,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

const PAGE_SIZE: usize = 1024;

struct Engine {
    registry: Arc<DeviceRegistry>,
    cache: Arc<BufferCache>,
    master: Arc<DatabaseDevice>,
    sessions: Arc<SessionManager>,
}

async fn bootstrap(
    dir: &tempfile::TempDir,
    scavenge_threshold: usize,
    sink: SharedEventSink,
    is_create: bool,
) -> Result<Engine> {
    let settings = StorageSettings {
        page_size: PAGE_SIZE,
        scavenge_threshold,
        ..StorageSettings::default()
    };
    let registry = Arc::new(DeviceRegistry::new());
    let cache = Arc::new(BufferCache::new(
        registry.clone(),
        &settings,
        sink.clone(),
    ));
    let master = Arc::new(DatabaseDevice::new(
        DeviceId::ZERO,
        "master",
        dir.path().join("master.pagestore"),
        PAGE_SIZE,
        registry.clone(),
        sink,
    ));
    master.open(is_create).await?;
    Ok(Engine {
        registry,
        cache,
        master,
        sessions: SessionManager::new(),
    })
}

#[tokio::test]
async fn test_full_write_read_cycle() -> Result<()> {
    let dir = tempdir()?;

    // Create, write pages under a session, flush, close.
    {
        let engine = bootstrap(&dir, 16, Arc::new(NullEventSink), true).await?;
        let mut connection = Connection::new(
            engine.sessions.create_session(),
            engine.master.clone(),
            Duration::from_millis(200),
        );

        let cache = engine.cache.clone();
        connection
            .execute_under_session(|context| async move {
                let device_id = context.active_database().unwrap().device_id();
                for page_no in 0..4u32 {
                    let page_id = VirtualPageId::new(device_id, page_no);
                    let buffer = cache.allocate(page_id)?;
                    let mut page = Page::new(page_id, PageType::Data);
                    page.init(buffer)?;
                    page.write_data(0, format!("page-{page_no}").as_bytes())?;
                    page.save(&cache).await?;
                    page.dispose()?;
                }
                Ok(())
            })
            .await?;

        connection.close()?;
        engine.cache.flush_all().await?;
        engine.master.close().await?;
    }

    // Reopen and read the pages back through a fresh engine.
    {
        let engine = bootstrap(&dir, 16, Arc::new(NullEventSink), false).await?;
        let connection = Connection::new(
            engine.sessions.create_session(),
            engine.master.clone(),
            Duration::from_millis(200),
        );

        let cache = engine.cache.clone();
        connection
            .execute_under_session(|context| async move {
                let device_id = context.active_database().unwrap().device_id();
                for page_no in 0..4u32 {
                    let page_id = VirtualPageId::new(device_id, page_no);
                    let buffer = cache.fetch(page_id).await?;
                    let mut page = Page::new(page_id, PageType::Data);
                    page.load(buffer)?;
                    assert!(!page.is_new_page());

                    let expected = format!("page-{page_no}");
                    let mut out = vec![0u8; expected.len()];
                    page.read_data(0, &mut out)?;
                    assert_eq!(out, expected.as_bytes());
                    page.dispose()?;
                }
                Ok(())
            })
            .await?;

        engine.master.close().await?;
    }

    Ok(())
}

#[derive(Default)]
struct ScavengeRecorder {
    begins: Mutex<Vec<(usize, usize)>>,
    ends: Mutex<Vec<(usize, usize)>>,
}

impl EventSink for ScavengeRecorder {
    fn scavenge_begin(&self, buffer_count: usize, threshold: usize) {
        self.begins.lock().push((buffer_count, threshold));
    }

    fn scavenge_end(&self, buffer_count: usize, threshold: usize) {
        self.ends.lock().push((buffer_count, threshold));
    }
}

#[tokio::test]
async fn test_scavenge_under_session_workload() -> Result<()> {
    let dir = tempdir()?;
    let sink = Arc::new(ScavengeRecorder::default());
    let engine = bootstrap(&dir, 4, sink.clone(), true).await?;

    let connection = Connection::new(
        engine.sessions.create_session(),
        engine.master.clone(),
        Duration::from_millis(200),
    );

    let cache = engine.cache.clone();
    connection
        .execute_under_session(|context| async move {
            let device_id = context.active_database().unwrap().device_id();
            // Five distinct pages, each released after use.
            for page_no in 0..5u32 {
                let page_id = VirtualPageId::new(device_id, page_no);
                let buffer = cache.allocate(page_id)?;
                let mut page = Page::new(page_id, PageType::Data);
                page.init(buffer)?;
                page.save(&cache).await?;
                page.dispose()?;
            }
            Ok(())
        })
        .await?;

    let begins = sink.begins.lock().clone();
    assert_eq!(begins, vec![(5, 4)]);
    let ends = sink.ends.lock().clone();
    assert_eq!(ends.len(), 1);
    assert!(ends[0].0 <= 4);
    assert!(engine.cache.len() <= 4);

    Ok(())
}

#[tokio::test]
async fn test_exclusive_maintenance_contention() -> Result<()> {
    let dir = tempdir()?;
    let engine = bootstrap(&dir, 16, Arc::new(NullEventSink), true).await?;
    let device = engine.master.clone();

    // First contender takes the maintenance lock.
    device
        .use_database_exclusive(Duration::from_millis(100))
        .await?;

    // Second contender races for it concurrently and must time out.
    let contender = {
        let device = device.clone();
        tokio::spawn(async move {
            device
                .use_database_exclusive(Duration::from_millis(100))
                .await
        })
    };
    let err = contender.await?.unwrap_err();
    assert!(matches!(err, StorageError::LockTimeout { .. }));

    device.unuse_database()?;
    Ok(())
}

#[tokio::test]
async fn test_connection_teardown_releases_everything() -> Result<()> {
    let dir = tempdir()?;
    let engine = bootstrap(&dir, 16, Arc::new(NullEventSink), true).await?;

    {
        let connection = Connection::new(
            engine.sessions.create_session(),
            engine.master.clone(),
            Duration::from_millis(200),
        );
        connection
            .execute_under_session(|_context| async move { Ok(()) })
            .await?;
        assert_eq!(engine.master.usage_count(), 1);
        assert_eq!(engine.sessions.active_count(), 1);
        // Dropped without an explicit close.
    }

    assert_eq!(engine.master.usage_count(), 0);
    assert_eq!(engine.sessions.active_count(), 0);

    // The device can now be taken for exclusive maintenance.
    engine
        .master
        .use_database_exclusive(Duration::from_millis(100))
        .await?;
    engine.master.unuse_database()?;
    Ok(())
}

#[tokio::test]
async fn test_second_device_is_addressable() -> Result<()> {
    let dir = tempdir()?;
    let engine = bootstrap(&dir, 16, Arc::new(NullEventSink), true).await?;

    let second = Arc::new(DatabaseDevice::new(
        DeviceId(1),
        "second",
        dir.path().join("second.pagestore"),
        PAGE_SIZE,
        engine.registry.clone(),
        Arc::new(NullEventSink),
    ));
    second.open(true).await?;

    // Pages on different devices with equal page numbers stay distinct.
    for (device_id, fill) in [(DeviceId::ZERO, 0x11u8), (DeviceId(1), 0x22u8)] {
        let page_id = VirtualPageId::new(device_id, 0);
        let buffer = engine.cache.allocate(page_id)?;
        let mut page = Page::new(page_id, PageType::Data);
        page.init(buffer)?;
        page.write_data(0, &[fill; 16])?;
        page.save(&engine.cache).await?;
        page.dispose()?;
    }

    for (device_id, fill) in [(DeviceId::ZERO, 0x11u8), (DeviceId(1), 0x22u8)] {
        let page_id = VirtualPageId::new(device_id, 0);
        let buffer = engine.cache.fetch(page_id).await?;
        let mut page = Page::new(page_id, PageType::Data);
        page.load(buffer)?;
        let mut out = [0u8; 16];
        page.read_data(0, &mut out)?;
        assert_eq!(out, [fill; 16]);
        page.dispose()?;
    }

    second.close().await?;
    Ok(())
}
