//! Queue persistence across manager restarts.

mod common;

use std::sync::Arc;
use std::time::Duration;

use dlqueue::downloader::backend::{BackendAdapter, BackendKind};
use dlqueue::downloader::{
    AttemptResult, DownloadManager, DownloadStatus, EnqueueRequest, Priority,
};
use dlqueue::persistence::{JsonFileStore, MemoryStore, QueueStore};

use common::{OrderedResolver, ScriptedAdapter, fast_config, wait_for_entry};

async fn open_manager(data_dir: &std::path::Path, adapter: Arc<ScriptedAdapter>) -> DownloadManager {
    let store = JsonFileStore::open(data_dir).await.unwrap();
    DownloadManager::builder(fast_config(&data_dir.join("downloads")))
        .backend(adapter as Arc<dyn BackendAdapter>)
        .resolver(Arc::new(OrderedResolver::new([BackendKind::YtDlp])))
        .store(Arc::new(store))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_ids_increase_across_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = Arc::new(ScriptedAdapter::new(BackendKind::YtDlp, AttemptResult::success()));

    let manager = open_manager(dir.path(), adapter.clone()).await;
    let mut ids = Vec::new();
    for i in 0..3 {
        ids.push(
            manager
                .enqueue_with(EnqueueRequest::new(format!("https://example.com/a{i}")))
                .await
                .unwrap()
                .unwrap(),
        );
    }
    // a removed entry's id is never handed out again
    assert!(manager.remove(ids[2]).await.unwrap());
    manager.shutdown().await;
    drop(manager);

    let manager = open_manager(dir.path(), adapter).await;
    assert_eq!(manager.restore().await.unwrap(), 2);
    let next = manager
        .enqueue_with(EnqueueRequest::new("https://example.com/b"))
        .await
        .unwrap()
        .unwrap();

    assert!(ids.windows(2).all(|w| w[0] < w[1]));
    assert!(next > ids[2], "id {next} reused after {ids:?}");
    manager.shutdown().await;
}

#[tokio::test]
async fn test_restore_keeps_entry_fields() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = Arc::new(ScriptedAdapter::new(BackendKind::YtDlp, AttemptResult::success()));

    let manager = open_manager(dir.path(), adapter.clone()).await;
    let id = manager
        .enqueue_with(
            EnqueueRequest::new("https://example.com/keep")
                .priority(Priority::High)
                .sequence(7),
        )
        .await
        .unwrap()
        .unwrap();
    manager.shutdown().await;
    drop(manager);

    let manager = open_manager(dir.path(), adapter).await;
    manager.restore().await.unwrap();
    let entry = manager.get(id).unwrap();
    assert_eq!(entry.url, "https://example.com/keep");
    assert_eq!(entry.priority, Priority::High);
    assert_eq!(entry.sequence, Some(7));
    assert_eq!(entry.status, DownloadStatus::Queued);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_interrupted_download_resumes_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let slow = Arc::new(
        ScriptedAdapter::new(BackendKind::YtDlp, AttemptResult::success())
            .with_hold(Duration::from_secs(30)),
    );

    let manager = open_manager(dir.path(), slow).await;
    manager.start();
    let id = manager
        .enqueue_with(EnqueueRequest::new("https://example.com/resume"))
        .await
        .unwrap()
        .unwrap();
    wait_for_entry(&manager, id, Duration::from_secs(10), |e| {
        e.status == DownloadStatus::Starting
    })
    .await;
    manager.shutdown().await;
    drop(manager);

    let store = JsonFileStore::open(dir.path()).await.unwrap();
    let saved = store.load_all().await.unwrap();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].status, DownloadStatus::Queued);
    drop(store);

    let fast = Arc::new(ScriptedAdapter::new(BackendKind::YtDlp, AttemptResult::success()));
    let manager = open_manager(dir.path(), fast.clone()).await;
    manager.restore().await.unwrap();
    manager.start();
    let entry = wait_for_entry(&manager, id, Duration::from_secs(10), |e| e.is_terminal()).await;
    assert_eq!(entry.status, DownloadStatus::Complete);
    assert_eq!(fast.calls(), 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_late_snapshots_cannot_rewind_or_resurrect() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let adapter = Arc::new(ScriptedAdapter::new(BackendKind::YtDlp, AttemptResult::success()));
    let manager = DownloadManager::builder(fast_config(dir.path()))
        .backend(adapter as Arc<dyn BackendAdapter>)
        .resolver(Arc::new(OrderedResolver::new([BackendKind::YtDlp])))
        .store(store.clone())
        .build()
        .unwrap();
    manager.start();

    let done = manager
        .enqueue_with(EnqueueRequest::new("https://example.com/done"))
        .await
        .unwrap()
        .unwrap();
    let gone = manager
        .enqueue_with(EnqueueRequest::new("https://example.com/gone"))
        .await
        .unwrap()
        .unwrap();
    // snapshots as a slow writer would still hold them
    let early_done = store.get(done).unwrap();
    let early_gone = store.get(gone).unwrap();

    wait_for_entry(&manager, done, Duration::from_secs(10), |e| e.is_terminal()).await;
    wait_for_entry(&manager, gone, Duration::from_secs(10), |e| e.is_terminal()).await;
    assert!(manager.remove(gone).await.unwrap());
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while store.get(done).map(|e| e.status) != Some(DownloadStatus::Complete) {
        assert!(tokio::time::Instant::now() < deadline, "completion never stored");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    store.save(&early_done).await.unwrap();
    store.save(&early_gone).await.unwrap();

    let stored = store.get(done).unwrap();
    assert_eq!(stored.status, DownloadStatus::Complete);
    assert!(stored.revision > early_done.revision);
    assert!(store.get(gone).is_none());
    manager.shutdown().await;
}
