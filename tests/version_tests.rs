use std::sync::Arc;

use bytes::Bytes;
use file_vault::keys;
use file_vault::object_store::{stream_from_bytes, Backend, LocalBackend, StorageBackend};
use file_vault::quota::QuotaTracker;
use file_vault::storage::models::{FileRecord, NewFile};
use file_vault::storage::Database;
use file_vault::versions::{NewVersion, PendingVersion, VersionManager};
use file_vault::{Error, Identity, OpContext};
use futures::TryStreamExt;
use uuid::Uuid;

struct Harness {
    _dir: tempfile::TempDir,
    db: Database,
    backend: Arc<Backend>,
    quota: Arc<QuotaTracker>,
    versions: Arc<VersionManager>,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("data")).unwrap();
    let store = LocalBackend::new(dir.path().join("blobs"), "http://localhost/files").unwrap();
    let backend = Arc::new(Backend::Local(store));
    let quota = Arc::new(QuotaTracker::new(db.clone(), 1_000_000));
    let versions = Arc::new(VersionManager::new(
        db.clone(),
        Arc::clone(&backend),
        Arc::clone(&quota),
    ));
    Harness {
        _dir: dir,
        db,
        backend,
        quota,
        versions,
    }
}

fn create_file(db: &Database, owner: Uuid, name: &str) -> FileRecord {
    db.create_file(&NewFile::file(owner, None, name))
        .unwrap()
        .unwrap()
}

/// Stage `content` under a temp key and commit it as the next version, charging quota
async fn upload(h: &Harness, file: &FileRecord, content: &'static str) -> u64 {
    let cx = OpContext::new();
    let owner = Identity::new(file.owner_id, 1_000_000);
    let reservation = h.quota.reserve(&owner, content.len() as u64).await.unwrap();

    let temp_key = keys::temp_key(file.owner_id, &file.name);
    h.backend
        .save(&cx, &temp_key, stream_from_bytes(content), None)
        .await
        .unwrap();
    let version = h
        .versions
        .commit_upload(
            &cx,
            PendingVersion {
                file_id: file.id,
                owner_id: file.owner_id,
                temp_key,
                mime_type: None,
                created_by: file.owner_id,
            },
        )
        .await
        .unwrap();
    h.quota.commit(reservation, version.byte_size).await.unwrap();
    version.version_number
}

async fn read_all(stream: file_vault::object_store::ByteStream) -> Vec<u8> {
    let chunks: Vec<Bytes> = stream.try_collect().await.unwrap();
    chunks.concat()
}

#[tokio::test]
async fn test_commit_upload_assigns_next_number() {
    let h = harness();
    let owner = Uuid::new_v4();
    let file = create_file(&h.db, owner, "notes.txt");

    assert_eq!(upload(&h, &file, "first").await, 1);
    assert_eq!(upload(&h, &file, "second").await, 2);

    let v2 = h.versions.get(file.id, 2).unwrap();
    assert_eq!(v2.storage_key, keys::version_key(owner, file.id, 2));
    assert_eq!(v2.byte_size, 6);
    assert_eq!(v2.mime_type.as_deref(), Some("text/plain"));

    let record = h.db.get_file(file.id).unwrap().unwrap();
    assert_eq!(record.current_version, 2);
    assert_eq!(record.content_hash.as_deref(), Some(v2.content_hash.as_str()));

    // Temp objects were moved, not copied
    let cx = OpContext::new();
    assert!(h.backend.list(&cx, &format!("{owner}/temp/")).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_uploads_get_distinct_numbers() {
    let h = Arc::new(harness());
    let owner = Uuid::new_v4();
    let file = create_file(&h.db, owner, "busy.log");

    let mut handles = Vec::new();
    for _ in 0..10 {
        let h = Arc::clone(&h);
        let file = file.clone();
        handles.push(tokio::spawn(async move { upload(&h, &file, "line").await }));
    }

    let mut numbers = Vec::new();
    for handle in handles {
        numbers.push(handle.await.unwrap());
    }
    numbers.sort_unstable();
    assert_eq!(numbers, (1..=10).collect::<Vec<u64>>());

    let listed: Vec<u64> = h
        .versions
        .list(file.id)
        .unwrap()
        .iter()
        .map(|v| v.version_number)
        .collect();
    assert_eq!(listed, (1..=10).collect::<Vec<u64>>());
    assert_eq!(h.quota.usage(owner).unwrap().consumed, 40);
}

#[tokio::test]
async fn test_missing_temp_object_records_nothing() {
    let h = harness();
    let owner = Uuid::new_v4();
    let file = create_file(&h.db, owner, "ghost.bin");

    let result = h
        .versions
        .commit_upload(
            &OpContext::new(),
            PendingVersion {
                file_id: file.id,
                owner_id: owner,
                temp_key: keys::temp_key(owner, "ghost.bin"),
                mime_type: None,
                created_by: owner,
            },
        )
        .await;
    assert!(matches!(result, Err(Error::NotFound(_))));
    assert!(h.versions.list(file.id).unwrap().is_empty());
    assert_eq!(h.db.next_version_number(file.id).unwrap(), 1);
}

#[tokio::test]
async fn test_record_version_for_stored_content() {
    let h = harness();
    let owner = Uuid::new_v4();
    let file = create_file(&h.db, owner, "external.dat");

    let recorded = h
        .versions
        .record_version(NewVersion {
            file_id: file.id,
            byte_size: 3,
            content_hash: "abc".to_string(),
            storage_key: keys::version_key(owner, file.id, 1),
            mime_type: Some("application/octet-stream".to_string()),
            created_by: owner,
        })
        .await
        .unwrap();
    assert_eq!(recorded.version_number, 1);
    assert_eq!(h.db.get_file(file.id).unwrap().unwrap().current_version, 1);
}

#[tokio::test]
async fn test_open_verifies_content() {
    let h = harness();
    let owner = Uuid::new_v4();
    let file = create_file(&h.db, owner, "contract.txt");
    upload(&h, &file, "signed").await;

    let opened = h.versions.open_current(&OpContext::new(), file.id).await.unwrap();
    assert_eq!(opened.version.version_number, 1);
    assert_eq!(read_all(opened.content).await, b"signed");
}

#[tokio::test]
async fn test_tampered_blob_is_corruption() {
    let h = harness();
    let owner = Uuid::new_v4();
    let file = create_file(&h.db, owner, "ledger.csv");
    upload(&h, &file, "a,b,c").await;
    upload(&h, &file, "d,e,f").await;

    let cx = OpContext::new();
    let key = keys::version_key(owner, file.id, 2);
    h.backend
        .save(&cx, &key, stream_from_bytes("x,y,z"), None)
        .await
        .unwrap();

    match h.versions.open(&cx, file.id, 2).await {
        Err(Error::Corruption { key: bad, expected, actual }) => {
            assert_eq!(bad, key);
            assert_ne!(expected, actual);
        }
        Err(e) => panic!("expected corruption, got {e}"),
        Ok(_) => panic!("expected corruption"),
    }

    // The other version is still readable
    let opened = h.versions.open(&cx, file.id, 1).await.unwrap();
    assert_eq!(read_all(opened.content).await, b"a,b,c");
}

#[tokio::test]
async fn test_open_without_content() {
    let h = harness();
    let owner = Uuid::new_v4();
    let file = create_file(&h.db, owner, "empty");

    assert!(matches!(
        h.versions.open_current(&OpContext::new(), file.id).await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        h.versions.open(&OpContext::new(), file.id, 1).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_rollback_moves_current_pointer() {
    let h = harness();
    let owner = Uuid::new_v4();
    let file = create_file(&h.db, owner, "draft.md");
    upload(&h, &file, "one").await;
    upload(&h, &file, "two!").await;

    let record = h.versions.rollback(file.id, 1).await.unwrap();
    assert_eq!(record.current_version, 1);
    assert_eq!(record.byte_size, 3);

    let opened = h.versions.open_current(&OpContext::new(), file.id).await.unwrap();
    assert_eq!(read_all(opened.content).await, b"one");

    // Rolling back does not rewind numbering
    assert_eq!(upload(&h, &file, "three").await, 3);

    assert!(matches!(
        h.versions.rollback(file.id, 9).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_prune_keeps_newest_and_current() {
    let h = harness();
    let owner = Uuid::new_v4();
    let file = create_file(&h.db, owner, "history.txt");
    for content in ["a", "bb", "ccc", "dddd"] {
        upload(&h, &file, content).await;
    }
    assert_eq!(h.quota.usage(owner).unwrap().consumed, 10);

    h.versions.rollback(file.id, 1).await.unwrap();
    let cx = OpContext::new();
    let pruned = h.versions.prune(&cx, file.id, 1).await.unwrap();

    let mut removed: Vec<u64> = pruned.removed.iter().map(|v| v.version_number).collect();
    removed.sort_unstable();
    assert_eq!(removed, vec![2, 3]);
    assert_eq!(pruned.released_bytes, 5);
    assert_eq!(h.quota.usage(owner).unwrap().consumed, 5);

    let kept: Vec<u64> = h
        .versions
        .list(file.id)
        .unwrap()
        .iter()
        .map(|v| v.version_number)
        .collect();
    assert_eq!(kept, vec![1, 4]);
    assert!(!h
        .backend
        .exists(&cx, &keys::version_key(owner, file.id, 2))
        .await
        .unwrap());

    // Numbers of pruned versions are never handed out again
    assert_eq!(upload(&h, &file, "eeeee").await, 5);

    // Nothing left to prune
    let pruned = h.versions.prune(&cx, file.id, 3).await.unwrap();
    assert!(pruned.removed.is_empty());
}
