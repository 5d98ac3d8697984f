use bytes::Bytes;
use file_vault::object_store::{
    stream_from_bytes, Backend, ByteStream, CompletedPart, LocalBackend, StorageBackend,
};
use file_vault::{Error, OpContext};
use futures::{StreamExt, TryStreamExt};

fn local_backend(dir: &tempfile::TempDir) -> Backend {
    let store = LocalBackend::new(dir.path(), "http://localhost:8080/files")
        .unwrap()
        .with_min_part_size(4);
    Backend::Local(store)
}

async fn read_all(stream: ByteStream) -> Vec<u8> {
    let chunks: Vec<Bytes> = stream.try_collect().await.unwrap();
    chunks.concat()
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(ring::digest::digest(&ring::digest::SHA256, data))
}

/// Staging entries left under the storage root
fn staging_leftovers(dir: &tempfile::TempDir) -> Vec<String> {
    match std::fs::read_dir(dir.path().join(".multipart")) {
        Ok(entries) => entries
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Yields one chunk, then never finishes
fn one_chunk_then_stall() -> ByteStream {
    let first = futures::stream::iter(vec![Ok(Bytes::from_static(b"partial"))]);
    Box::pin(first.chain(futures::stream::pending::<std::io::Result<Bytes>>()))
}

fn chunked(parts: &[&'static [u8]]) -> ByteStream {
    let chunks: Vec<std::io::Result<Bytes>> =
        parts.iter().map(|p| Ok(Bytes::from_static(p))).collect();
    Box::pin(futures::stream::iter(chunks))
}

#[tokio::test]
async fn test_local_save_get() {
    let dir = tempfile::tempdir().unwrap();
    let store = local_backend(&dir);
    let cx = OpContext::new();

    let put = store
        .save(&cx, "u/files/hello.txt", stream_from_bytes("hello world"), Some(11))
        .await
        .unwrap();
    assert_eq!(put.size, 11);
    assert_eq!(put.etag, sha256_hex(b"hello world"));

    let data = read_all(store.get(&cx, "u/files/hello.txt").await.unwrap()).await;
    assert_eq!(data, b"hello world");
}

#[tokio::test]
async fn test_local_save_streams_many_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let store = local_backend(&dir);
    let cx = OpContext::new();

    store
        .save(&cx, "u/files/big.bin", chunked(&[b"abc", b"def", b"", b"ghi"]), None)
        .await
        .unwrap();

    let info = store.stat(&cx, "u/files/big.bin").await.unwrap();
    assert_eq!(info.size, 9);
    let data = read_all(store.get(&cx, "u/files/big.bin").await.unwrap()).await;
    assert_eq!(data, b"abcdefghi");
}

#[tokio::test]
async fn test_local_stat() {
    let dir = tempfile::tempdir().unwrap();
    let store = local_backend(&dir);
    let cx = OpContext::new();

    let put = store
        .save(&cx, "u/files/doc.pdf", stream_from_bytes("%PDF-1.7"), None)
        .await
        .unwrap();
    let info = store.stat(&cx, "u/files/doc.pdf").await.unwrap();

    assert_eq!(info.key, "u/files/doc.pdf");
    assert_eq!(info.size, 8);
    assert!(!info.is_dir);
    assert_eq!(info.mime_type.as_deref(), Some("application/pdf"));
    assert_eq!(info.etag, Some(put.etag));
    assert!(info.last_modified.is_some());
}

#[tokio::test]
async fn test_local_exists() {
    let dir = tempfile::tempdir().unwrap();
    let store = local_backend(&dir);
    let cx = OpContext::new();

    assert!(!store.exists(&cx, "u/files/missing").await.unwrap());

    store
        .save(&cx, "u/files/present", stream_from_bytes("data"), None)
        .await
        .unwrap();
    assert!(store.exists(&cx, "u/files/present").await.unwrap());
}

#[tokio::test]
async fn test_local_delete() {
    let dir = tempfile::tempdir().unwrap();
    let store = local_backend(&dir);
    let cx = OpContext::new();

    store
        .save(&cx, "u/files/to-delete", stream_from_bytes("data"), None)
        .await
        .unwrap();
    store.delete(&cx, "u/files/to-delete").await.unwrap();
    assert!(!store.exists(&cx, "u/files/to-delete").await.unwrap());

    // Deleting a missing key is not an error
    store.delete(&cx, "u/files/to-delete").await.unwrap();
}

#[tokio::test]
async fn test_local_get_and_stat_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let store = local_backend(&dir);
    let cx = OpContext::new();

    assert!(matches!(
        store.get(&cx, "u/files/missing").await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        store.stat(&cx, "u/files/missing").await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_local_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    let store = local_backend(&dir);
    let cx = OpContext::new();

    store
        .save(&cx, "u/files/key", stream_from_bytes("first"), None)
        .await
        .unwrap();
    store
        .save(&cx, "u/files/key", stream_from_bytes("second"), None)
        .await
        .unwrap();

    let data = read_all(store.get(&cx, "u/files/key").await.unwrap()).await;
    assert_eq!(data, b"second");
}

#[tokio::test]
async fn test_local_size_mismatch_leaves_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let store = local_backend(&dir);
    let cx = OpContext::new();

    let result = store
        .save(&cx, "u/files/short", stream_from_bytes("abc"), Some(10))
        .await;
    assert!(matches!(result, Err(Error::UploadFailed { .. })));
    assert!(!store.exists(&cx, "u/files/short").await.unwrap());
}

#[tokio::test]
async fn test_unsafe_keys_rejected_before_io() {
    let dir = tempfile::tempdir().unwrap();
    let store = local_backend(&dir);
    let cx = OpContext::new();

    for key in [
        "../escape",
        "/etc/passwd",
        "u//files/x",
        "u/files/%2e%2e/%2e%2e/x",
        "u/./files",
        "",
    ] {
        let result = store.save(&cx, key, stream_from_bytes("x"), None).await;
        assert!(
            matches!(result, Err(Error::InvalidKey(_))),
            "{key:?} should be rejected"
        );
        assert!(matches!(store.get(&cx, key).await, Err(Error::InvalidKey(_))));
        assert!(matches!(store.delete(&cx, key).await, Err(Error::InvalidKey(_))));
    }
}

#[tokio::test]
async fn test_staging_area_is_reserved() {
    let dir = tempfile::tempdir().unwrap();
    let store = local_backend(&dir);
    let cx = OpContext::new();

    let result = store
        .save(&cx, ".multipart/x", stream_from_bytes("x"), None)
        .await;
    assert!(matches!(result, Err(Error::InvalidKey(_))));
}

#[tokio::test]
async fn test_local_copy_and_rename() {
    let dir = tempfile::tempdir().unwrap();
    let store = local_backend(&dir);
    let cx = OpContext::new();

    store
        .save(&cx, "u/temp/a", stream_from_bytes("payload"), None)
        .await
        .unwrap();

    store.copy(&cx, "u/temp/a", "u/files/b").await.unwrap();
    assert!(store.exists(&cx, "u/temp/a").await.unwrap());
    assert_eq!(
        read_all(store.get(&cx, "u/files/b").await.unwrap()).await,
        b"payload"
    );

    store.rename(&cx, "u/temp/a", "u/versions/f/v1").await.unwrap();
    assert!(!store.exists(&cx, "u/temp/a").await.unwrap());
    assert_eq!(
        read_all(store.get(&cx, "u/versions/f/v1").await.unwrap()).await,
        b"payload"
    );

    assert!(matches!(
        store.rename(&cx, "u/temp/a", "u/files/c").await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        store.copy(&cx, "u/temp/a", "u/files/c").await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_local_list_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let store = local_backend(&dir);
    let cx = OpContext::new();

    for key in ["u/files/b.txt", "u/files/a.txt", "u/files/sub/c.txt", "u/temp/d"] {
        store
            .save(&cx, key, stream_from_bytes("x"), None)
            .await
            .unwrap();
    }
    // An open multipart upload must not show up in listings
    store.create_multipart(&cx, "u/files/e.bin").await.unwrap();

    let keys: Vec<String> = store
        .list(&cx, "u/files/")
        .await
        .unwrap()
        .into_iter()
        .map(|info| info.key)
        .collect();
    assert_eq!(keys, vec!["u/files/a.txt", "u/files/b.txt", "u/files/sub/c.txt"]);

    let keys: Vec<String> = store
        .list(&cx, "u/files/a")
        .await
        .unwrap()
        .into_iter()
        .map(|info| info.key)
        .collect();
    assert_eq!(keys, vec!["u/files/a.txt"]);

    assert_eq!(store.list(&cx, "").await.unwrap().len(), 4);
    assert!(store.list(&cx, "nobody/").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_local_dirs() {
    let dir = tempfile::tempdir().unwrap();
    let store = local_backend(&dir);
    let cx = OpContext::new();

    store.create_dir(&cx, "u/files/photos").await.unwrap();
    let info = store.stat(&cx, "u/files/photos").await.unwrap();
    assert!(info.is_dir);
    assert!(info.etag.is_none());

    store
        .save(&cx, "u/files/photos/cat.png", stream_from_bytes("png"), None)
        .await
        .unwrap();
    store.delete_dir(&cx, "u/files/photos").await.unwrap();
    assert!(!store.exists(&cx, "u/files/photos/cat.png").await.unwrap());

    // Missing directories are fine
    store.delete_dir(&cx, "u/files/photos").await.unwrap();
}

#[tokio::test]
async fn test_local_urls() {
    let dir = tempfile::tempdir().unwrap();
    let store = local_backend(&dir);
    let cx = OpContext::new();

    assert_eq!(
        store.url(&cx, "u/files/my file.txt").await.unwrap(),
        "http://localhost:8080/files/u/files/my%20file.txt"
    );
    assert_eq!(
        store
            .download_url(&cx, "u/files/a.txt", "report final.txt")
            .await
            .unwrap(),
        "http://localhost:8080/files/u/files/a.txt?download=report%20final.txt"
    );
}

#[tokio::test]
async fn test_local_multipart_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let store = local_backend(&dir);
    let cx = OpContext::new();
    let key = "u/files/video.mp4";

    let upload_id = store.create_multipart(&cx, key).await.unwrap();

    // Out of order
    let p2 = store
        .upload_part(&cx, key, &upload_id, 2, stream_from_bytes("5678"))
        .await
        .unwrap();
    let p1 = store
        .upload_part(&cx, key, &upload_id, 1, stream_from_bytes("1234"))
        .await
        .unwrap();
    let p3 = store
        .upload_part(&cx, key, &upload_id, 3, stream_from_bytes("9"))
        .await
        .unwrap();
    assert_eq!(p1.size, 4);

    let parts: Vec<CompletedPart> = [&p1, &p2, &p3].into_iter().map(CompletedPart::from).collect();
    let put = store
        .complete_multipart(&cx, key, &upload_id, &parts)
        .await
        .unwrap();
    assert_eq!(put.size, 9);

    let data = read_all(store.get(&cx, key).await.unwrap()).await;
    assert_eq!(data, b"123456789");
    assert_eq!(store.stat(&cx, key).await.unwrap().etag, Some(put.etag));

    // Completed uploads are gone; aborting them again is harmless
    store.abort_multipart(&cx, key, &upload_id).await.unwrap();
    assert!(matches!(
        store
            .upload_part(&cx, key, &upload_id, 4, stream_from_bytes("x"))
            .await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_local_multipart_part_retry_replaces() {
    let dir = tempfile::tempdir().unwrap();
    let store = local_backend(&dir);
    let cx = OpContext::new();
    let key = "u/files/retry.bin";

    let upload_id = store.create_multipart(&cx, key).await.unwrap();
    store
        .upload_part(&cx, key, &upload_id, 1, stream_from_bytes("bad!"))
        .await
        .unwrap();
    let p1 = store
        .upload_part(&cx, key, &upload_id, 1, stream_from_bytes("good"))
        .await
        .unwrap();

    store
        .complete_multipart(&cx, key, &upload_id, &[CompletedPart::from(&p1)])
        .await
        .unwrap();
    assert_eq!(read_all(store.get(&cx, key).await.unwrap()).await, b"good");
}

#[tokio::test]
async fn test_local_multipart_rejects_small_and_mismatched_parts() {
    let dir = tempfile::tempdir().unwrap();
    let store = local_backend(&dir);
    let cx = OpContext::new();
    let key = "u/files/small.bin";

    let upload_id = store.create_multipart(&cx, key).await.unwrap();
    let p1 = store
        .upload_part(&cx, key, &upload_id, 1, stream_from_bytes("ab"))
        .await
        .unwrap();
    let p2 = store
        .upload_part(&cx, key, &upload_id, 2, stream_from_bytes("cd"))
        .await
        .unwrap();

    // Part 1 is below the 4-byte minimum and is not the last part
    let parts = vec![CompletedPart::from(&p1), CompletedPart::from(&p2)];
    assert!(matches!(
        store.complete_multipart(&cx, key, &upload_id, &parts).await,
        Err(Error::UploadFailed { .. })
    ));

    let forged = vec![CompletedPart {
        part_number: 2,
        etag: "0".repeat(64),
    }];
    assert!(matches!(
        store.complete_multipart(&cx, key, &upload_id, &forged).await,
        Err(Error::UploadFailed { .. })
    ));
    assert!(!store.exists(&cx, key).await.unwrap());

    // A single small part is fine since it is also the last
    store
        .complete_multipart(&cx, key, &upload_id, &[CompletedPart::from(&p2)])
        .await
        .unwrap();
    assert_eq!(read_all(store.get(&cx, key).await.unwrap()).await, b"cd");
}

#[tokio::test]
async fn test_local_multipart_abort() {
    let dir = tempfile::tempdir().unwrap();
    let store = local_backend(&dir);
    let cx = OpContext::new();
    let key = "u/files/aborted.bin";

    let upload_id = store.create_multipart(&cx, key).await.unwrap();
    store
        .upload_part(&cx, key, &upload_id, 1, stream_from_bytes("data"))
        .await
        .unwrap();

    store.abort_multipart(&cx, key, &upload_id).await.unwrap();
    store.abort_multipart(&cx, key, &upload_id).await.unwrap();
    store.abort_multipart(&cx, key, "not-an-upload-id").await.unwrap();

    assert!(!dir.path().join(".multipart").join(&upload_id).exists());
}

#[tokio::test]
async fn test_cancelled_context_stops_calls() {
    let dir = tempfile::tempdir().unwrap();
    let store = local_backend(&dir);
    let cx = OpContext::new();
    cx.cancel();

    let result = store
        .save(&cx, "u/files/x", stream_from_bytes("x"), None)
        .await;
    assert!(matches!(result, Err(Error::Cancelled { .. })));
    assert!(!store.exists(&OpContext::new(), "u/files/x").await.unwrap());
}

#[tokio::test]
async fn test_stalled_stream_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let store = local_backend(&dir);
    let cx = OpContext::new().with_timeout(std::time::Duration::from_millis(50));

    let stalled: ByteStream = Box::pin(futures::stream::pending());
    let result = store.save(&cx, "u/files/stalled", stalled, None).await;
    assert!(matches!(result, Err(Error::TimedOut { .. })));
    assert!(staging_leftovers(&dir).is_empty());
}

#[tokio::test]
async fn test_cancelled_save_removes_staging_file() {
    let dir = tempfile::tempdir().unwrap();
    let store = local_backend(&dir);
    let cx = OpContext::new();

    let canceller = cx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let result = store
        .save(&cx, "u/files/interrupted.bin", one_chunk_then_stall(), None)
        .await;
    assert!(matches!(result, Err(Error::Cancelled { .. })));
    assert!(staging_leftovers(&dir).is_empty());
    assert!(!store
        .exists(&OpContext::new(), "u/files/interrupted.bin")
        .await
        .unwrap());
}

#[tokio::test]
async fn test_dropped_save_removes_staging_file() {
    let dir = tempfile::tempdir().unwrap();
    let store = local_backend(&dir);
    let cx = OpContext::new();

    // The caller gives up and drops the future without cancelling the context
    let outcome = tokio::time::timeout(
        std::time::Duration::from_millis(100),
        store.save(&cx, "u/files/abandoned.bin", one_chunk_then_stall(), None),
    )
    .await;
    assert!(outcome.is_err());
    assert!(staging_leftovers(&dir).is_empty());
}

#[tokio::test]
async fn test_cancelled_part_removes_staged_part() {
    let dir = tempfile::tempdir().unwrap();
    let store = local_backend(&dir);
    let upload_id = store
        .create_multipart(&OpContext::new(), "u/files/parts.bin")
        .await
        .unwrap();

    let cx = OpContext::new().with_timeout(std::time::Duration::from_millis(100));
    let result = store
        .upload_part(&cx, "u/files/parts.bin", &upload_id, 1, one_chunk_then_stall())
        .await;
    assert!(matches!(result, Err(Error::TimedOut { .. })));

    // Only the target marker remains in the upload's directory
    let remaining: Vec<String> = std::fs::read_dir(dir.path().join(".multipart").join(&upload_id))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(remaining, vec!["target".to_string()]);
}
