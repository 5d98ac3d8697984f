use chrono::{Duration, Utc};
use file_vault::storage::models::{
    Capability, FileKind, FileVersion, Include, Lifecycle, NewFile, ShareRecord,
};
use file_vault::storage::{Database, DatabaseError, DownloadOutcome, TreeRejection};
use uuid::Uuid;

fn test_db() -> (tempfile::TempDir, Database) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("data")).unwrap();
    (dir, db)
}

fn version_row(file_id: Uuid, number: u64, size: u64) -> FileVersion {
    FileVersion {
        id: Uuid::new_v4(),
        file_id,
        version_number: number,
        byte_size: size,
        content_hash: format!("hash-{number}"),
        storage_key: format!("u/versions/{file_id}/v{number}"),
        mime_type: Some("text/plain".to_string()),
        created_by: Uuid::new_v4(),
        created_at: Utc::now(),
    }
}

fn share_row(file_id: Uuid, token: &str) -> ShareRecord {
    ShareRecord {
        id: Uuid::new_v4(),
        file_id,
        created_by: Uuid::new_v4(),
        token: token.to_string(),
        password_hash: None,
        capability: Capability::Download,
        expires_at: None,
        max_downloads: None,
        download_count: 0,
        is_active: true,
        created_at: Utc::now(),
    }
}

#[test]
fn test_create_file_builds_paths() {
    let (_dir, db) = test_db();
    let owner = Uuid::new_v4();

    let docs = db
        .create_file(&NewFile::directory(owner, None, "docs"))
        .unwrap()
        .unwrap();
    let report = db
        .create_file(&NewFile::file(owner, Some(docs.id), "report.pdf"))
        .unwrap()
        .unwrap();

    assert_eq!(docs.path, "/docs");
    assert_eq!(report.path, "/docs/report.pdf");
    assert_eq!(report.kind, FileKind::File);
    assert_eq!(report.current_version, 0);
    assert!(report.lifecycle.is_active());

    let fetched = db.get_file(report.id).unwrap().unwrap();
    assert_eq!(fetched.parent_id, Some(docs.id));
    assert!(db.get_file(Uuid::new_v4()).unwrap().is_none());
}

#[test]
fn test_sibling_names_are_unique() {
    let (_dir, db) = test_db();
    let owner = Uuid::new_v4();

    db.create_file(&NewFile::file(owner, None, "a.txt"))
        .unwrap()
        .unwrap();
    let second = db.create_file(&NewFile::file(owner, None, "a.txt")).unwrap();
    assert_eq!(second.unwrap_err(), TreeRejection::NameTaken("a.txt".to_string()));

    // Another user's root is a different namespace
    db.create_file(&NewFile::file(Uuid::new_v4(), None, "a.txt"))
        .unwrap()
        .unwrap();
}

#[test]
fn test_invalid_names_rejected() {
    let (_dir, db) = test_db();
    let owner = Uuid::new_v4();

    for name in ["", ".", "..", "a/b", "a\\b"] {
        let outcome = db.create_file(&NewFile::file(owner, None, name)).unwrap();
        assert!(
            matches!(outcome, Err(TreeRejection::InvalidName(_))),
            "{name:?} should be rejected"
        );
    }
}

#[test]
fn test_parent_must_be_own_directory() {
    let (_dir, db) = test_db();
    let owner = Uuid::new_v4();

    let file = db
        .create_file(&NewFile::file(owner, None, "plain.txt"))
        .unwrap()
        .unwrap();
    let outcome = db
        .create_file(&NewFile::file(owner, Some(file.id), "child"))
        .unwrap();
    assert_eq!(outcome.unwrap_err(), TreeRejection::ParentNotDirectory(file.id));

    let dir = db
        .create_file(&NewFile::directory(owner, None, "shared"))
        .unwrap()
        .unwrap();
    let outcome = db
        .create_file(&NewFile::file(Uuid::new_v4(), Some(dir.id), "intruder"))
        .unwrap();
    assert_eq!(outcome.unwrap_err(), TreeRejection::OwnerMismatch);

    let missing = Uuid::new_v4();
    let outcome = db
        .create_file(&NewFile::file(owner, Some(missing), "orphan"))
        .unwrap();
    assert_eq!(outcome.unwrap_err(), TreeRejection::ParentNotFound(missing));
}

#[test]
fn test_list_children_sorted_and_filtered() {
    let (_dir, db) = test_db();
    let owner = Uuid::new_v4();

    for name in ["c", "a", "b"] {
        db.create_file(&NewFile::file(owner, None, name))
            .unwrap()
            .unwrap();
    }
    let b = db.find_child(owner, None, "b").unwrap().unwrap();
    db.tombstone_file(b.id).unwrap().unwrap();

    let names: Vec<String> = db
        .list_children(owner, None, Include::ActiveOnly)
        .unwrap()
        .into_iter()
        .map(|f| f.name)
        .collect();
    assert_eq!(names, vec!["a", "c"]);

    let all = db.list_children(owner, None, Include::WithTombstoned).unwrap();
    assert_eq!(all.len(), 3);
    assert!(db.find_child(owner, None, "b").unwrap().is_none());
}

#[test]
fn test_move_rejects_cycles() {
    let (_dir, db) = test_db();
    let owner = Uuid::new_v4();

    let a = db
        .create_file(&NewFile::directory(owner, None, "a"))
        .unwrap()
        .unwrap();
    let b = db
        .create_file(&NewFile::directory(owner, Some(a.id), "b"))
        .unwrap()
        .unwrap();
    let c = db
        .create_file(&NewFile::directory(owner, Some(b.id), "c"))
        .unwrap()
        .unwrap();

    assert_eq!(db.move_file(a.id, Some(a.id)).unwrap().unwrap_err(), TreeRejection::Cycle);
    assert_eq!(db.move_file(a.id, Some(c.id)).unwrap().unwrap_err(), TreeRejection::Cycle);

    // Nothing changed
    assert_eq!(db.get_file(a.id).unwrap().unwrap().parent_id, None);
}

#[test]
fn test_move_and_rename_repath_descendants() {
    let (_dir, db) = test_db();
    let owner = Uuid::new_v4();

    let projects = db
        .create_file(&NewFile::directory(owner, None, "projects"))
        .unwrap()
        .unwrap();
    let archive = db
        .create_file(&NewFile::directory(owner, None, "archive"))
        .unwrap()
        .unwrap();
    let notes = db
        .create_file(&NewFile::file(owner, Some(projects.id), "notes.md"))
        .unwrap()
        .unwrap();

    let moved = db.move_file(projects.id, Some(archive.id)).unwrap().unwrap();
    assert_eq!(moved.path, "/archive/projects");
    assert_eq!(db.get_file(notes.id).unwrap().unwrap().path, "/archive/projects/notes.md");

    db.rename_file(archive.id, "old").unwrap().unwrap();
    assert_eq!(db.get_file(notes.id).unwrap().unwrap().path, "/old/projects/notes.md");

    // The old name is free again
    db.create_file(&NewFile::directory(owner, None, "archive"))
        .unwrap()
        .unwrap();
}

#[test]
fn test_tombstone_and_restore_subtree() {
    let (_dir, db) = test_db();
    let owner = Uuid::new_v4();

    let dir = db
        .create_file(&NewFile::directory(owner, None, "photos"))
        .unwrap()
        .unwrap();
    let photo = db
        .create_file(&NewFile::file(owner, Some(dir.id), "cat.png"))
        .unwrap()
        .unwrap();

    let changed = db.tombstone_file(dir.id).unwrap().unwrap();
    assert_eq!(changed.len(), 2);
    assert!(matches!(
        db.get_file(photo.id).unwrap().unwrap().lifecycle,
        Lifecycle::Tombstoned { .. }
    ));

    // A tombstoned name can be reused, which then blocks the restore
    let replacement = db
        .create_file(&NewFile::directory(owner, None, "photos"))
        .unwrap()
        .unwrap();
    assert_eq!(
        db.restore_file(dir.id).unwrap().unwrap_err(),
        TreeRejection::NameTaken("photos".to_string())
    );

    db.tombstone_file(replacement.id).unwrap().unwrap();
    db.restore_file(dir.id).unwrap().unwrap();
    assert!(db.get_file(photo.id).unwrap().unwrap().lifecycle.is_active());

    assert_eq!(
        db.restore_file(dir.id).unwrap().unwrap_err(),
        TreeRejection::NotTombstoned(dir.id)
    );
}

#[test]
fn test_versions_are_gapless() {
    let (_dir, db) = test_db();
    let owner = Uuid::new_v4();
    let file = db
        .create_file(&NewFile::file(owner, None, "a.txt"))
        .unwrap()
        .unwrap();

    assert_eq!(db.next_version_number(file.id).unwrap(), 1);
    db.insert_version(&version_row(file.id, 1, 10)).unwrap();

    // Skipping or repeating a number is refused
    assert!(matches!(
        db.insert_version(&version_row(file.id, 3, 10)),
        Err(DatabaseError::Integrity(_))
    ));
    assert!(matches!(
        db.insert_version(&version_row(file.id, 1, 10)),
        Err(DatabaseError::Integrity(_))
    ));

    let updated = db
        .insert_version(&version_row(file.id, 2, 20))
        .unwrap()
        .unwrap();
    assert_eq!(updated.current_version, 2);
    assert_eq!(updated.byte_size, 20);
    assert_eq!(updated.content_hash.as_deref(), Some("hash-2"));

    let numbers: Vec<u64> = db
        .list_versions(file.id)
        .unwrap()
        .iter()
        .map(|v| v.version_number)
        .collect();
    assert_eq!(numbers, vec![1, 2]);
}

#[test]
fn test_removed_version_numbers_are_not_reused() {
    let (_dir, db) = test_db();
    let file_id = Uuid::new_v4();

    for n in 1..=3 {
        db.insert_version(&version_row(file_id, n, 5)).unwrap();
    }
    let removed = db.remove_versions(file_id, &[1, 2, 42]).unwrap();
    assert_eq!(removed.len(), 2);

    assert_eq!(db.next_version_number(file_id).unwrap(), 4);
    assert!(db.get_version(file_id, 1).unwrap().is_none());
    assert!(db.get_version(file_id, 3).unwrap().is_some());
}

#[test]
fn test_set_current_version() {
    let (_dir, db) = test_db();
    let owner = Uuid::new_v4();
    let file = db
        .create_file(&NewFile::file(owner, None, "a.txt"))
        .unwrap()
        .unwrap();
    db.insert_version(&version_row(file.id, 1, 10)).unwrap();
    db.insert_version(&version_row(file.id, 2, 20)).unwrap();

    let file = db.set_current_version(file.id, 1).unwrap().unwrap();
    assert_eq!(file.current_version, 1);
    assert_eq!(file.byte_size, 10);

    assert!(db.set_current_version(file.id, 9).unwrap().is_none());
    assert_eq!(db.get_file(file.id).unwrap().unwrap().current_version, 1);
}

#[test]
fn test_purge_removes_everything() {
    let (_dir, db) = test_db();
    let owner = Uuid::new_v4();

    let dir = db
        .create_file(&NewFile::directory(owner, None, "tmp"))
        .unwrap()
        .unwrap();
    let file = db
        .create_file(&NewFile::file(owner, Some(dir.id), "big.bin"))
        .unwrap()
        .unwrap();
    db.insert_version(&version_row(file.id, 1, 100)).unwrap();
    db.insert_version(&version_row(file.id, 2, 50)).unwrap();
    db.insert_share(&share_row(file.id, "tok-purge")).unwrap();

    let purged = db.purge_file(dir.id).unwrap().unwrap();
    assert_eq!(purged.files.len(), 2);
    assert_eq!(purged.versions.len(), 2);
    assert_eq!(purged.stored_bytes(), 150);

    assert!(db.get_file(file.id).unwrap().is_none());
    assert!(db.list_versions(file.id).unwrap().is_empty());
    assert!(db.get_share_by_token("tok-purge").unwrap().is_none());
    assert!(db.list_children(owner, None, Include::WithTombstoned).unwrap().is_empty());
    assert_eq!(db.next_version_number(file.id).unwrap(), 1);
}

#[test]
fn test_share_tokens_are_unique() {
    let (_dir, db) = test_db();
    let file_id = Uuid::new_v4();

    assert!(db.insert_share(&share_row(file_id, "same")).unwrap());
    assert!(!db.insert_share(&share_row(file_id, "same")).unwrap());
    assert_eq!(db.list_shares_for_file(file_id).unwrap().len(), 1);
}

#[test]
fn test_share_sets_file_token() {
    let (_dir, db) = test_db();
    let owner = Uuid::new_v4();
    let file = db
        .create_file(&NewFile::file(owner, None, "a.txt"))
        .unwrap()
        .unwrap();

    let share = share_row(file.id, "tok-file");
    db.insert_share(&share).unwrap();
    assert_eq!(
        db.get_file(file.id).unwrap().unwrap().share_token.as_deref(),
        Some("tok-file")
    );

    let revoked = db.deactivate_share(share.id).unwrap().unwrap();
    assert!(!revoked.is_active);
    assert!(db.get_file(file.id).unwrap().unwrap().share_token.is_none());
    assert!(db.deactivate_share(Uuid::new_v4()).unwrap().is_none());
}

#[test]
fn test_record_share_download_outcomes() {
    let (_dir, db) = test_db();
    let file_id = Uuid::new_v4();
    let now = Utc::now();

    let mut limited = share_row(file_id, "limited");
    limited.max_downloads = Some(1);
    db.insert_share(&limited).unwrap();

    match db.record_share_download(limited.id, now).unwrap() {
        DownloadOutcome::Recorded(share) => assert_eq!(share.download_count, 1),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(matches!(
        db.record_share_download(limited.id, now).unwrap(),
        DownloadOutcome::Exhausted
    ));

    let mut expiring = share_row(file_id, "expiring");
    expiring.expires_at = Some(now - Duration::seconds(1));
    db.insert_share(&expiring).unwrap();
    assert!(matches!(
        db.record_share_download(expiring.id, now).unwrap(),
        DownloadOutcome::Expired
    ));
    assert_eq!(db.get_share(expiring.id).unwrap().unwrap().download_count, 0);

    let revoked = share_row(file_id, "revoked");
    db.insert_share(&revoked).unwrap();
    db.deactivate_share(revoked.id).unwrap();
    assert!(matches!(
        db.record_share_download(revoked.id, now).unwrap(),
        DownloadOutcome::Revoked
    ));

    assert!(matches!(
        db.record_share_download(Uuid::new_v4(), now).unwrap(),
        DownloadOutcome::NotFound
    ));
}

#[test]
fn test_tombstone_deactivates_shares() {
    let (_dir, db) = test_db();
    let owner = Uuid::new_v4();
    let file = db
        .create_file(&NewFile::file(owner, None, "shared.txt"))
        .unwrap()
        .unwrap();
    let share = share_row(file.id, "tok-tomb");
    db.insert_share(&share).unwrap();

    db.tombstone_file(file.id).unwrap().unwrap();
    assert!(!db.get_share(share.id).unwrap().unwrap().is_active);

    // Restoring does not bring shares back
    db.restore_file(file.id).unwrap().unwrap();
    assert!(!db.get_share(share.id).unwrap().unwrap().is_active);
}

#[test]
fn test_quota_update_creates_and_persists() {
    let (dir, db) = test_db();
    let user = Uuid::new_v4();

    assert!(db.get_quota(user).unwrap().is_none());
    let state = db.update_quota(user, 1000, |q| q.consumed += 600).unwrap();
    assert_eq!(state.ceiling, 1000);
    assert_eq!(state.consumed, 600);

    // The ceiling argument only seeds a missing record
    let state = db.update_quota(user, 5, |q| q.consumed -= 100).unwrap();
    assert_eq!(state.ceiling, 1000);
    assert_eq!(state.consumed, 500);

    drop(db);
    let db = Database::open(dir.path().join("data")).unwrap();
    assert_eq!(db.get_quota(user).unwrap().unwrap().consumed, 500);
}
