mod common;

use common::*;
use nazr_faces::error::FaceError;
use nazr_faces::models::face::{ImageId, InvalidationPolicy};
use nazr_faces::store::{EmbeddingStore, ReconcileOptions};

fn id(name: &str) -> ImageId {
    ImageId::from(name)
}

#[test]
fn test_first_reconcile_encodes_every_image() {
    let lib = TestLibrary::new();
    write_face(&lib.photo("alice.png"), ALICE);
    write_face(&lib.photo("bob.png"), BOB);
    write_face(&lib.photo("empty.png"), NOBODY);
    write_pair(&lib.photo("group.png"), ALICE_AGAIN, BOB_AGAIN);
    std::fs::write(lib.photo("notes.txt"), "not a photo").unwrap();

    let encoder = FakeEncoder::new();
    let mut store = lib.open_store();
    let report = store.reconcile(&lib.library, &encoder, &options()).unwrap();

    assert_eq!(report.scanned, 4);
    assert_eq!(report.encoded, 4);
    assert_eq!(report.faces_found, 4);
    assert!(report.persisted);
    assert_eq!(store.len(), 4);
    assert_eq!(store.get(&id("group.png")).unwrap().faces.len(), 2);
    assert!(!store.get(&id("empty.png")).unwrap().has_faces());
    assert!(!store.contains(&id("notes.txt")));
    assert_eq!(store.dimension(), Some(3));
    assert_eq!(encoder.detections(), 4);
}

#[test]
fn test_second_reconcile_writes_nothing() {
    let lib = TestLibrary::new();
    write_face(&lib.photo("alice.png"), ALICE);
    write_face(&lib.photo("bob.png"), BOB);

    let encoder = FakeEncoder::new();
    {
        let mut store = lib.open_store();
        store.reconcile(&lib.library, &encoder, &options()).unwrap();
    }
    let before = std::fs::read(&lib.store_path).unwrap();

    let mut store = lib.open_store();
    let report = store.reconcile(&lib.library, &encoder, &options()).unwrap();
    assert_eq!(report.encoded, 0);
    assert!(!report.persisted);
    assert_eq!(encoder.decodes(), 2);
    drop(store);

    let after = std::fs::read(&lib.store_path).unwrap();
    assert_eq!(before, after);
}

#[test]
fn test_only_new_images_are_encoded() {
    let lib = TestLibrary::new();
    write_face(&lib.photo("alice.png"), ALICE);
    let encoder = FakeEncoder::new();
    let mut store = lib.open_store();
    store.reconcile(&lib.library, &encoder, &options()).unwrap();

    write_face(&lib.photo("bob.png"), BOB);
    let report = store.reconcile(&lib.library, &encoder, &options()).unwrap();
    assert_eq!(report.scanned, 2);
    assert_eq!(report.encoded, 1);
    assert_eq!(encoder.decodes(), 2);
    assert!(store.contains(&id("bob.png")));
}

#[test]
fn test_records_survive_reopen() {
    let lib = TestLibrary::new();
    write_pair(&lib.photo("group.png"), ALICE, CAROL);
    write_face(&lib.photo("empty.png"), NOBODY);

    let encoder = FakeEncoder::new();
    let original = {
        let mut store = lib.open_store();
        store.reconcile(&lib.library, &encoder, &options()).unwrap();
        store.records().clone()
    };

    let reopened = lib.open_store();
    assert_eq!(reopened.records(), &original);
    assert_eq!(reopened.face_count(), 2);
}

#[test]
fn test_empty_library_creates_no_store_file() {
    let lib = TestLibrary::new();
    let encoder = FakeEncoder::new();
    let mut store = lib.open_store();
    let report = store.reconcile(&lib.library, &encoder, &options()).unwrap();
    assert_eq!(report.scanned, 0);
    assert!(!report.persisted);
    assert!(store.is_empty());
    assert!(!lib.store_path.exists());
}

#[test]
fn test_missing_library_is_an_error() {
    let lib = TestLibrary::new();
    let encoder = FakeEncoder::new();
    let mut store = lib.open_store();
    assert!(store.reconcile(&lib.library.join("nope"), &encoder, &options()).is_err());
}

#[test]
fn test_corrupt_store_is_moved_aside() {
    let lib = TestLibrary::new();
    write_face(&lib.photo("alice.png"), ALICE);
    std::fs::create_dir_all(lib.store_path.parent().unwrap()).unwrap();
    std::fs::write(&lib.store_path, vec![0x42u8; 4096]).unwrap();

    let mut store = lib.open_store();
    assert!(store.is_empty());
    let moved: Vec<String> = std::fs::read_dir(lib.store_path.parent().unwrap())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.contains(".corrupt-"))
        .collect();
    assert_eq!(moved.len(), 1);

    let encoder = FakeEncoder::new();
    let report = store.reconcile(&lib.library, &encoder, &options()).unwrap();
    assert_eq!(report.encoded, 1);
    drop(store);
    assert_eq!(lib.open_store().len(), 1);
}

#[test]
fn test_undecodable_image_is_quarantined() {
    let lib = TestLibrary::new();
    write_face(&lib.photo("alice.png"), ALICE);
    write_garbage(&lib.photo("broken.jpg"));

    let encoder = FakeEncoder::new();
    let opts = ReconcileOptions { max_decode_attempts: 3, ..options() };
    let mut store = lib.open_store();

    for attempt in 1..=3u32 {
        let report = store.reconcile(&lib.library, &encoder, &opts).unwrap();
        assert_eq!(report.decode_failures, 1);
        assert_eq!(store.failures()[&id("broken.jpg")].attempts, attempt);
    }
    assert!(!store.contains(&id("broken.jpg")));
    assert_eq!(store.quarantined(3).len(), 1);

    let decodes = encoder.decodes();
    let report = store.reconcile(&lib.library, &encoder, &opts).unwrap();
    assert_eq!(report.quarantined, 1);
    assert_eq!(report.decode_failures, 0);
    assert!(!report.persisted);
    assert_eq!(encoder.decodes(), decodes);

    // Replacing the file gives it a fresh start.
    write_face(&lib.photo("broken.jpg"), BOB);
    set_mtime(&lib.photo("broken.jpg"), 1_700_000_000);
    let report = store.reconcile(&lib.library, &encoder, &opts).unwrap();
    assert_eq!(report.encoded, 1);
    assert!(store.contains(&id("broken.jpg")));
    assert!(store.failures().is_empty());
}

#[test]
fn test_failures_persist_across_reopen() {
    let lib = TestLibrary::new();
    write_garbage(&lib.photo("broken.png"));
    let encoder = FakeEncoder::new();
    {
        let mut store = lib.open_store();
        store.reconcile(&lib.library, &encoder, &options()).unwrap();
    }
    let store = lib.open_store();
    assert_eq!(store.failures()[&id("broken.png")].attempts, 1);
    assert!(store.is_empty());
}

#[test]
fn test_never_policy_keeps_cached_record() {
    let lib = TestLibrary::new();
    let path = lib.photo("alice.png");
    write_face(&path, ALICE);
    set_mtime(&path, 1_600_000_000);
    let encoder = FakeEncoder::new();
    let mut store = lib.open_store();
    store.reconcile(&lib.library, &encoder, &options()).unwrap();

    write_face(&path, CAROL);
    set_mtime(&path, 1_700_000_000);
    let report = store.reconcile(&lib.library, &encoder, &options()).unwrap();
    assert_eq!(report.reencoded, 0);
    let kept = store.get(&id("alice.png")).unwrap();
    assert_eq!(kept.faces[0].embedding.as_slice(), &[0.5, 0.0, 0.0]);
}

#[test]
fn test_on_change_policy() {
    let lib = TestLibrary::new();
    let path = lib.photo("alice.png");
    write_face(&path, ALICE);
    set_mtime(&path, 1_600_000_000);
    let encoder = FakeEncoder::new();
    let opts = ReconcileOptions { invalidation: InvalidationPolicy::OnChange, ..options() };
    let mut store = lib.open_store();
    store.reconcile(&lib.library, &encoder, &opts).unwrap();
    assert_eq!(encoder.decodes(), 1);

    // Touched only: the hash matches, so no decode.
    set_mtime(&path, 1_650_000_000);
    let report = store.reconcile(&lib.library, &encoder, &opts).unwrap();
    assert_eq!(report.refreshed, 1);
    assert_eq!(report.reencoded, 0);
    assert_eq!(encoder.decodes(), 1);
    assert_eq!(store.get(&id("alice.png")).unwrap().fingerprint.mtime_ns, 1_650_000_000 * 1_000_000_000);

    // Nothing moved since the refresh.
    let report = store.reconcile(&lib.library, &encoder, &opts).unwrap();
    assert_eq!(report.refreshed, 0);
    assert!(!report.persisted);

    write_face(&path, CAROL);
    set_mtime(&path, 1_700_000_000);
    let report = store.reconcile(&lib.library, &encoder, &opts).unwrap();
    assert_eq!(report.reencoded, 1);
    assert_eq!(encoder.decodes(), 2);
    assert_eq!(store.get(&id("alice.png")).unwrap().faces[0].embedding.as_slice(), &[0.0, 0.0, 0.9]);
}

#[test]
fn test_prune_missing() {
    let lib = TestLibrary::new();
    write_face(&lib.photo("alice.png"), ALICE);
    write_face(&lib.photo("bob.png"), BOB);
    let encoder = FakeEncoder::new();
    let mut store = lib.open_store();
    store.reconcile(&lib.library, &encoder, &options()).unwrap();

    std::fs::remove_file(lib.photo("bob.png")).unwrap();
    let report = store.reconcile(&lib.library, &encoder, &options()).unwrap();
    assert_eq!(report.pruned, 0);
    assert!(store.contains(&id("bob.png")));

    let opts = ReconcileOptions { prune_missing: true, ..options() };
    let report = store.reconcile(&lib.library, &encoder, &opts).unwrap();
    assert_eq!(report.pruned, 1);
    assert!(!store.contains(&id("bob.png")));
    drop(store);
    assert!(!lib.open_store().contains(&id("bob.png")));
}

#[test]
fn test_dimension_mismatch_aborts_reconcile() {
    let lib = TestLibrary::new();
    write_face(&lib.photo("alice.png"), ALICE);
    let mut store = lib.open_store();
    store.reconcile(&lib.library, &FakeEncoder::new(), &options()).unwrap();

    write_face(&lib.photo("bob.png"), BOB);
    let err = store.reconcile(&lib.library, &FakeEncoder::with_dim(5), &options()).unwrap_err();
    assert!(matches!(err, FaceError::DimensionMismatch { expected: 3, actual: 5 }));
    assert!(!store.contains(&id("bob.png")));
    drop(store);
    let reopened = lib.open_store();
    assert_eq!(reopened.len(), 1);
    assert!(!reopened.contains(&id("bob.png")));
}

#[test]
fn test_invalidate_and_clear() {
    let lib = TestLibrary::new();
    write_face(&lib.photo("alice.png"), ALICE);
    write_face(&lib.photo("bob.png"), BOB);
    let encoder = FakeEncoder::new();
    let mut store = lib.open_store();
    store.reconcile(&lib.library, &encoder, &options()).unwrap();

    assert!(store.invalidate(&id("alice.png")).unwrap());
    assert!(!store.invalidate(&id("alice.png")).unwrap());
    let report = store.reconcile(&lib.library, &encoder, &options()).unwrap();
    assert_eq!(report.encoded, 1);
    assert_eq!(encoder.decodes(), 3);

    assert_eq!(store.clear().unwrap(), 2);
    assert!(store.is_empty());
    drop(store);
    assert!(lib.open_store().is_empty());
}

#[test]
fn test_two_handles_share_one_file() {
    let lib = TestLibrary::new();
    write_face(&lib.photo("alice.png"), ALICE);
    let encoder = FakeEncoder::new();

    let mut first = lib.open_store();
    first.reconcile(&lib.library, &encoder, &options()).unwrap();

    let mut second = EmbeddingStore::open(&lib.store_path).unwrap();
    write_face(&lib.photo("bob.png"), BOB);
    second.reconcile(&lib.library, &encoder, &options()).unwrap();

    // The first handle picks up the second's record under the write lock
    // instead of encoding bob again.
    let report = first.reconcile(&lib.library, &encoder, &options()).unwrap();
    assert_eq!(report.encoded, 0);
    assert_eq!(first.len(), 2);
    assert_eq!(encoder.decodes(), 2);
}
