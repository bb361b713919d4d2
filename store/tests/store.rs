//! End-to-end store scenarios against a scratch directory.

use std::path::{Path, PathBuf};

use hbackup_io::HashAlgo;
use hbackup_store::{
    CompressionCase, ContentId, Error, MissingList, Store, WriteStatus,
};
use hex_literal::hex;
use pretty_assertions::assert_eq;
use rstest::rstest;
use tokio::fs;

/// The classic MD5 collision pair: byte-distinct 128-byte blocks with the
/// same digest.
const COLLIDING_A: [u8; 128] = hex!(
    "d131dd02c5e6eec4693d9a0698aff95c"
    "2fcab58712467eab4004583eb8fb7f89"
    "55ad340609f4b30283e488832571415a"
    "085125e8f7cdc99fd91dbdf280373c5b"
    "d8823e3156348f5bae6dacd436c919c6"
    "dd53e2b487da03fd02396306d248cda0"
    "e99f33420f577ee8ce54b67080a80d1e"
    "c69821bcb6a8839396f9652b6ff72a70"
);
const COLLIDING_B: [u8; 128] = hex!(
    "d131dd02c5e6eec4693d9a0698aff95c"
    "2fcab50712467eab4004583eb8fb7f89"
    "55ad340609f4b30283e4888325f1415a"
    "085125e8f7cdc99fd91dbd7280373c5b"
    "d8823e3156348f5bae6dacd436c919c6"
    "dd53e23487da03fd02396306d248cda0"
    "e99f33420f577ee8ce54b67080280d1e"
    "c69821bcb6a8839396f965ab6ff72a70"
);

fn hash_hex(algo: HashAlgo, data: &[u8]) -> String {
    let mut hasher = algo.hasher();
    hasher.update(data);
    hasher.finalize_hex()
}

fn md5_hex(data: &[u8]) -> String {
    hash_hex(HashAlgo::Md5, data)
}

fn compressible(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 31) as u8).collect()
}

fn noise(len: usize) -> Vec<u8> {
    let mut state = 0x9e3779b97f4a7c15u64;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 24) as u8
        })
        .collect()
}

async fn new_store(dir: &Path) -> Store {
    Store::open(dir.join("db"), HashAlgo::Md5, true)
        .await
        .unwrap()
}

async fn source(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, data).await.unwrap();
    path
}

#[rstest]
#[case::md5(HashAlgo::Md5)]
#[case::sha1(HashAlgo::Sha1)]
#[case::sha256(HashAlgo::Sha256)]
#[tokio::test]
async fn round_trip_compressible_file(#[case] algo: HashAlgo) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().join("db"), algo, true).await.unwrap();
    let data = compressible(1 << 20);
    let path = source(dir.path(), "input", &data).await;

    let outcome = store
        .write(&path, 5, CompressionCase::AutoNow)
        .await
        .unwrap();
    assert_eq!(outcome.status, WriteStatus::Add);
    assert_eq!(
        outcome.id.to_string(),
        format!("{}-0", hash_hex(algo, &data))
    );
    assert_eq!(outcome.level, 5);

    let (payload, extension) = store.name(&outcome.id).await.unwrap();
    assert_eq!(extension, ".gz");
    assert!(payload.ends_with("data"));
    assert!(fs::try_exists(payload.with_extension("gz")).await.unwrap());

    let target = dir.path().join("restored");
    store.read(&target, &outcome.id).await.unwrap();
    assert_eq!(fs::read(&target).await.unwrap(), data);
}

#[tokio::test]
async fn round_trip_incompressible_file() {
    let dir = tempfile::tempdir().unwrap();
    let store = new_store(dir.path()).await;
    let data = noise(1 << 20);
    let path = source(dir.path(), "input", &data).await;

    let outcome = store
        .write(&path, 5, CompressionCase::AutoNow)
        .await
        .unwrap();
    assert_eq!(outcome.status, WriteStatus::Add);
    // noise does not deflate, so the raw representation wins
    assert_eq!(outcome.level, 0);
    let (_, extension) = store.name(&outcome.id).await.unwrap();
    assert_eq!(extension, "");

    let target = dir.path().join("restored");
    store.read(&target, &outcome.id).await.unwrap();
    assert_eq!(fs::read(&target).await.unwrap(), data);
}

#[tokio::test]
async fn rewriting_identical_content_leaves() {
    let dir = tempfile::tempdir().unwrap();
    let store = new_store(dir.path()).await;
    let data = compressible(200_000);
    let path = source(dir.path(), "input", &data).await;

    let first = store
        .write(&path, 5, CompressionCase::AutoNow)
        .await
        .unwrap();
    assert_eq!(first.status, WriteStatus::Add);

    let second = store
        .write(&path, 5, CompressionCase::AutoNow)
        .await
        .unwrap();
    assert_eq!(second.status, WriteStatus::Leave);
    assert_eq!(second.id, first.id);
    assert_eq!(second.store_path, first.store_path);

    // staging area is clean again
    let mut tmp = fs::read_dir(store.root().join("tmp")).await.unwrap();
    assert!(tmp.next_entry().await.unwrap().is_none());
}

#[tokio::test]
async fn colliding_digests_get_dense_indices() {
    assert_eq!(md5_hex(&COLLIDING_A), md5_hex(&COLLIDING_B));
    assert_ne!(COLLIDING_A, COLLIDING_B);

    let dir = tempfile::tempdir().unwrap();
    let store = new_store(dir.path()).await;
    let digest = md5_hex(&COLLIDING_A);
    let path_a = source(dir.path(), "a", &COLLIDING_A).await;
    let path_b = source(dir.path(), "b", &COLLIDING_B).await;

    let a = store
        .write(&path_a, 5, CompressionCase::ForcedNo)
        .await
        .unwrap();
    assert_eq!(a.id.to_string(), format!("{}-0", digest));

    let b = store
        .write(&path_b, 5, CompressionCase::ForcedNo)
        .await
        .unwrap();
    assert_eq!(b.status, WriteStatus::Add);
    assert_eq!(b.id.to_string(), format!("{}-1", digest));

    let out_a = dir.path().join("out_a");
    let out_b = dir.path().join("out_b");
    store.read(&out_a, &a.id).await.unwrap();
    store.read(&out_b, &b.id).await.unwrap();
    assert_eq!(fs::read(&out_a).await.unwrap(), COLLIDING_A);
    assert_eq!(fs::read(&out_b).await.unwrap(), COLLIDING_B);
}

#[tokio::test]
async fn corruption_is_reported_then_repaired() {
    let dir = tempfile::tempdir().unwrap();
    let store = new_store(dir.path()).await;
    let data = noise(50_000);
    let path = source(dir.path(), "input", &data).await;

    let outcome = store
        .write(&path, 0, CompressionCase::ForcedNo)
        .await
        .unwrap();
    let (payload, _) = store.name(&outcome.id).await.unwrap();

    // flip one stored byte
    let mut stored = fs::read(&payload).await.unwrap();
    stored[1000] ^= 0x01;
    fs::write(&payload, &stored).await.unwrap();

    // observe-only: the failure creates the quarantine marker
    let err = store.check(&outcome.id, true, false).await.unwrap_err();
    assert!(matches!(err, Error::Corrupted(_)));
    let marker = payload.parent().unwrap().join("corrupted");
    assert!(fs::try_exists(&marker).await.unwrap());

    // second check fails up front on the marker and keeps it
    let err = store.check(&outcome.id, true, false).await.unwrap_err();
    assert!(matches!(err, Error::Corrupted(_)));
    assert!(fs::try_exists(&marker).await.unwrap());

    // repair deletes the entry
    let err = store.check(&outcome.id, true, true).await.unwrap_err();
    assert!(matches!(err, Error::Corrupted(_)));
    assert!(matches!(
        store.name(&outcome.id).await.unwrap_err(),
        Error::NotFound(_)
    ));
}

#[tokio::test]
async fn crawl_census_reports_valid_and_broken() {
    let dir = tempfile::tempdir().unwrap();
    let store = new_store(dir.path()).await;

    let mut ids = Vec::new();
    for i in 0..5u8 {
        let data: Vec<u8> = (0..10_000).map(|j| (j % (11 + i as usize)) as u8).collect();
        let path = source(dir.path(), &format!("input{}", i), &data).await;
        let outcome = store
            .write(&path, 0, CompressionCase::ForcedNo)
            .await
            .unwrap();
        ids.push(outcome.id);
    }

    // sabotage: delete one meta, damage one payload, quarantine one entry
    let (payload0, _) = store.name(&ids[0]).await.unwrap();
    fs::remove_file(payload0.parent().unwrap().join("meta"))
        .await
        .unwrap();
    let (payload1, _) = store.name(&ids[1]).await.unwrap();
    let mut stored = fs::read(&payload1).await.unwrap();
    stored[0] ^= 0xff;
    fs::write(&payload1, &stored).await.unwrap();
    let (payload2, _) = store.name(&ids[2]).await.unwrap();
    fs::write(payload2.parent().unwrap().join("corrupted"), b"")
        .await
        .unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::channel(16);
    let stats = store.crawl(true, false, Some(tx)).await.unwrap();
    assert_eq!((stats.valid, stats.broken), (3, 2));

    let mut collected = Vec::new();
    while let Some(entry) = rx.recv().await {
        assert_eq!(entry.data_size, 10_000);
        assert_eq!(entry.file_size, 10_000);
        collected.push(entry.id);
    }
    collected.sort_by_key(|id| id.to_string());
    let mut expected = vec![ids[0].clone(), ids[3].clone(), ids[4].clone()];
    expected.sort_by_key(|id| id.to_string());
    assert_eq!(collected, expected);

    // the deleted meta got rebuilt along the way
    assert!(
        fs::try_exists(payload0.parent().unwrap().join("meta"))
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn crawl_with_repair_converges() {
    let dir = tempfile::tempdir().unwrap();
    let store = new_store(dir.path()).await;

    for i in 0..3u8 {
        let data = vec![i; 5_000];
        let path = source(dir.path(), &format!("input{}", i), &data).await;
        store
            .write(&path, 5, CompressionCase::AutoNow)
            .await
            .unwrap();
    }
    // damage one entry
    let digest = md5_hex(&vec![1u8; 5_000]);
    let id: ContentId = format!("{}-0", digest).parse().unwrap();
    let (payload, _) = store.name(&id).await.unwrap();
    let real = if fs::try_exists(&payload).await.unwrap() {
        payload
    } else {
        payload.with_extension("gz")
    };
    fs::write(&real, b"garbage that is not gzip").await.unwrap();

    let stats = store.crawl(true, true, None).await.unwrap();
    assert_eq!((stats.valid, stats.broken), (2, 1));

    let stats = store.crawl(true, true, None).await.unwrap();
    assert_eq!((stats.valid, stats.broken), (2, 0));
}

#[tokio::test]
async fn forced_and_deferred_compression_cases() {
    let dir = tempfile::tempdir().unwrap();
    let store = new_store(dir.path()).await;
    let data = compressible(50_000);

    let path = source(dir.path(), "yes", &data).await;
    let yes = store
        .write(&path, 9, CompressionCase::ForcedYes)
        .await
        .unwrap();
    assert_eq!(yes.level, 9);
    let (_, ext) = store.name(&yes.id).await.unwrap();
    assert_eq!(ext, ".gz");

    // same content forced uncompressed: raw is bigger, so it leaves
    let no = store
        .write(&path, 0, CompressionCase::ForcedNo)
        .await
        .unwrap();
    assert_eq!(no.status, WriteStatus::Leave);
    assert_eq!(no.level, 0);

    // deferred: a fresh content stays raw with its case recorded
    let other = noise(4_000);
    let path = source(dir.path(), "later", &other).await;
    let later = store
        .write(&path, 5, CompressionCase::AutoLater)
        .await
        .unwrap();
    assert_eq!(later.level, 0);
    let (_, ext) = store.name(&later.id).await.unwrap();
    assert_eq!(ext, "");
}

#[tokio::test]
async fn replace_picks_the_smaller_representation() {
    let dir = tempfile::tempdir().unwrap();
    let store = new_store(dir.path()).await;
    // noise inflates under gzip, so the forced compressed copy is the
    // bigger one
    let data = noise(30_000);
    let path = source(dir.path(), "input", &data).await;

    let first = store
        .write(&path, 5, CompressionCase::ForcedYes)
        .await
        .unwrap();
    assert_eq!(first.status, WriteStatus::Add);
    let gz_path = first.store_path.clone();
    assert!(gz_path.to_string_lossy().ends_with("data.gz"));

    let second = store
        .write(&path, 0, CompressionCase::ForcedNo)
        .await
        .unwrap();
    assert_eq!(second.status, WriteStatus::Replace);
    assert_eq!(second.id, first.id);
    assert!(second.store_path.to_string_lossy().ends_with("data"));

    // exactly one representation remains
    assert!(!fs::try_exists(&gz_path).await.unwrap());
    assert!(fs::try_exists(&second.store_path).await.unwrap());
}

#[tokio::test]
async fn write_request_validation() {
    let dir = tempfile::tempdir().unwrap();
    let store = new_store(dir.path()).await;
    let path = source(dir.path(), "input", b"payload").await;

    assert!(matches!(
        store.write(&path, 0, CompressionCase::ForcedYes).await,
        Err(Error::InvalidRequest(_))
    ));
    assert!(matches!(
        store.write(&path, 5, CompressionCase::SizeYes).await,
        Err(Error::InvalidRequest(_))
    ));
    assert!(matches!(
        store.write(&path, 5, CompressionCase::Unknown).await,
        Err(Error::InvalidRequest(_))
    ));
}

#[tokio::test]
async fn remove_is_idempotent_with_a_warning() {
    let dir = tempfile::tempdir().unwrap();
    let store = new_store(dir.path()).await;
    let path = source(dir.path(), "input", b"some payload bytes").await;

    let outcome = store
        .write(&path, 5, CompressionCase::AutoNow)
        .await
        .unwrap();
    assert_eq!(
        store.remove(&outcome.id).await.unwrap(),
        hbackup_store::RemoveStatus::Removed
    );
    assert_eq!(
        store.remove(&outcome.id).await.unwrap(),
        hbackup_store::RemoveStatus::NotThere
    );
    assert!(matches!(
        store.name(&outcome.id).await.unwrap_err(),
        Error::NotFound(_)
    ));
}

#[tokio::test]
async fn reopening_an_existing_store_works() {
    let dir = tempfile::tempdir().unwrap();
    let data = compressible(10_000);
    let id = {
        let store = new_store(dir.path()).await;
        let path = source(dir.path(), "input", &data).await;
        store
            .write(&path, 5, CompressionCase::AutoNow)
            .await
            .unwrap()
            .id
    };

    let store = Store::open(dir.path().join("db"), HashAlgo::Md5, false)
        .await
        .unwrap();
    let target = dir.path().join("restored");
    store.read(&target, &id).await.unwrap();
    assert_eq!(fs::read(&target).await.unwrap(), data);

    // opening a missing store without create fails
    assert!(
        Store::open(dir.path().join("absent"), HashAlgo::Md5, false)
            .await
            .is_err()
    );
}

#[tokio::test]
async fn legacy_layout_is_upgraded_once() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("db");

    // a legacy store: three directory levels, no marker
    let data = b"legacy payload".to_vec();
    let digest = md5_hex(&data);
    let legacy_dir = root
        .join(&digest[0..2])
        .join(&digest[2..4])
        .join(&digest[4..6])
        .join(format!("{}-0", &digest[6..]));
    fs::create_dir_all(&legacy_dir).await.unwrap();
    fs::write(legacy_dir.join("data"), &data).await.unwrap();
    fs::write(legacy_dir.join("meta"), format!("{}\t-", data.len()))
        .await
        .unwrap();

    let store = Store::open(&root, HashAlgo::Md5, false).await.unwrap();
    assert!(fs::try_exists(root.join(".upgraded")).await.unwrap());

    // the entry is now addressable through the four-level scheme
    let id: ContentId = digest.parse().unwrap();
    let (payload, ext) = store.name(&id).await.unwrap();
    assert_eq!(ext, "");
    let expected_dir = root
        .join(&digest[0..2])
        .join(&digest[2..4])
        .join(&digest[4..6])
        .join(&digest[6..8])
        .join(format!("{}-0", &digest[8..]));
    assert_eq!(payload, expected_dir.join("data"));

    let target = dir.path().join("restored");
    store.read(&target, &id).await.unwrap();
    assert_eq!(fs::read(&target).await.unwrap(), data);
}

#[tokio::test]
async fn missing_list_round_trips_in_store_root() {
    let dir = tempfile::tempdir().unwrap();
    let store = new_store(dir.path()).await;

    let mut missing = MissingList::new();
    missing.open(store.root().join("missing")).await.unwrap();
    missing.set_missing("00ff00ff00ff00ff00");
    missing.set_inconsistent("ffaa00bb00cc00dd00", 512);
    missing.close().await.unwrap();

    let mut missing = MissingList::new();
    missing.open(store.root().join("missing")).await.unwrap();
    assert_eq!(missing.len(), 2);
    assert!(missing.search("00ff00ff00ff00ff00").is_some());
    missing.close().await.unwrap();
}
