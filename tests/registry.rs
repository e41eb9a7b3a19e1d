//! Open-items registry behavior against an in-memory remote.

mod common;

use std::sync::Arc;

use common::MemoryRemote;
use rand::{Rng, SeedableRng};
use truckeefs::error::Error;
use truckeefs::info::{Metadata, NodeKind, TahoeMeta};
use truckeefs::registry::CacheRegistry;
use truckeefs::remote::RemoteIo;
use truckeefs::utils::cache_score;

fn source_data(n: usize) -> Vec<u8> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(0xb10b);
    (0..n).map(|_| rng.gen()).collect()
}

async fn setup(cache_size: u64) -> (tempfile::TempDir, Arc<CacheRegistry>, Arc<MemoryRemote>) {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(MemoryRemote::new(13));
    let registry = Arc::new(
        CacheRegistry::new(
            dir.path().to_path_buf(),
            common::ROOT_CAP,
            cache_size,
            false,
            10.0,
            10.0,
        )
        .await
        .unwrap(),
    );
    (dir, registry, remote)
}

#[tokio::test]
async fn one_inode_instance_per_upath() {
    let (_dir, registry, remote) = setup(0).await;
    let data = source_data(656);
    remote.insert_file("foo.txt", data.clone());

    let h1 = registry
        .open_file("foo.txt", remote.as_ref(), 0, None)
        .await
        .unwrap();
    let h2 = registry
        .open_file("foo.txt", remote.as_ref(), 0, None)
        .await
        .unwrap();

    assert!(Arc::ptr_eq(h1.inode(), h2.inode()));
    assert_eq!(h1.inode().refcnt(), 2);

    // Reads through either handle hit the same cache
    let block = h1.read(remote.as_ref(), 137, 91).await.unwrap();
    assert_eq!(&block[..], &data[137..228]);

    registry.close_file(&h1).await.unwrap();
    assert_eq!(h2.inode().refcnt(), 1);
    registry.close_file(&h2).await.unwrap();
    assert!(registry.get_open("foo.txt").await.is_none());

    // Closing twice is an error
    assert!(matches!(
        registry.close_file(&h2).await,
        Err(Error::BadHandle)
    ));
}

#[tokio::test]
async fn open_flag_semantics() {
    let (_dir, registry, remote) = setup(0).await;
    remote.insert_file("a.txt", vec![1, 2, 3]);
    remote.insert_file("d/inner.txt", vec![0]);

    // Must-exist
    assert!(matches!(
        registry.open_file("missing", remote.as_ref(), 0, None).await,
        Err(Error::NotFound)
    ));
    // Exclusive-create collision
    assert!(matches!(
        registry
            .open_file(
                "a.txt",
                remote.as_ref(),
                libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                None
            )
            .await,
        Err(Error::AlreadyExists)
    ));
    // Unsupported and contradictory flags
    assert!(matches!(
        registry
            .open_file("a.txt", remote.as_ref(), libc::O_RDONLY | libc::O_SYNC, None)
            .await,
        Err(Error::Unsupported(_))
    ));
    assert!(matches!(
        registry
            .open_file("a.txt", remote.as_ref(), libc::O_RDONLY | libc::O_CREAT, None)
            .await,
        Err(Error::Invalid(_))
    ));

    // Kind mismatch: a directory upath opened as a file
    assert!(matches!(
        registry.open_file("d", remote.as_ref(), 0, None).await,
        Err(Error::IsDirectory)
    ));
}

#[tokio::test]
async fn child_attr_timestamp_fallback() {
    let (_dir, registry, remote) = setup(0).await;
    remote.insert_file("d/x", vec![1, 2, 3]);

    // Only explicit ctime/mtime: they are used as-is
    remote.set_child_metadata(
        "d",
        "x",
        Metadata {
            ctime: Some(1.5),
            mtime: Some(2.5),
            tahoe: None,
        },
    );
    let d = registry.open_dir("d", remote.as_ref(), None).await.unwrap();
    let attr = d.get_child_attr("x").await.unwrap();
    assert_eq!(attr.kind, NodeKind::File);
    assert_eq!(attr.size, Some(3));
    assert_eq!(attr.ctime, Some(1.5));
    assert_eq!(attr.mtime, Some(2.5));
    assert!(matches!(
        d.get_child_attr("nope").await,
        Err(Error::NotFound)
    ));
    registry.close_dir(&d).await.unwrap();

    // linkcrtime present: it wins for both timestamps
    remote.set_child_metadata(
        "d",
        "x",
        Metadata {
            ctime: Some(1.5),
            mtime: Some(2.5),
            tahoe: Some(TahoeMeta {
                linkcrtime: Some(9.0),
                linkmotime: None,
            }),
        },
    );
    registry.invalidate("d", false).await.unwrap();
    let d = registry.open_dir("d", remote.as_ref(), None).await.unwrap();
    let attr = d.get_child_attr("x").await.unwrap();
    assert_eq!(attr.ctime, Some(9.0));
    assert_eq!(attr.mtime, Some(9.0));
    registry.close_dir(&d).await.unwrap();
}

#[tokio::test]
async fn invalidate_purges_disk_and_marks_inodes() {
    let (dir, registry, remote) = setup(0).await;
    remote.insert_file("a/b.txt", source_data(100));
    remote.insert_file("c.txt", source_data(50));

    // Materialize cache artifacts
    let h = registry
        .open_file("a/b.txt", remote.as_ref(), 0, None)
        .await
        .unwrap();
    h.read(remote.as_ref(), 0, 100).await.unwrap();
    let files_before = std::fs::read_dir(dir.path()).unwrap().count();
    assert!(files_before > 1);

    registry.invalidate("", false).await.unwrap();

    // Only the salt survives on disk
    let left: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(left, vec!["salt".to_owned()]);

    // The open inode has been disowned and flagged
    assert!(h.inode().invalidated());
    assert!(registry.get_open("a/b.txt").await.is_none());
    registry.close_file(&h).await.unwrap();
}

#[tokio::test]
async fn mkdir_unlink_round_trip() {
    let (_dir, registry, remote) = setup(0).await;
    remote.insert_file("old.txt", vec![7; 10]);

    registry.mkdir("newdir", remote.as_ref()).await.unwrap();
    assert!(remote.get_info("newdir", false).await.is_ok());
    assert!(matches!(
        registry.mkdir("newdir", remote.as_ref()).await,
        Err(Error::AlreadyExists)
    ));
    assert!(matches!(
        registry.mkdir("", remote.as_ref()).await,
        Err(Error::AlreadyExists)
    ));

    let root = registry.open_dir("", remote.as_ref(), None).await.unwrap();
    let mut names = root.listdir().await.unwrap();
    names.sort();
    assert_eq!(names, vec!["newdir".to_owned(), "old.txt".to_owned()]);
    registry.close_dir(&root).await.unwrap();

    registry
        .unlink("old.txt", remote.as_ref(), false)
        .await
        .unwrap();
    assert!(matches!(
        remote.get_info("old.txt", false).await,
        Err(Error::NotFound)
    ));
    assert!(matches!(
        registry.unlink("", remote.as_ref(), false).await,
        Err(Error::Denied)
    ));

    let root = registry.open_dir("", remote.as_ref(), None).await.unwrap();
    assert_eq!(root.listdir().await.unwrap(), vec!["newdir".to_owned()]);
    registry.close_dir(&root).await.unwrap();
}

#[tokio::test]
async fn new_file_write_and_upload() {
    let (_dir, registry, remote) = setup(0).await;

    let h = registry
        .open_file(
            "fresh.txt",
            remote.as_ref(),
            libc::O_RDWR | libc::O_CREAT,
            None,
        )
        .await
        .unwrap();
    h.write(remote.as_ref(), 0, b"hello remote").await.unwrap();
    assert!(h.inode().dirty().await);

    // A not-yet-uploaded file is visible through get_attr
    let attr = registry.get_attr("fresh.txt", remote.as_ref()).await.unwrap();
    assert_eq!(attr.kind, NodeKind::File);
    assert_eq!(attr.size, Some(12));

    registry
        .upload_file(h.inode(), remote.as_ref())
        .await
        .unwrap();
    assert!(!h.inode().dirty().await);
    assert_eq!(remote.put_count(), 1);
    registry.close_file(&h).await.unwrap();

    // The upload registered the child remotely and in the parent cache
    let info = remote.get_info("fresh.txt", false).await.unwrap();
    match info {
        truckeefs::info::NodeInfo::File(f) => assert_eq!(f.size, 12),
        _ => panic!("expected a file"),
    }

    // Read it back through a fresh registry cycle
    registry.invalidate("", false).await.unwrap();
    let h = registry
        .open_file("fresh.txt", remote.as_ref(), 0, None)
        .await
        .unwrap();
    let block = h.read(remote.as_ref(), 0, 100).await.unwrap();
    assert_eq!(&block[..], b"hello remote");
    registry.close_file(&h).await.unwrap();
}

#[tokio::test]
async fn append_goes_to_the_end() {
    let (_dir, registry, remote) = setup(0).await;
    remote.insert_file("log.txt", b"0123456789".to_vec());

    let h = registry
        .open_file(
            "log.txt",
            remote.as_ref(),
            libc::O_RDWR | libc::O_APPEND,
            None,
        )
        .await
        .unwrap();
    h.write(remote.as_ref(), 2, b"xyz").await.unwrap();
    let block = h.read(remote.as_ref(), 0, 64).await.unwrap();
    assert_eq!(&block[..], b"0123456789xyz");
    registry.close_file(&h).await.unwrap();
}

#[tokio::test]
async fn eviction_keeps_best_scored_within_limit() {
    let dir = tempfile::tempdir().unwrap();
    let registry = CacheRegistry::new(
        dir.path().to_path_buf(),
        common::ROOT_CAP,
        1000,
        false,
        10.0,
        10.0,
    )
    .await
    .unwrap();

    // Five equal-sized files with decreasing freshness
    let now = std::time::SystemTime::now();
    for i in 0..5u64 {
        let path = dir.path().join(format!("f{}", i));
        std::fs::write(&path, vec![0u8; 400]).unwrap();
        let f = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        f.set_modified(now - std::time::Duration::from_secs(i * 600))
            .unwrap();
    }

    registry.restrict_size_now().await.unwrap();

    let mut left: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n != "salt")
        .collect();
    left.sort();

    // Equal sizes make score strictly decreasing in age: the two newest
    // fit under the 1000-byte limit, the rest are unlinked
    assert_eq!(left, vec!["f0".to_owned(), "f1".to_owned()]);
    assert!(cache_score(400, 0.0) > cache_score(400, 600.0));
}
