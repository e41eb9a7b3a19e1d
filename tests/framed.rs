//! Framed cache file format and semantics.

use truckeefs::error::FramedError;
use truckeefs::framed::{FramedFile, Mode, HEADER_SIZE};

#[tokio::test]
async fn truncate_and_grow() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("f");
    let mut f = FramedFile::open(&path, Mode::Create, 32).await.unwrap();

    f.write_at(0, &[b'b'; 1237]).await.unwrap();
    f.truncate(15).await.unwrap();
    assert_eq!(f.read_all().await.unwrap(), vec![b'b'; 15]);

    // Regrowth exposes null bytes, not stale data
    f.truncate(31).await.unwrap();
    let mut expect = vec![b'b'; 15];
    expect.extend_from_slice(&[0; 16]);
    assert_eq!(f.read_all().await.unwrap(), expect);

    f.truncate(0).await.unwrap();
    assert_eq!(f.read_all().await.unwrap(), Vec::<u8>::new());
}

#[tokio::test]
async fn write_past_end() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("f");
    let mut f = FramedFile::open(&path, Mode::Create, 32).await.unwrap();

    f.write_at(12, b"abba").await.unwrap();
    let mut expect = vec![0u8; 12];
    expect.extend_from_slice(b"abba");
    assert_eq!(f.read_at(0, 16).await.unwrap(), expect);
    assert_eq!(f.len(), 16);
}

#[tokio::test]
async fn header_round_trip_and_slot_padding() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("f");

    let mut f = FramedFile::open(&path, Mode::Create, 32).await.unwrap();
    f.write_at(0, &[b'x'; 40]).await.unwrap();
    f.close().await.unwrap();

    // Body is padded out to whole 32-byte slots past the 16-byte header
    let disk = std::fs::metadata(&path).unwrap().len();
    assert_eq!(disk, HEADER_SIZE + 64);

    let mut f = FramedFile::open(&path, Mode::Read, 32).await.unwrap();
    assert_eq!(f.len(), 40);
    assert_eq!(f.read_all().await.unwrap(), vec![b'x'; 40]);
    drop(f);

    // Reopening with a different block size is rejected
    match FramedFile::open(&path, Mode::ReadWrite, 64).await {
        Err(FramedError::BlockSizeMismatch { expected, found }) => {
            assert_eq!((expected, found), (64, 32));
        }
        other => panic!("expected block size mismatch, got {:?}", other.is_ok()),
    }

    // Garbage is not accepted as a header
    std::fs::write(dir.path().join("g"), b"not a framed file").unwrap();
    assert!(matches!(
        FramedFile::open(&dir.path().join("g"), Mode::Read, 32).await,
        Err(FramedError::InvalidHeader)
    ));
}

#[tokio::test]
async fn reads_are_clamped_to_logical_size() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("f");
    let mut f = FramedFile::open(&path, Mode::Create, 32).await.unwrap();

    f.write_at(0, b"hello").await.unwrap();
    assert_eq!(f.read_at(0, 100).await.unwrap(), b"hello".to_vec());
    assert_eq!(f.read_at(5, 10).await.unwrap(), Vec::<u8>::new());
    assert_eq!(f.read_at(3, 1).await.unwrap(), b"l".to_vec());
}
