//! Block storage and block cache behavior, driven the way the lazy-fetch
//! loop drives them: `pre_read`/`pre_write` name missing ranges, and the
//! test feeds them back in deliberately awkward 13-byte pieces.

use bytes::Bytes;
use rand::{Rng, SeedableRng};

use truckeefs::blocks::storage::BLOCK_UNALLOCATED;
use truckeefs::blocks::{ceil_div, BlockCachedFile, BlockStorage};
use truckeefs::framed::{FramedFile, Mode};

fn source_data(n: usize) -> Vec<u8> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(0x7ca3);
    (0..n).map(|_| rng.gen()).collect()
}

async fn framed(dir: &tempfile::TempDir, name: &str) -> FramedFile {
    FramedFile::open(&dir.path().join(name), Mode::Create, 32)
        .await
        .unwrap()
}

enum Op<'a> {
    Read(u64),
    Write(&'a [u8]),
}

/// Drive an operation through the pre_read/pre_write protocol, feeding the
/// cache from `source` in small misaligned pieces.
async fn do_rw(f: &mut BlockCachedFile, source: &[u8], offset: u64, op: Op<'_>) -> Bytes {
    let mut x_offset = 0u64;
    let mut x_read = 0usize;
    let mut x_data: Vec<Bytes> = Vec::new();

    loop {
        let pos = match &op {
            Op::Read(length) => f.pre_read(offset, *length),
            Op::Write(data) => f.pre_write(offset, data.len() as u64),
        };
        let Some((c_offset, _c_length)) = pos else {
            // Cache ready
            return match op {
                Op::Read(length) => f.read(offset, length).await.unwrap(),
                Op::Write(data) => {
                    f.write(offset, data).await.unwrap();
                    Bytes::new()
                }
            };
        };

        // Cache not ready: fill it in a purposefully dodgy way
        if c_offset > x_offset + 23 || c_offset < x_offset {
            x_offset = (c_offset / 13) * 13;
            x_read = x_offset as usize;
            x_data.clear();
        }
        let end = (x_read + 13).min(source.len());
        x_data.push(Bytes::copy_from_slice(&source[x_read.min(end)..end]));
        x_read += 13;
        let (new_offset, rest) = f.receive_cached_data(x_offset, x_data).await.unwrap();
        x_offset = new_offset;
        x_data = rest;
    }
}

async fn do_read(f: &mut BlockCachedFile, source: &[u8], offset: u64, length: u64) -> Bytes {
    do_rw(f, source, offset, Op::Read(length)).await
}

async fn do_write(f: &mut BlockCachedFile, source: &[u8], offset: u64, data: &[u8]) {
    do_rw(f, source, offset, Op::Write(data)).await;
}

#[tokio::test]
async fn roundtrip_read_and_write_over_partial() {
    let dir = tempfile::tempdir().unwrap();
    let data = source_data(656);
    let mut f = BlockCachedFile::new(framed(&dir, "data").await, 656, Some(7));

    // Lazy read fetches exactly the missing range and serves it back
    let block = do_read(&mut f, &data, 137, 91).await;
    assert_eq!(&block[..], &data[137..228]);
    assert_eq!(f.pre_read(137, 91), None);

    // Overwrite a span straddling cached partial blocks
    do_write(&mut f, &data, 131, &[b'a'; 31]).await;
    let block = do_read(&mut f, &data, 130, 91).await;
    assert_eq!(block[0], data[130]);
    assert_eq!(&block[1..32], &[b'a'; 31][..]);
    assert_eq!(&block[32..], &data[162..221]);
}

#[tokio::test]
async fn write_past_end_is_zero_padded() {
    let dir = tempfile::tempdir().unwrap();
    let data = source_data(656);
    let len = data.len() as u64;
    let mut f = BlockCachedFile::new(framed(&dir, "data").await, len, Some(7));

    do_write(&mut f, &data, len + 5, &[b'a'; 3]).await;

    let block = do_read(&mut f, &data, len - 1, 1 + 5 + 3).await;
    let mut expect = vec![data[data.len() - 1]];
    expect.extend_from_slice(&[0; 5]);
    expect.extend_from_slice(&[b'a'; 3]);
    assert_eq!(&block[..], &expect[..]);
}

#[tokio::test]
async fn truncate_shrink_and_regrow() {
    let dir = tempfile::tempdir().unwrap();
    let data = source_data(656);
    let mut f = BlockCachedFile::new(framed(&dir, "data").await, 656, Some(7));

    do_write(&mut f, &data, 0, &[b'b'; 1237]).await;
    assert_eq!(&do_read(&mut f, &data, 0, 15).await[..], &[b'b'; 15][..]);
    f.truncate(7).await.unwrap();
    assert_eq!(&do_read(&mut f, &data, 0, 15).await[..], &[b'b'; 7][..]);
    f.truncate(0).await.unwrap();
    assert_eq!(do_read(&mut f, &data, 0, 15).await.len(), 0);

    do_write(&mut f, &data, 0, &[b'b'; 1237]).await;
    assert_eq!(&do_read(&mut f, &data, 1200, 15).await[..], &[b'b'; 15][..]);
    f.truncate(1200 + 7).await.unwrap();
    assert_eq!(&do_read(&mut f, &data, 1200, 15).await[..], &[b'b'; 7][..]);
    f.truncate(1200).await.unwrap();
    assert_eq!(do_read(&mut f, &data, 1200, 15).await.len(), 0);
    f.truncate(1200 - 20).await.unwrap();
    assert_eq!(do_read(&mut f, &data, 1200, 15).await.len(), 0);
}

#[tokio::test]
async fn padding_leaves_no_unallocated_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let mut f = BlockCachedFile::new(framed(&dir, "data").await, 19, Some(7));

    let start_idx = ceil_div(19, 7) as usize;
    for k in [3 * 7, 3 * 7 + 1, 3 * 7 + 3, 540, 1090] {
        f.truncate(k).await.unwrap();
        assert!(
            !f.storage().map()[start_idx..].contains(&BLOCK_UNALLOCATED),
            "hole after growing to {}",
            k
        );
    }
}

/// Random interleaving of reads, writes and the lazy-fetch protocol against
/// a simulated byte array.
async fn random_rw(
    f: &mut BlockCachedFile,
    source: &[u8],
    sim: &mut Vec<u8>,
    mut file_size: usize,
    max_file_size: usize,
    count: usize,
    rng: &mut rand::rngs::StdRng,
) -> usize {
    for j in 0..count {
        let mut a = rng.gen_range(0..=max_file_size);
        let mut b = rng.gen_range(0..=max_file_size);
        if a > b {
            std::mem::swap(&mut a, &mut b);
        }
        b = b.min(a + 39);

        if j % 2 == 0 {
            let a = a.min(file_size.saturating_sub(1));
            let b = b.min(file_size);
            let block = do_read(f, source, a as u64, (b.saturating_sub(a)) as u64).await;
            assert_eq!(&block[..], &sim[a..b.max(a)], "read at {}..{}", a, b);
        } else {
            let block: Vec<u8> = if j % 31 == 0 {
                vec![0; b - a]
            } else {
                (0..b - a).map(|_| rng.gen()).collect()
            };
            sim[a..b].copy_from_slice(&block);
            do_write(f, source, a as u64, &block).await;
            file_size = file_size.max(a + block.len());
        }
    }
    file_size
}

#[tokio::test]
async fn random_interleaving_matches_simulation() {
    let dir = tempfile::tempdir().unwrap();
    let data = source_data(656);
    let max_file_size = 2 * data.len();
    let mut rng = rand::rngs::StdRng::seed_from_u64(1234);

    for round in 0..3 {
        let mut sim = data.clone();
        sim.resize(max_file_size, 0);
        let mut f = BlockCachedFile::new(
            framed(&dir, &format!("data{}", round)).await,
            data.len() as u64,
            Some(7),
        );
        random_rw(
            &mut f,
            &data,
            &mut sim,
            data.len(),
            max_file_size,
            1500,
            &mut rng,
        )
        .await;
    }
}

#[tokio::test]
async fn state_survives_save_and_restore() {
    let dir = tempfile::tempdir().unwrap();
    let data = source_data(656);
    let max_file_size = 2 * data.len();
    let mut rng = rand::rngs::StdRng::seed_from_u64(99);

    let mut sim = data.clone();
    sim.resize(max_file_size, 0);

    let data_path = dir.path().join("blob");
    let state_path = dir.path().join("blob.state");

    let f_data = FramedFile::open(&data_path, Mode::Create, 32).await.unwrap();
    let mut f = BlockCachedFile::new(f_data, data.len() as u64, Some(7));
    let mut file_size =
        random_rw(&mut f, &data, &mut sim, data.len(), max_file_size, 17, &mut rng).await;

    let mut state = FramedFile::open(&state_path, Mode::Create, 32).await.unwrap();
    f.save_state(&mut state).await.unwrap();
    state.close().await.unwrap();
    f.flush().await.unwrap();
    drop(f);

    let mut state = FramedFile::open(&state_path, Mode::Read, 32).await.unwrap();
    let f_data = FramedFile::open(&data_path, Mode::ReadWrite, 32).await.unwrap();
    let mut f = BlockCachedFile::restore_state(f_data, &mut state).await.unwrap();

    for _ in 0..3 {
        file_size =
            random_rw(&mut f, &data, &mut sim, file_size, max_file_size, 15, &mut rng).await;
    }
}

#[tokio::test]
async fn received_ranges_stay_cached() {
    let dir = tempfile::tempdir().unwrap();
    let data = source_data(656);
    let mut f = BlockCachedFile::new(framed(&dir, "data").await, 656, Some(7));

    // Deliver one contiguous range; a trailing non-block piece comes back
    let chunks = vec![Bytes::copy_from_slice(&data[70..140]), Bytes::copy_from_slice(&data[140..150])];
    let (new_offset, rest) = f.receive_cached_data(70, chunks).await.unwrap();
    assert_eq!(new_offset, 147);
    assert_eq!(rest.len(), 1);
    assert_eq!(&rest[0][..], &data[147..150]);

    // Everything inside the committed span is now cached
    for (offset, length) in [(70, 77), (75, 10), (70, 7), (140, 7)] {
        assert_eq!(f.pre_read(offset, length), None, "({}, {})", offset, length);
    }
    // Outside it, a fetch is still demanded
    assert!(f.pre_read(0, 70).is_some());
    assert!(f.pre_read(147, 20).is_some());
}

#[tokio::test]
async fn storage_basics() {
    let dir = tempfile::tempdir().unwrap();
    let f = framed(&dir, "storage").await;
    let mut s = BlockStorage::new(f, 7);

    // Missing blocks
    assert!(s.get(0).await.is_err());
    assert!(s.get(1).await.is_err());

    let block_1 = [1u8; 7];
    let block_2 = [2u8; 7];
    s.set(0, Some(&block_1[..])).await.unwrap();
    s.set(1, Some(&block_2[..])).await.unwrap();
    assert_eq!(&s.get(0).await.unwrap()[..], &block_1[..]);
    assert_eq!(&s.get(1).await.unwrap()[..], &block_2[..]);

    // Sparse zero blocks
    s.set(1, None).await.unwrap();
    assert_eq!(&s.get(1).await.unwrap()[..], &[0u8; 7][..]);
    s.set(1, Some(&block_2[..])).await.unwrap();

    // Short blocks read back null-padded
    s.set(2, Some(&b"abc"[..])).await.unwrap();
    assert_eq!(&s.get(2).await.unwrap()[..], b"abc\x00\x00\x00\x00");
    s.set(3, Some(&b"cba"[..])).await.unwrap();
    assert_eq!(&s.get(3).await.unwrap()[..], b"cba\x00\x00\x00\x00");

    // Save-restore cycle
    s.set(2, Some(&block_2[..])).await.unwrap();
    let mut state = framed(&dir, "storage.state").await;
    s.save_state(&mut state).await.unwrap();
    let backing = s.into_file().await.unwrap();
    let (mut s, _) = BlockStorage::restore_state(backing, &mut state)
        .await
        .unwrap();
    assert_eq!(&s.get(0).await.unwrap()[..], &block_1[..]);
    assert_eq!(&s.get(2).await.unwrap()[..], &block_2[..]);
}

#[tokio::test]
async fn no_slot_is_shared() {
    let dir = tempfile::tempdir().unwrap();
    let mut s = BlockStorage::new(framed(&dir, "storage").await, 7);
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);

    for _ in 0..500 {
        let idx = rng.gen_range(0..20u64);
        if rng.gen_bool(0.3) {
            s.set(idx, None).await.unwrap();
        } else {
            let data = [rng.gen::<u8>(); 7];
            s.set(idx, Some(&data[..])).await.unwrap();
        }
        if rng.gen_bool(0.05) {
            s.truncate(rng.gen_range(0..25)).await.unwrap();
        }

        let mut used: Vec<i64> = s.map().iter().copied().filter(|&x| x >= 0).collect();
        used.sort_unstable();
        used.dedup();
        assert_eq!(
            used.len(),
            s.map().iter().filter(|&&x| x >= 0).count(),
            "physical slot referenced twice: {:?}",
            s.map()
        );
    }
}
