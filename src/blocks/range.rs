//! Block range arithmetic.

use crate::error::BlockError;

/// Compute `ceil(a / b)`, i.e. rounded towards positive infinity.
pub fn ceil_div(a: u64, b: u64) -> u64 {
    if a == 0 {
        0
    } else {
        1 + (a - 1) / b
    }
}

/// Leading partial block: `block[start..end]` holds the data.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StartSlice {
    pub idx: u64,
    pub start: usize,
    pub end: usize,
}

/// Trailing partial block: `block[..end]` holds the data.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EndSlice {
    pub idx: u64,
    pub end: usize,
}

/// The blocks overlapping a byte range: an optional leading partial, a
/// half-open `[start, end)` run of whole blocks, and an optional trailing
/// partial.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct BlockRange {
    pub start: Option<StartSlice>,
    pub mid: Option<(u64, u64)>,
    pub end: Option<EndSlice>,
}

/// Get the blocks that overlap with the data range `[offset, offset + length)`.
///
/// If `last_pos` (the end-of-file position) is given, the range is clamped to
/// it, and a trailing partial that reaches exactly `last_pos` is promoted
/// into `mid` so that EOF tails are handled as whole blocks.
pub fn block_range(
    offset: u64,
    length: u64,
    block_size: u64,
    last_pos: Option<u64>,
) -> Result<BlockRange, BlockError> {
    if block_size == 0 {
        return Err(BlockError::ZeroBlockSize);
    }
    let length = match last_pos {
        Some(last_pos) => last_pos.saturating_sub(offset).min(length),
        None => length,
    };
    if length == 0 {
        return Ok(BlockRange::default());
    }

    let start_block = offset / block_size;
    let start_pos = (offset % block_size) as usize;
    let mut end_block = (offset + length) / block_size;
    let mut end_pos = ((offset + length) % block_size) as usize;

    if let Some(last_pos) = last_pos {
        if offset + length == last_pos && end_pos > 0 {
            end_block += 1;
            end_pos = 0;
        }
    }

    if start_block == end_block {
        if start_pos == end_pos {
            return Ok(BlockRange::default());
        }
        return Ok(BlockRange {
            start: Some(StartSlice {
                idx: start_block,
                start: start_pos,
                end: end_pos,
            }),
            ..Default::default()
        });
    }

    let mut mid = None;
    let start = if start_pos == 0 {
        mid = Some((start_block, end_block));
        None
    } else {
        if start_block + 1 < end_block {
            mid = Some((start_block + 1, end_block));
        }
        Some(StartSlice {
            idx: start_block,
            start: start_pos,
            end: block_size as usize,
        })
    };

    let end = (end_pos != 0).then_some(EndSlice {
        idx: end_block,
        end: end_pos,
    });

    Ok(BlockRange { start, mid, end })
}

#[cfg(test)]
mod test {
    use super::*;

    // Reassemble the range from the named slices and compare against the
    // clamped source range.
    fn check_block_slice(data: &[u8], offset: u64, length: u64, block_size: u64, last_pos: u64) {
        let r = block_range(offset, length, block_size, Some(last_pos)).unwrap();
        let block = |j: u64| {
            let lo = (j * block_size) as usize;
            let hi = (lo + block_size as usize).min(data.len());
            &data[lo.min(data.len())..hi]
        };

        let mut out = Vec::new();
        if let Some(s) = r.start {
            out.extend_from_slice(&block(s.idx)[s.start..s.end]);
        }
        if let Some((lo, hi)) = r.mid {
            for j in lo..hi {
                out.extend_from_slice(block(j));
            }
        }
        if let Some(e) = r.end {
            out.extend_from_slice(&block(e.idx)[..e.end]);
        }

        let lo = (offset as usize).min(data.len());
        let hi = ((offset + length) as usize).min(data.len());
        assert_eq!(
            out,
            &data[lo..hi.max(lo)],
            "offset={} length={} block_size={}",
            offset,
            length,
            block_size
        );
    }

    #[test]
    fn reconstruction() {
        let data: Vec<u8> = (0u32..31).map(|x| (x * 89 % 251) as u8).collect();
        for offset in 0..35 {
            for length in 0..35 {
                for block_size in [1, 2, 3, 5, 7, 11] {
                    check_block_slice(&data, offset, length, block_size, data.len() as u64);
                }
            }
        }
    }

    #[test]
    fn zero_block_size() {
        assert!(matches!(
            block_range(0, 10, 0, None),
            Err(BlockError::ZeroBlockSize)
        ));
    }

    #[test]
    fn eof_tail_promoted_to_mid() {
        // Tail ending exactly at last_pos becomes part of the whole-block run
        let r = block_range(0, 10, 7, Some(10)).unwrap();
        assert_eq!(r.start, None);
        assert_eq!(r.mid, Some((0, 2)));
        assert_eq!(r.end, None);
    }

    #[test]
    fn ceil_div_matches_reference() {
        for k in 0..100 {
            for p in [3, 8, 17] {
                let expect = k / p + u64::from(k % p > 0);
                assert_eq!(ceil_div(k, p), expect, "{}/{}", k, p);
            }
        }
    }
}
