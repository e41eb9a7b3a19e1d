use std::time::Duration;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;

use crate::error::Error;

pub fn setup_logger(debug: bool) -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(Some(tracing_subscriber::fmt::layer().with_filter(
            if debug {
                LevelFilter::DEBUG
            } else {
                LevelFilter::INFO
            },
        )))
        .init();

    Ok(())
}

pub fn unix_timestamp() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Sleep for exponentially increasing time. `n` is the number of times
/// sleep has been called. Starts at 0.1s, capped at 60s.
pub async fn exponential_sleep(n: u32) {
    let secs = (0.1 * f64::from(2u32.saturating_pow(n).min(1 << 20))).min(60.0);
    tokio::time::sleep(Duration::from_secs_f64(secs)).await;
}

/// Best-effort mtime bump so the eviction scan sees the file as recently used.
pub fn touch(path: &std::path::Path) {
    if let Ok(f) = std::fs::OpenOptions::new().write(true).open(path) {
        let _ = f.set_modified(std::time::SystemTime::now());
    }
}

/// Parse a size specifier such as `512`, `10k`, `1GB` or `2GiB`.
/// SI suffixes are powers of 1000, IEC suffixes powers of 1024.
pub fn parse_size(size: &str) -> Result<u64, Error> {
    let s = size.trim().to_ascii_lowercase();
    let digits_end = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or_else(|| s.len());
    let (digits, suffix) = s.split_at(digits_end);
    let value: u64 = digits
        .parse()
        .map_err(|_| Error::Invalid("not a valid size specifier"))?;
    let multiplier: u64 = match suffix.trim() {
        "" => 1,
        "k" | "kb" => 1000,
        "m" | "mb" => 1000u64.pow(2),
        "g" | "gb" => 1000u64.pow(3),
        "t" | "tb" => 1000u64.pow(4),
        "kib" => 1024,
        "mib" => 1024u64.pow(2),
        "gib" => 1024u64.pow(3),
        "tib" => 1024u64.pow(4),
        _ => return Err(Error::Invalid("invalid size multiplier")),
    };
    value
        .checked_mul(multiplier)
        .ok_or(Error::Invalid("size out of range"))
}

/// Parse a cache lifetime in seconds; `inf` means effectively forever.
pub fn parse_lifetime(lifetime: &str) -> Result<u64, Error> {
    match lifetime.trim().to_ascii_lowercase().as_str() {
        "inf" | "infinity" | "infinite" => Ok(100 * 365 * 24 * 60 * 60),
        s => s
            .parse()
            .map_err(|_| Error::Invalid("invalid lifetime specifier")),
    }
}

// Constants for the cache score calculation.
const DOWNLOAD_SPEED: f64 = 1e6; // byte/sec
const LATENCY: f64 = 1.0; // sec

/// Estimated access rate (unit 1/sec). `t` is time since last access.
fn access_rate(size: f64, t: f64) -> f64 {
    if t < 0.0 {
        return 0.0;
    }
    let size_unit = 100e3;
    let size_prob = 1.0 / (1.0 + (size / size_unit).powi(2));
    size_prob / (LATENCY + t)
}

/// Cache score for a file of size `size` last accessed `t` seconds ago.
/// Bigger number means higher retention priority.
pub fn cache_score(size: u64, t: f64) -> f64 {
    let size = size as f64;
    let rate = access_rate(size, t);

    // Maximum size downloadable up to this time
    let dl_size = DOWNLOAD_SPEED * (t - LATENCY).max(0.0);

    // Time cost of re-retrieval
    rate * (LATENCY + dl_size.min(size) / DOWNLOAD_SPEED)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sizes() {
        assert_eq!(parse_size("512").unwrap(), 512);
        assert_eq!(parse_size("10k").unwrap(), 10_000);
        assert_eq!(parse_size("1GB").unwrap(), 1_000_000_000);
        assert_eq!(parse_size("2GiB").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_size(" 3 mib ").unwrap(), 3 * 1024 * 1024);
        assert!(parse_size("nope").is_err());
        assert!(parse_size("12q").is_err());
    }

    #[test]
    fn lifetimes() {
        assert_eq!(parse_lifetime("10").unwrap(), 10);
        assert!(parse_lifetime("inf").unwrap() > 1_000_000_000);
        assert!(parse_lifetime("soon").is_err());
    }

    #[test]
    fn score_prefers_small_and_recent() {
        // Recently used files score higher than stale ones
        assert!(cache_score(50_000, 5.0) > cache_score(50_000, 500.0));
        // Small files are cheap to refetch relative to their access rate
        assert!(cache_score(10_000, 10.0) > cache_score(10_000_000, 10.0));
        // Negative age (clock skew) is inert, not a panic
        assert_eq!(cache_score(1000, -3.0), 0.0);
    }
}
