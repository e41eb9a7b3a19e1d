//! Cache key material and filename derivation.
//!
//! The cache master key is derived from the rootcap and a salt via PBKDF2
//! with a machine-calibrated iteration count. The master key, combined with
//! a second salt, generates per-file key material via HKDF-SHA256; the
//! on-disk filename is the hex HMAC-SHA512 of the upath under that
//! material. The mapping is deterministic under the per-instance secret and
//! unpredictable without it.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Sha256, Sha512};
use tracing::*;

use crate::error::Error;

/// `salt` file layout: iteration count, PBKDF2 salt, HKDF salt.
const SALT_FILE: &str = "salt";

/// Backing-file roles of a cached file; the empty role is the metadata blob.
pub const ROLE_STATE: &[u8] = b"state";
pub const ROLE_DATA: &[u8] = b"data";

pub struct KeyMaterial {
    master: [u8; 32],
    salt_hkdf: [u8; 32],
}

impl KeyMaterial {
    pub fn load_or_create(cache_dir: &Path, rootcap: &str) -> Result<Self, Error> {
        let salt_fn = cache_dir.join(SALT_FILE);

        let (numiter, salt, salt_hkdf) = match read_salt_file(&salt_fn) {
            Ok(parts) => parts,
            Err(_) => {
                // Start with new salts
                let mut rnd = [0u8; 64];
                rand::thread_rng().fill_bytes(&mut rnd);
                let salt: [u8; 32] = rnd[..32].try_into().unwrap();
                let salt_hkdf: [u8; 32] = rnd[32..].try_into().unwrap();

                let numiter = calibrate_iterations(rootcap.len().max(1));
                debug!(numiter, "Calibrated key derivation");

                let mut f = std::fs::File::create(&salt_fn)?;
                f.write_all(&numiter.to_le_bytes())?;
                f.write_all(&salt)?;
                f.write_all(&salt_hkdf)?;
                (numiter, salt, salt_hkdf)
            }
        };

        let mut master = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(rootcap.as_bytes(), &salt, numiter, &mut master);
        Ok(Self { master, salt_hkdf })
    }

    /// Deterministic on-disk filename and per-file key for a upath and
    /// backing-file role.
    pub fn filename_and_key(
        &self,
        cache_dir: &Path,
        upath: &str,
        role: Option<&[u8]>,
    ) -> (PathBuf, [u8; 32]) {
        let mut info = upath.as_bytes().to_vec();
        if let Some(role) = role {
            // Separator that cannot occur in a normalized upath
            info.extend_from_slice(b"//\x00");
            info.extend_from_slice(role);
        }

        let mut okm = [0u8; 96];
        Hkdf::<Sha256>::new(Some(&self.salt_hkdf), &self.master)
            .expand(&info, &mut okm)
            .expect("96 bytes is a valid HKDF-SHA256 output length");

        let key: [u8; 32] = okm[..32].try_into().unwrap();

        let mut mac = Hmac::<Sha512>::new_from_slice(&okm[32..])
            .expect("HMAC accepts any key length");
        mac.update(&info);
        let fname = hex::encode(mac.finalize().into_bytes());
        (cache_dir.join(fname), key)
    }
}

fn read_salt_file(path: &Path) -> Result<(u32, [u8; 32], [u8; 32]), Error> {
    let mut f = std::fs::File::open(path)?;
    let mut numiter = [0u8; 4];
    let mut salt = [0u8; 32];
    let mut salt_hkdf = [0u8; 32];
    f.read_exact(&mut numiter)?;
    f.read_exact(&mut salt)?;
    f.read_exact(&mut salt_hkdf)?;
    Ok((u32::from_le_bytes(numiter), salt, salt_hkdf))
}

/// Pick an iteration count that costs roughly 50ms on this machine, with a
/// floor of 10000.
fn calibrate_iterations(rootcap_len: usize) -> u32 {
    let start = std::time::Instant::now();
    let mut count: u64 = 0;
    let probe_pass = vec![b'a'; rootcap_len];
    let probe_salt = [b'b'; 32];
    loop {
        let mut out = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(&probe_pass, &probe_salt, 10_000, &mut out);
        count += 10_000;
        if start.elapsed().as_secs_f64() > 0.05 {
            break;
        }
    }
    ((count as f64 / start.elapsed().as_secs_f64()) as u64)
        .clamp(10_000, u32::MAX as u64) as u32
}
