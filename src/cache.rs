use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};

use crate::interface::Options;

/// Compute the deterministic on-disk cache path for a request.
///
/// The content address is the SHA-1 digest of
/// `text + "/" + svc_id + "/" + sorted "key=value" pairs joined by ";"`,
/// formatted as `<svcId>-<8>-<8>-<8>-<8>-<12>.mp3` so the filename stays
/// human-scannable. Identical normalized inputs always yield the same
/// path; this is the contract the busy set and failure memo hang off.
pub fn cache_path(cache_dir: &Path, svc_id: &str, text: &str, options: &Options) -> PathBuf {
    let mut pairs: Vec<_> = options
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect();
    pairs.sort();

    let hash_input = format!("{}/{}/{}", text, svc_id, pairs.join(";"));

    let digest = Sha1::digest(hash_input.as_bytes());
    let mut hex = String::with_capacity(40);
    for byte in digest {
        // writing to a String cannot fail
        let _ = write!(hex, "{byte:02x}");
    }

    cache_dir.join(format!(
        "{svc_id}-{}-{}-{}-{}-{}.mp3",
        &hex[..8],
        &hex[8..16],
        &hex[16..24],
        &hex[24..32],
        &hex[32..],
    ))
}
