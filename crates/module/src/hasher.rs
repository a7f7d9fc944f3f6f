use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

const READ_CHUNK: usize = 4096;

/// Lowercase hex SHA-256 of the file at `path`, read in fixed 4 KiB chunks so
/// large archives never sit in memory whole.
pub fn digest_file(path: impl AsRef<Path>) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; READ_CHUNK];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// First 16 hex characters, used in log lines.
pub fn short(digest: &str) -> &str {
    digest.get(..16).unwrap_or(digest)
}
