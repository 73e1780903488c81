//! SHA-256 digests, computed in process.

use std::io::Read;

use camino::Utf8Path;
use sha2::{Digest, Sha256};

/// Hex SHA-256 of a file's bytes, streamed.
pub fn sha256_file(path: &Utf8Path) -> Result<String, std::io::Error> {
    let mut file = std::fs::File::open(path.as_std_path())?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest = hasher.finalize();
    Ok(digest.iter().fold(String::with_capacity(64), |mut acc, b| {
        use std::fmt::Write;
        let _ = write!(acc, "{b:02x}");
        acc
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;

    #[test]
    fn digest_matches_known_vector() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("f")).unwrap();
        std::fs::write(path.as_std_path(), b"abc").unwrap();
        // SHA-256("abc")
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn empty_file_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("empty")).unwrap();
        std::fs::write(path.as_std_path(), b"").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn identical_bytes_share_digest() {
        let dir = tempfile::tempdir().unwrap();
        let a = Utf8PathBuf::from_path_buf(dir.path().join("a")).unwrap();
        let b = Utf8PathBuf::from_path_buf(dir.path().join("b")).unwrap();
        std::fs::write(a.as_std_path(), b"same-bytes").unwrap();
        std::fs::write(b.as_std_path(), b"same-bytes").unwrap();
        assert_eq!(sha256_file(&a).unwrap(), sha256_file(&b).unwrap());
    }
}
