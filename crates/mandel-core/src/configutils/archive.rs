//! tar.gz packing of config directories.

use crate::error::{CoreError, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::path::Path;

/// Pack the contents of `dir` into an in-memory tar.gz archive. Paths in the
/// archive are relative to `dir`.
pub fn compress_dir(dir: &Path) -> Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder
        .append_dir_all(".", dir)
        .map_err(|e| CoreError::Archive(format!("failed to pack {}: {e}", dir.display())))?;

    let encoder = builder
        .into_inner()
        .map_err(|e| CoreError::Archive(format!("failed to finish archive: {e}")))?;
    Ok(encoder.finish()?)
}

/// Unpack a tar.gz archive into `dest`, creating it if needed.
///
/// Returns the number of file bytes written.
///
/// # Errors
/// [`CoreError::Archive`] on malformed data or an entry that would land
/// outside `dest`.
pub fn extract_archive(data: &[u8], dest: &Path) -> Result<u64> {
    std::fs::create_dir_all(dest)?;

    let mut archive = tar::Archive::new(GzDecoder::new(data));
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);

    let mut total = 0u64;
    let entries = archive
        .entries()
        .map_err(|e| CoreError::Archive(format!("unreadable archive: {e}")))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| CoreError::Archive(format!("bad entry: {e}")))?;
        let path = entry
            .path()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let size = entry.header().size().unwrap_or(0);

        let unpacked = entry
            .unpack_in(dest)
            .map_err(|e| CoreError::Archive(format!("failed to unpack {path}: {e}")))?;
        if !unpacked {
            return Err(CoreError::Archive(format!(
                "entry {path} escapes {}",
                dest.display()
            )));
        }
        if entry.header().entry_type().is_file() {
            total += size;
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_pack_and_unpack_tree() {
        let src = tempfile::tempdir().unwrap();
        fs::create_dir_all(src.path().join("google-chrome/Default")).unwrap();
        fs::write(src.path().join("google-chrome/Default/Cookies"), b"cookie-db").unwrap();
        fs::write(src.path().join("top-level.txt"), b"hello").unwrap();
        fs::create_dir_all(src.path().join("empty-dir")).unwrap();

        let packed = compress_dir(src.path()).unwrap();

        let dst = tempfile::tempdir().unwrap();
        let written = extract_archive(&packed, dst.path()).unwrap();
        assert_eq!(written, 9 + 5);
        assert_eq!(
            fs::read(dst.path().join("google-chrome/Default/Cookies")).unwrap(),
            b"cookie-db"
        );
        assert_eq!(fs::read(dst.path().join("top-level.txt")).unwrap(), b"hello");
        assert!(dst.path().join("empty-dir").is_dir());
    }

    #[test]
    fn test_escaping_entry_rejected() {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let body = b"owned";
        let mut header = tar::Header::new_old();
        let name = b"../escaped.txt";
        header.as_old_mut().name[..name.len()].copy_from_slice(name);
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();
        builder.append(&header, &body[..]).unwrap();
        let packed = builder.into_inner().unwrap().finish().unwrap();

        let root = tempfile::tempdir().unwrap();
        let dest = root.path().join("inner");
        let err = extract_archive(&packed, &dest).unwrap_err();
        assert!(matches!(err, CoreError::Archive(_)));
        assert!(!root.path().join("escaped.txt").exists());
    }

    #[test]
    fn test_garbage_rejected() {
        let dst = tempfile::tempdir().unwrap();
        assert!(extract_archive(b"not an archive", dst.path()).is_err());
    }
}
