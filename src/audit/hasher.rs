//! CP-019: BLAKE3 fingerprints for artifact trees and written roles.
//!
//! A tree fingerprint hashes `path\0blake3:file\n` for each file in path
//! order, so an in-memory tree and the same files on disk hash equal.

use crate::convert::artifact::ArtifactTree;
use crate::error::{ConvertError, Result};
use std::io::Read;
use std::path::Path;

const STREAM_BUF_SIZE: usize = 65536;

/// Directory names never included in a directory fingerprint.
const SKIP_DIRS: &[&str] = &[".cookport"];

/// Hash a string. Returns `"blake3:{hex}"`.
pub fn hash_string(s: &str) -> String {
    format!("blake3:{}", blake3::hash(s.as_bytes()).to_hex())
}

/// Hash a file's contents. Returns `"blake3:{hex}"`.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path).map_err(|e| ConvertError::io(path, e))?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = [0u8; STREAM_BUF_SIZE];
    loop {
        let n = file.read(&mut buf).map_err(|e| ConvertError::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("blake3:{}", hasher.finalize().to_hex()))
}

/// Fingerprint of a candidate artifact.
pub fn hash_tree(tree: &ArtifactTree) -> String {
    combine(tree.iter().map(|(path, content)| (path.to_string(), hash_string(content))))
}

/// Fingerprint of a role directory, comparable with [`hash_tree`].
/// Skips symlinks and the `.cookport` audit directory.
pub fn hash_directory(path: &Path) -> Result<String> {
    let mut entries: Vec<(String, String)> = Vec::new();

    fn walk(base: &Path, current: &Path, entries: &mut Vec<(String, String)>) -> Result<()> {
        let read_dir = std::fs::read_dir(current).map_err(|e| ConvertError::io(current, e))?;
        for entry in read_dir.filter_map(|e| e.ok()) {
            let ft = entry.file_type().map_err(|e| ConvertError::io(entry.path(), e))?;
            if ft.is_symlink() {
                continue;
            }
            let path = entry.path();
            if ft.is_dir() {
                let name = entry.file_name();
                if SKIP_DIRS.iter().any(|s| name == *s) {
                    continue;
                }
                walk(base, &path, entries)?;
            } else if ft.is_file() {
                let rel = path
                    .strip_prefix(base)
                    .map_err(|e| ConvertError::Parse(format!("path prefix error: {}", e)))?
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                entries.push((rel, hash_file(&path)?));
            }
        }
        Ok(())
    }

    walk(path, path, &mut entries)?;
    entries.sort();
    Ok(combine(entries.into_iter()))
}

fn combine(entries: impl Iterator<Item = (String, String)>) -> String {
    let mut hasher = blake3::Hasher::new();
    for (rel, hash) in entries {
        hasher.update(rel.as_bytes());
        hasher.update(b"\0");
        hasher.update(hash.as_bytes());
        hasher.update(b"\n");
    }
    format!("blake3:{}", hasher.finalize().to_hex())
}
