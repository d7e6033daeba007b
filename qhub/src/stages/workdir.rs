//! Execution directory preparation and output collection.

use crate::config::IdempotencyKeyMode;
use crate::utils::{normalize_semantic, sha256_hex, KeyHasher};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

/// Reads every regular file under `root`, keyed by `/`-separated relative path.
///
/// Directories listed in `exclude` are skipped. A missing root yields an
/// empty map.
pub(crate) async fn collect_tree(
    root: &Path,
    exclude: &[PathBuf],
) -> io::Result<BTreeMap<String, Vec<u8>>> {
    let mut files = BTreeMap::new();
    if !tokio::fs::metadata(root).await.is_ok_and(|m| m.is_dir()) {
        return Ok(files);
    }

    let mut pending = vec![(root.to_path_buf(), String::new())];
    while let Some((dir, rel)) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if exclude.iter().any(|e| e == &path) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let rel_name = if rel.is_empty() {
                name
            } else {
                format!("{rel}/{name}")
            };
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push((path, rel_name));
            } else if file_type.is_file() {
                files.insert(rel_name, tokio::fs::read(&path).await?);
            }
        }
    }
    Ok(files)
}

/// Digest of a file tree under the given key mode.
pub(crate) async fn tree_digest(root: &Path, mode: IdempotencyKeyMode) -> io::Result<String> {
    let files = collect_tree(root, &[]).await?;
    let mut hasher = KeyHasher::new();
    for (name, content) in &files {
        let digest = match mode {
            IdempotencyKeyMode::ExactBytes => sha256_hex(content),
            IdempotencyKeyMode::Semantic => sha256_hex(&normalize_semantic(name, content)),
        };
        hasher.part(name).part(digest);
    }
    Ok(hasher.finish())
}

/// Copies a directory tree.
pub(crate) async fn copy_tree(from: &Path, to: &Path) -> io::Result<()> {
    tokio::fs::create_dir_all(to).await?;
    for (name, content) in collect_tree(from, &[]).await? {
        let target = name.split('/').fold(to.to_path_buf(), |p, s| p.join(s));
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(target, content).await?;
    }
    Ok(())
}

/// Removes `dir` if present and recreates it empty.
pub(crate) async fn reset_dir(dir: &Path) -> io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    tokio::fs::create_dir_all(dir).await
}
