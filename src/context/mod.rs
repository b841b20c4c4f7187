//! Build contexts: named, ignore-filtered file trees.

pub mod ignore;

use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::ContextError;
use ignore::IgnoreSet;

/// A named, directory-rooted file tree, filtered by an ignore pattern list.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub name: String,
    pub base_dir: PathBuf,
    pub umask: Option<u32>,
    pub ignore_file: Option<PathBuf>,
    pub ignore: Vec<String>,
}

/// A single filtered tree entry, in the canonical form hashed into the
/// context's `files_hash`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Entry {
    File {
        path: String,
        mode: u32,
        size: u64,
        content_hash: String,
    },
    Dir {
        path: String,
        mode: u32,
    },
    Symlink {
        path: String,
        target: String,
    },
}

impl Entry {
    fn sort_key(&self) -> &str {
        match self {
            Entry::File { path, .. } => path,
            Entry::Dir { path, .. } => path,
            Entry::Symlink { path, .. } => path,
        }
    }
}

impl BuildContext {
    /// Walks the context root, applying ignore patterns (own `ignore` list
    /// plus the contents of `ignore_file`, if present), and computes a
    /// rolling hash over the filtered, sorted entry list.
    pub fn files_hash(&self) -> Result<String, ContextError> {
        if !self.base_dir.is_dir() {
            return Err(ContextError::MissingBaseDir {
                name: self.name.clone(),
                base_dir: self.base_dir.display().to_string(),
            });
        }

        let mut patterns = self.ignore.clone();
        if let Some(ignore_file) = &self.ignore_file {
            if let Ok(content) = fs::read_to_string(ignore_file) {
                patterns.extend(content.lines().map(str::to_string));
            }
        }
        let ignore_set = IgnoreSet::new(&patterns).map_err(|reason| ContextError::BadIgnorePattern {
            context: self.name.clone(),
            pattern: String::new(),
            reason,
        })?;

        let mut entries = Vec::new();
        for dirent in WalkDir::new(&self.base_dir)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = dirent.path();
            if path == self.base_dir {
                continue;
            }
            let rel = path
                .strip_prefix(&self.base_dir)
                .unwrap_or(path)
                .to_string_lossy()
                .replace('\\', "/");

            if ignore_set.is_ignored(&rel) {
                continue;
            }

            let metadata = fs::symlink_metadata(path).map_err(|source| ContextError::Unreadable {
                context: self.name.clone(),
                path: rel.clone(),
                source,
            })?;

            let file_type = metadata.file_type();
            if file_type.is_symlink() {
                let target = fs::read_link(path)
                    .map_err(|source| ContextError::Unreadable {
                        context: self.name.clone(),
                        path: rel.clone(),
                        source,
                    })?
                    .to_string_lossy()
                    .replace('\\', "/");
                entries.push(Entry::Symlink { path: rel, target });
            } else if file_type.is_dir() {
                let mode = apply_umask(metadata.permissions().mode(), self.umask);
                entries.push(Entry::Dir { path: rel, mode });
            } else {
                let mode = apply_umask(metadata.permissions().mode(), self.umask);
                let content = fs::read(path).map_err(|source| ContextError::Unreadable {
                    context: self.name.clone(),
                    path: rel.clone(),
                    source,
                })?;
                let content_hash = hex::encode(Sha256::digest(&content));
                entries.push(Entry::File {
                    path: rel,
                    mode,
                    size: metadata.len(),
                    content_hash,
                });
            }
        }

        entries.sort_by(|a, b| a.sort_key().cmp(b.sort_key()));

        let mut hasher = Sha256::new();
        for entry in &entries {
            feed_entry(&mut hasher, entry);
        }
        Ok(hex::encode(hasher.finalize()))
    }
}

/// Umask semantics: if `umask` is `None`, preserve raw mode bits;
/// otherwise copy the owner bits to group/other, then clear bits set in
/// `umask`.
fn apply_umask(mode: u32, umask: Option<u32>) -> u32 {
    let perm_bits = mode & 0o777;
    match umask {
        None => perm_bits,
        Some(umask) => {
            let owner = (perm_bits >> 6) & 0o7;
            let broadcast = owner | (owner << 3) | (owner << 6);
            broadcast & !umask & 0o777
        }
    }
}

fn feed_entry(hasher: &mut Sha256, entry: &Entry) {
    match entry {
        Entry::File {
            path,
            mode,
            size,
            content_hash,
        } => {
            hasher.update(b"file\0");
            hasher.update(path.as_bytes());
            hasher.update(b"\0");
            hasher.update(format!("{:o}", mode).as_bytes());
            hasher.update(b"\0");
            hasher.update(size.to_le_bytes());
            hasher.update(b"\0");
            hasher.update(content_hash.as_bytes());
        }
        Entry::Dir { path, mode } => {
            hasher.update(b"dir\0");
            hasher.update(path.as_bytes());
            hasher.update(b"\0");
            hasher.update(format!("{:o}", mode).as_bytes());
        }
        Entry::Symlink { path, target } => {
            hasher.update(b"symlink\0");
            hasher.update(path.as_bytes());
            hasher.update(b"\0");
            hasher.update(target.as_bytes());
        }
    }
    hasher.update(b"\n");
}

pub fn resolve_path(base: &Path, rel: &str) -> PathBuf {
    base.join(rel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn ctx(dir: &Path, ignore: Vec<&str>) -> BuildContext {
        BuildContext {
            name: "default".to_string(),
            base_dir: dir.to_path_buf(),
            umask: None,
            ignore_file: None,
            ignore: ignore.into_iter().map(str::to_string).collect(),
        }
    }

    #[test]
    fn hash_changes_when_a_non_ignored_file_changes() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "hello").unwrap();
        let c = ctx(dir.path(), vec![]);
        let h1 = c.files_hash().unwrap();
        fs::write(dir.path().join("a.txt"), "hello!").unwrap();
        let h2 = c.files_hash().unwrap();
        assert_ne!(h1, h2);
    }

    #[test]
    fn hash_is_stable_for_identical_inputs() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "hello").unwrap();
        let c = ctx(dir.path(), vec![]);
        assert_eq!(c.files_hash().unwrap(), c.files_hash().unwrap());
    }

    #[test]
    fn ignored_file_changes_do_not_affect_hash() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "hello").unwrap();
        fs::write(dir.path().join("b.log"), "noisy").unwrap();
        let c = ctx(dir.path(), vec!["*.log"]);
        let h1 = c.files_hash().unwrap();
        fs::write(dir.path().join("b.log"), "noisier").unwrap();
        let h2 = c.files_hash().unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn ignore_and_negate_pattern_grid() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a"), "1").unwrap();
        fs::write(dir.path().join("keep"), "1").unwrap();
        fs::create_dir_all(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/keep"), "1").unwrap();
        let c = ctx(dir.path(), vec!["*", "!keep", "!sub/keep"]);
        let h1 = c.files_hash().unwrap();
        fs::write(dir.path().join("keep"), "2").unwrap();
        let h2 = c.files_hash().unwrap();
        assert_ne!(h1, h2, "changing a kept file must change the hash");

        fs::write(dir.path().join("keep"), "1").unwrap();
        fs::write(dir.path().join("a"), "changed").unwrap();
        let h3 = c.files_hash().unwrap();
        assert_eq!(h1, h3, "changing an ignored file must not change the hash");
    }

    #[test]
    fn missing_base_dir_is_an_error() {
        let c = ctx(Path::new("/no/such/dir/tplbuild-test"), vec![]);
        assert!(c.files_hash().is_err());
    }
}
