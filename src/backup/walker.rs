//! Lazy walk of the site tree that keeps going past entries it cannot read.

use regex::Regex;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    /// Path below the walk root; becomes the entry name under `files/`.
    pub relative: PathBuf,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalkEntry {
    Included(SourceFile),
    Excluded { path: PathBuf, relative: PathBuf },
    /// Never followed, never counted.
    Symlink(PathBuf),
    Unreadable { path: PathBuf, error: String },
}

pub struct SourceWalker<'a> {
    root: PathBuf,
    patterns: &'a [Regex],
    entries: walkdir::IntoIter,
}

impl<'a> SourceWalker<'a> {
    pub fn new(root: &Path, patterns: &'a [Regex]) -> Self {
        Self {
            root: root.to_path_buf(),
            patterns,
            entries: WalkDir::new(root)
                .follow_links(false)
                .min_depth(1)
                .sort_by_file_name()
                .into_iter(),
        }
    }

    /// Patterns are tried against the absolute path and the root-relative path.
    pub fn is_excluded(&self, path: &Path, relative: &Path) -> bool {
        let absolute = path.to_string_lossy();
        let relative = relative.to_string_lossy();
        self.patterns
            .iter()
            .any(|p| p.is_match(&absolute) || p.is_match(&relative))
    }
}

impl Iterator for SourceWalker<'_> {
    type Item = WalkEntry;

    fn next(&mut self) -> Option<WalkEntry> {
        loop {
            let entry = match self.entries.next()? {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e
                        .path()
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|| self.root.clone());
                    return Some(WalkEntry::Unreadable {
                        path,
                        error: e.to_string(),
                    });
                }
            };

            if entry.path_is_symlink() {
                return Some(WalkEntry::Symlink(entry.into_path()));
            }
            if !entry.file_type().is_file() {
                continue;
            }

            let relative = entry
                .path()
                .strip_prefix(&self.root)
                .map(Path::to_path_buf)
                .unwrap_or_else(|_| entry.path().to_path_buf());
            if self.is_excluded(entry.path(), &relative) {
                return Some(WalkEntry::Excluded {
                    path: entry.into_path(),
                    relative,
                });
            }

            return Some(match entry.metadata() {
                Ok(meta) => WalkEntry::Included(SourceFile {
                    path: entry.into_path(),
                    relative,
                    size: meta.len(),
                }),
                Err(e) => WalkEntry::Unreadable {
                    path: entry.into_path(),
                    error: e.to_string(),
                },
            });
        }
    }
}
