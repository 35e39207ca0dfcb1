//! Library directory walker
//!
//! Wraps walkdir in an iterator of [`WalkEvent`]s. The caller decides what
//! to do with each event: stop by breaking out of the loop, prune a subtree
//! with [`LibraryWalk::skip_current_dir`], or carry on.

use std::fs::{self, Metadata};
use std::io;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{Result, SweepError};

/// One step of a library walk
#[derive(Debug)]
pub enum WalkEvent {
    /// Entered a directory (the root itself is depth 0)
    Dir { path: PathBuf, depth: usize },
    /// A non-directory entry, with symlinks resolved for metadata
    File { path: PathBuf, metadata: Metadata },
    /// An entry that could not be read
    Error {
        path: Option<PathBuf>,
        depth: usize,
        error: io::Error,
    },
}

/// Iterator over a library root in file-name order
pub struct LibraryWalk {
    inner: walkdir::IntoIter,
}

impl LibraryWalk {
    /// Walk `root`, pruning hidden and NAS metadata folders
    pub fn new(root: &Path) -> Self {
        Self {
            inner: WalkDir::new(root)
                .follow_links(false)
                .sort_by_file_name()
                .into_iter(),
        }
    }

    /// Do not descend into the directory most recently yielded
    pub fn skip_current_dir(&mut self) {
        self.inner.skip_current_dir();
    }
}

fn is_hidden_dir(name: &str) -> bool {
    name.starts_with('.') || name.starts_with('@') || name == "#recycle"
}

impl Iterator for LibraryWalk {
    type Item = WalkEvent;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.inner.next()? {
                Ok(entry) => entry,
                Err(err) => {
                    let path = err.path().map(Path::to_path_buf);
                    let depth = err.depth();
                    return Some(WalkEvent::Error {
                        path,
                        depth,
                        error: io::Error::from(err),
                    });
                }
            };

            if entry.file_type().is_dir() {
                let hidden = entry
                    .file_name()
                    .to_str()
                    .map(is_hidden_dir)
                    .unwrap_or(false);
                if entry.depth() > 0 && hidden {
                    self.inner.skip_current_dir();
                    continue;
                }
                let depth = entry.depth();
                return Some(WalkEvent::Dir {
                    path: entry.into_path(),
                    depth,
                });
            }

            let depth = entry.depth();
            let path = entry.into_path();
            return Some(match fs::metadata(&path) {
                Ok(metadata) => WalkEvent::File { path, metadata },
                Err(error) => WalkEvent::Error {
                    path: Some(path),
                    depth,
                    error,
                },
            });
        }
    }
}

/// Fail with an access error when a configured root cannot be listed
pub fn check_root(root: &Path) -> Result<()> {
    fs::read_dir(root)
        .map(|_| ())
        .map_err(|e| SweepError::access(root, e))
}
