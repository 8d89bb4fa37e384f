//! Candidate discovery for the four recovery strategies.
//!
//! Each strategy walks one opened filesystem and hands every candidate to a
//! visitor. The visitor returns [`ControlFlow::Break`] to stop the walk
//! (the run was superseded); everything else keeps going.

use std::collections::HashSet;
use std::ops::ControlFlow;

use regex::RegexSet;

use crate::core::Strategy;
use crate::fs::{FileSystem, FsEntry, FsResult};

/// Trash and recycle directory names, matched case-insensitively against
/// whole path components
pub const DEFAULT_RECYCLE_PATTERNS: &[&str] = &[
    r"\$RECYCLE\.BIN",
    r"RECYCLER",
    r"RECYCLED",
    r"\.Trash(-\d+)?",
    r"\.Trashes",
    r"Trash",
];

/// Default directory depth limit for tree walks
pub const DEFAULT_MAX_DEPTH: usize = 64;

// ============================================================================
// Candidates
// ============================================================================

/// Which byte range of an entry a candidate covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extent {
    /// `[0, size)`
    Logical,
    /// `[size, allocated)`
    Slack,
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub entry: FsEntry,
    pub extent: Extent,
    pub strategy: Strategy,
}

impl Candidate {
    fn new(entry: &FsEntry, extent: Extent, strategy: Strategy) -> Self {
        Self {
            entry: entry.clone(),
            extent,
            strategy,
        }
    }

    /// Bytes this candidate would recover
    pub fn len(&self) -> u64 {
        match self.extent {
            Extent::Logical => self.entry.size.min(self.entry.allocated_len()),
            Extent::Slack => self.entry.slack_len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read_at(&self, fs: &dyn FileSystem, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        match self.extent {
            Extent::Logical => fs.read_file_at(&self.entry, offset, buf),
            Extent::Slack => fs.read_slack_at(&self.entry, offset, buf),
        }
    }

    /// Volume offset of the first recovered byte
    pub fn volume_offset(&self) -> Option<u64> {
        match self.extent {
            Extent::Logical => self.entry.offset_of(0),
            Extent::Slack => self.entry.offset_of(self.entry.size),
        }
    }

    pub fn original_name(&self) -> Option<&str> {
        match self.extent {
            Extent::Logical if !self.entry.name.is_empty() => Some(&self.entry.name),
            _ => None,
        }
    }
}

// ============================================================================
// Recycle matching
// ============================================================================

#[derive(Debug, Clone)]
pub struct RecycleMatcher {
    set: RegexSet,
}

impl RecycleMatcher {
    pub fn new<I, S>(patterns: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let anchored = patterns
            .into_iter()
            .map(|p| format!("(?i)^(?:{})$", p.as_ref()));
        Ok(Self {
            set: RegexSet::new(anchored)?,
        })
    }

    pub fn is_match(&self, component: &str) -> bool {
        self.set.is_match(component)
    }

    /// Whether any directory above the entry named by `path` is a trash dir
    pub fn in_trash(&self, path: &str) -> bool {
        let mut components: Vec<&str> = path.split('/').collect();
        components.pop();
        components.iter().any(|c| self.is_match(c))
    }
}

impl Default for RecycleMatcher {
    fn default() -> Self {
        Self {
            set: RegexSet::new(
                DEFAULT_RECYCLE_PATTERNS
                    .iter()
                    .map(|p| format!("(?i)^(?:{})$", p)),
            )
            .unwrap_or_else(|_| RegexSet::empty()),
        }
    }
}

// ============================================================================
// Tree walking
// ============================================================================

/// Depth-first directory walk guarded against loops and runaway depth
pub struct TreeWalker<'a> {
    fs: &'a dyn FileSystem,
    max_depth: usize,
    visited: HashSet<u64>,
}

impl<'a> TreeWalker<'a> {
    pub fn new(fs: &'a dyn FileSystem, max_depth: usize) -> Self {
        Self {
            fs,
            max_depth,
            visited: HashSet::new(),
        }
    }

    /// Visit every entry below the root, parents before children
    pub fn walk<F>(&mut self, visit: &mut F) -> ControlFlow<()>
    where
        F: FnMut(&FsEntry) -> ControlFlow<()>,
    {
        match self.fs.root() {
            Ok(root) => self.walk_dir(&root, 0, visit),
            Err(e) => {
                tracing::debug!(error = %e, "Cannot open root directory");
                ControlFlow::Continue(())
            }
        }
    }

    fn walk_dir<F>(&mut self, dir: &FsEntry, depth: usize, visit: &mut F) -> ControlFlow<()>
    where
        F: FnMut(&FsEntry) -> ControlFlow<()>,
    {
        if depth > self.max_depth {
            tracing::debug!(path = %dir.path, depth, "Depth limit reached");
            return ControlFlow::Continue(());
        }
        // directories are identified by where their data lives
        if let Some(offset) = dir.first_data_offset() {
            if !self.visited.insert(offset) {
                tracing::trace!(path = %dir.path, "Directory already visited");
                return ControlFlow::Continue(());
            }
        }

        let children = match self.fs.read_dir(dir) {
            Ok(children) => children,
            Err(e) => {
                tracing::debug!(path = %dir.path, error = %e, "Unreadable directory");
                return ControlFlow::Continue(());
            }
        };
        for child in &children {
            if child.is_dot() {
                continue;
            }
            visit(child)?;
            if child.is_dir() {
                self.walk_dir(child, depth + 1, visit)?;
            }
        }
        ControlFlow::Continue(())
    }
}

// ============================================================================
// Strategies
// ============================================================================

/// What a strategy needs besides the filesystem
pub struct Scope<'a> {
    pub fs: &'a dyn FileSystem,
    pub min_size: u64,
    pub max_depth: usize,
    pub recycle: &'a RecycleMatcher,
}

/// Run `strategy` over the filesystem in `scope`
pub fn run<V>(strategy: Strategy, scope: &Scope<'_>, visit: &mut V) -> ControlFlow<()>
where
    V: FnMut(Candidate) -> ControlFlow<()>,
{
    match strategy {
        Strategy::DirectoryWalk => directory_walk(scope, visit),
        Strategy::InodeScan => inode_scan(scope, visit),
        Strategy::FileSlack => file_slack(scope, visit),
        Strategy::RecycleBin => recycle_bin(scope, visit),
    }
}

fn directory_walk<V>(scope: &Scope<'_>, visit: &mut V) -> ControlFlow<()>
where
    V: FnMut(Candidate) -> ControlFlow<()>,
{
    TreeWalker::new(scope.fs, scope.max_depth).walk(&mut |entry: &FsEntry| {
        if entry.is_file() && entry.is_deleted() {
            visit(Candidate::new(entry, Extent::Logical, Strategy::DirectoryWalk))
        } else {
            ControlFlow::Continue(())
        }
    })
}

fn inode_scan<V>(scope: &Scope<'_>, visit: &mut V) -> ControlFlow<()>
where
    V: FnMut(Candidate) -> ControlFlow<()>,
{
    let Some(range) = scope.fs.inode_range() else {
        tracing::debug!(kind = %scope.fs.kind(), "No inode table, skipping inode scan");
        return ControlFlow::Continue(());
    };
    for inode in range {
        let entry = match scope.fs.open_inode(inode) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::trace!(inode, error = %e, "Unreadable inode");
                continue;
            }
        };
        if entry.is_file() && entry.is_deleted() && entry.size > scope.min_size {
            visit(Candidate::new(&entry, Extent::Logical, Strategy::InodeScan))?;
        }
    }
    ControlFlow::Continue(())
}

fn file_slack<V>(scope: &Scope<'_>, visit: &mut V) -> ControlFlow<()>
where
    V: FnMut(Candidate) -> ControlFlow<()>,
{
    TreeWalker::new(scope.fs, scope.max_depth).walk(&mut |entry: &FsEntry| {
        if entry.is_file() && !entry.is_deleted() && entry.slack_len() > scope.min_size {
            visit(Candidate::new(entry, Extent::Slack, Strategy::FileSlack))
        } else {
            ControlFlow::Continue(())
        }
    })
}

fn recycle_bin<V>(scope: &Scope<'_>, visit: &mut V) -> ControlFlow<()>
where
    V: FnMut(Candidate) -> ControlFlow<()>,
{
    TreeWalker::new(scope.fs, scope.max_depth).walk(&mut |entry: &FsEntry| {
        if entry.is_file() && scope.recycle.in_trash(&entry.path) {
            visit(Candidate::new(entry, Extent::Logical, Strategy::RecycleBin))
        } else {
            ControlFlow::Continue(())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recycle_names_match_whole_components() {
        let matcher = RecycleMatcher::default();
        assert!(matcher.is_match("$Recycle.Bin"));
        assert!(matcher.is_match("RECYCLER"));
        assert!(matcher.is_match(".Trash-1000"));
        assert!(matcher.is_match(".trashes"));
        assert!(matcher.is_match("trash"));
        assert!(!matcher.is_match("TrashCompactor"));
        assert!(!matcher.is_match("docs"));
    }

    #[test]
    fn only_parent_directories_count() {
        let matcher = RecycleMatcher::default();
        assert!(matcher.in_trash("home/.Trash-1000/files/a.jpg"));
        assert!(matcher.in_trash("RECYCLED/DC1.TXT"));
        assert!(!matcher.in_trash("Trash"));
        assert!(!matcher.in_trash("docs/trash.txt"));
    }

    #[test]
    fn custom_patterns_are_validated() {
        assert!(RecycleMatcher::new(["Deleted Items"]).is_ok());
        assert!(RecycleMatcher::new(["(unclosed"]).is_err());
        let custom = RecycleMatcher::new(["Deleted Items"]).unwrap();
        assert!(custom.in_trash("Deleted Items/old.doc"));
        assert!(!custom.in_trash(".Trash/old.doc"));
    }
}
