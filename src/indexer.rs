//! File tree listing for the content repository.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("cannot stat {}: {source}", .path.display())]
    Root {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot read metadata for {}: {source}", .path.display())]
    Entry {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One file or directory in the listing.
///
/// Field names on the wire are PascalCase for compatibility with existing
/// editor frontends.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct FileNode {
    pub name: String,
    pub path: PathBuf,
    pub is_dir: bool,
    pub size: u64,
    pub modified_time: DateTime<Utc>,
    pub children: Vec<FileNode>,
}

impl FileNode {
    fn from_metadata(path: PathBuf, metadata: &std::fs::Metadata) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        let modified_time = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_default();
        Self {
            name,
            path,
            is_dir: metadata.is_dir(),
            size: metadata.len(),
            modified_time,
            children: Vec::new(),
        }
    }

    /// Find a direct child by name.
    pub fn child(&self, name: &str) -> Option<&FileNode> {
        self.children.iter().find(|c| c.name == name)
    }
}

/// Build the file tree rooted at `root`.
///
/// Traversal uses an explicit stack, so arbitrarily deep trees cannot
/// exhaust the call stack. Symlinks are listed but never followed.
/// Children are ordered by name.
pub fn build_tree(root: &Path) -> Result<FileNode, IndexError> {
    let metadata = std::fs::metadata(root).map_err(|source| IndexError::Root {
        path: root.to_path_buf(),
        source,
    })?;

    // Flat arena; parents always precede their children.
    let mut nodes = vec![FileNode::from_metadata(root.to_path_buf(), &metadata)];
    let mut child_ids: Vec<Vec<usize>> = vec![Vec::new()];
    let mut stack = vec![0usize];

    while let Some(idx) = stack.pop() {
        if !nodes[idx].is_dir {
            continue;
        }
        let entries = match std::fs::read_dir(&nodes[idx].path) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!(path = %nodes[idx].path.display(), error = %e, "skipping unreadable directory");
                continue;
            }
        };
        for entry in entries {
            let entry = entry.map_err(|source| IndexError::Entry {
                path: nodes[idx].path.clone(),
                source,
            })?;
            let path = entry.path();
            let metadata = entry.metadata().map_err(|source| IndexError::Entry {
                path: path.clone(),
                source,
            })?;
            let child = nodes.len();
            nodes.push(FileNode::from_metadata(path, &metadata));
            child_ids.push(Vec::new());
            child_ids[idx].push(child);
            stack.push(child);
        }
    }

    // Assemble bottom-up: every child index is larger than its parent's.
    for idx in (0..nodes.len()).rev() {
        if child_ids[idx].is_empty() {
            continue;
        }
        let mut children: Vec<FileNode> = child_ids[idx]
            .iter()
            .map(|&c| std::mem::take(&mut nodes[c]))
            .collect();
        children.sort_by(|a, b| a.name.cmp(&b.name));
        nodes[idx].children = children;
    }

    Ok(std::mem::take(&mut nodes[0]))
}
