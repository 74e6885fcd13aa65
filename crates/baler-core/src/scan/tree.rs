use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::filters::Filters;
use crate::error::{BalerError, Result};

/// A directory listing node. Ids encode the path from the root:
/// `"0"` for the root, `"{parent_id}_{index}"` for children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNode {
    pub id: String,
    pub name: String,
    pub is_dir: bool,
    /// File size, or the sum of the direct file children once expanded.
    pub size: u64,
    pub children: Vec<TreeNode>,
    pub traversed: bool,
    /// More children existed than were kept.
    pub truncated: bool,
}

impl TreeNode {
    fn new(id: String, name: String, is_dir: bool, size: u64) -> Self {
        Self {
            id,
            name,
            is_dir,
            size,
            children: Vec::new(),
            traversed: false,
            truncated: false,
        }
    }
}

/// Lazily expanded, size-bounded view of a directory tree.
#[derive(Debug, Clone)]
pub struct ScanTree {
    root_path: PathBuf,
    root: TreeNode,
    filters: Option<Filters>,
    max_children: usize,
    max_nodes: usize,
    node_count: usize,
}

impl ScanTree {
    pub fn new(root_path: impl Into<PathBuf>, max_children: usize, max_nodes: usize) -> Self {
        let root_path = root_path.into();
        let name = super::root_label(&root_path);
        Self {
            root_path,
            root: TreeNode::new("0".into(), name, true, 0),
            filters: None,
            max_children: max_children.max(1),
            max_nodes: max_nodes.max(1),
            node_count: 1,
        }
    }

    /// Hide excluded directories and files.
    pub fn with_filters(mut self, filters: Filters) -> Self {
        self.filters = Some(filters);
        self
    }

    pub fn root(&self) -> &TreeNode {
        &self.root
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }

    pub fn find(&self, id: &str) -> Option<&TreeNode> {
        let indices = parse_id(id)?;
        let mut node = &self.root;
        for i in indices {
            node = node.children.get(i)?;
        }
        Some(node)
    }

    fn find_mut(&mut self, id: &str) -> Option<(&mut TreeNode, PathBuf)> {
        let indices = parse_id(id)?;
        let mut node = &mut self.root;
        let mut path = self.root_path.clone();
        for i in indices {
            node = node.children.get_mut(i)?;
            path.push(&node.name);
        }
        Some((node, path))
    }

    /// Read the children of directory `id`.
    ///
    /// Returns `Ok(false)` when the node was already traversed, is a file,
    /// or the node budget is spent.
    pub fn expand(&mut self, id: &str) -> Result<bool> {
        let budget = self.max_nodes.saturating_sub(self.node_count);
        let max_children = self.max_children;
        let filters = self.filters.clone();
        let (node, path) = self
            .find_mut(id)
            .ok_or_else(|| BalerError::Other(format!("unknown tree node '{id}'")))?;
        if !node.is_dir || node.traversed {
            return Ok(false);
        }
        if budget == 0 {
            debug!(node = id, "tree node budget exhausted");
            return Ok(false);
        }

        let mut entries = list_dir(&path, filters.as_ref())?;
        let limit = max_children.min(budget);
        node.truncated = entries.len() > limit;
        entries.truncate(limit);

        node.size = 0;
        for (index, (name, is_dir, size)) in entries.into_iter().enumerate() {
            if !is_dir {
                node.size += size;
            }
            let child_id = format!("{}_{index}", node.id);
            node.children.push(TreeNode::new(child_id, name, is_dir, size));
        }
        node.traversed = true;
        let added = node.children.len();
        self.node_count += added;
        Ok(true)
    }

    /// Expand breadth-first down to `depth` levels below the root.
    pub fn expand_to_depth(&mut self, depth: usize) -> Result<()> {
        let mut frontier = vec![self.root.id.clone()];
        for _ in 0..depth {
            let mut next = Vec::new();
            for id in frontier {
                self.expand(&id)?;
                if let Some(node) = self.find(&id) {
                    next.extend(node.children.iter().filter(|c| c.is_dir).map(|c| c.id.clone()));
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }
        Ok(())
    }
}

fn parse_id(id: &str) -> Option<Vec<usize>> {
    let mut parts = id.split('_');
    if parts.next()? != "0" {
        return None;
    }
    parts.map(|p| p.parse().ok()).collect()
}

/// Sorted `(name, is_dir, size)` of the visible entries of `dir`.
fn list_dir(dir: &Path, filters: Option<&Filters>) -> Result<Vec<(String, bool, u64)>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let Ok(entry) = entry else {
            continue;
        };
        let Ok(metadata) = entry.path().symlink_metadata() else {
            continue;
        };
        let path = entry.path();
        let is_dir = metadata.is_dir();
        if let Some(filters) = filters {
            let excluded = if is_dir {
                filters.excludes_dir(&path)
            } else {
                filters.excludes_file(&path)
            };
            if excluded {
                continue;
            }
        }
        let name = entry.file_name().to_string_lossy().to_string();
        out.push((name, is_dir, if is_dir { 0 } else { metadata.len() }));
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}
