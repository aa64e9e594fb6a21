//! Lazy-materialized rebuild tree.
//!
//! Commit merges the base image with the staged edits into a tree of
//! nodes, each either *materialized* (children and values loaded) or a
//! *base-ref* (identity only, pointing back at the source key node).
//! Subtrees the change index proves untouched stay base-refs until the
//! serializer reaches them, so a deep, mostly-unchanged hive is never
//! walked twice.
//!
//! Nodes live in an arena and refer to each other by index, which keeps
//! the parent back-edges (a cycle at the graph level) out of the
//! ownership story.

use crate::cell::ValueType;
use crate::error::{RegistryError, Result};
use crate::hive::Hive;
use crate::subkey_list;
use crate::transaction::Transaction;
use std::collections::HashMap;
use tracing::debug;

/// Arena index of a tree node.
pub(crate) type NodeId = usize;

/// Children past this count get a name lookup map next to the sorted list.
const CHILD_MAP_THRESHOLD: usize = 8;

/// One value attached to a tree node.
#[derive(Debug, Clone)]
pub(crate) struct TreeValue {
    /// Original-case value name (empty for the default value).
    pub name: String,

    /// Lowercased name, the lookup key.
    pub name_lower: String,

    /// On-disk name bytes when inherited unchanged from the base.
    pub name_raw: Option<Vec<u8>>,

    /// Encoding of `name_raw` (meaningful only when it is present).
    pub compressed: bool,

    /// Registry value type, passed through verbatim.
    pub value_type: ValueType,

    /// Raw value payload.
    pub data: Vec<u8>,
}

/// One key in the rebuild tree.
#[derive(Debug)]
pub(crate) struct Node {
    /// Original-case key name (empty for a from-scratch root).
    pub name: String,

    /// Lowercased name.
    pub name_lower: String,

    /// Cached lowercased path from the root ("" for the root itself).
    pub path_lower: String,

    /// On-disk name bytes when inherited unchanged from the base.
    pub name_raw: Option<Vec<u8>>,

    /// Name encoding flag (inherited, or preferred for new names).
    pub compressed: bool,

    /// Last-written FILETIME; zero means "stamp at emission".
    pub last_written: u64,

    /// Parent node; `None` for the root.
    pub parent: Option<NodeId>,

    /// Children sorted by lowercased name; `None` until materialized.
    pub children: Option<Vec<NodeId>>,

    /// Name lookup map, built once children exceed the threshold.
    pub child_map: Option<HashMap<String, NodeId>>,

    /// Values in emission order; `None` until materialized.
    pub values: Option<Vec<TreeValue>>,

    /// Source key node offset in the base image, if inherited.
    pub base_nk: Option<u32>,

    /// Cell-buffer offset, filled during serialization.
    pub cell_offset: Option<u32>,
}

impl Node {
    /// True once children and values are loaded.
    pub fn is_materialized(&self) -> bool {
        self.children.is_some()
    }
}

/// The copy-on-write tree a commit serializes.
pub(crate) struct RebuildTree<'h> {
    base: Option<&'h Hive>,
    nodes: Vec<Node>,
    root: NodeId,
}

impl<'h> RebuildTree<'h> {
    /// Builds the tree for a transaction: base traversal guided by the
    /// change index, then staged creations (shallowest first), then
    /// staged value edits.
    pub fn build(tx: &Transaction<'h>) -> Result<RebuildTree<'h>> {
        let mut tree = RebuildTree {
            base: tx.base(),
            nodes: Vec::new(),
            root: 0,
        };

        match tx.base() {
            Some(base) => {
                tree.root = tree.build_from_base(tx, base.root_offset(), None, String::new())?;
            }
            None => {
                tree.root = tree.push_created_node(String::new(), None, String::new());
            }
        }

        tree.apply_creations(tx)?;
        tree.apply_value_edits(tx)?;

        debug!(nodes = tree.nodes.len(), "Rebuild tree constructed");
        Ok(tree)
    }

    /// Root node id.
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Shared node access.
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    /// Mutable node access.
    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id]
    }

    /// Descends from the base root, materializing exactly the paths the
    /// change index touches and leaving everything else as base-refs.
    fn build_from_base(
        &mut self,
        tx: &Transaction<'h>,
        nk_offset: u32,
        parent: Option<NodeId>,
        path_lower: String,
    ) -> Result<NodeId> {
        let base = self.base.expect("base traversal requires a base image");
        let key_node = base.key_node(nk_offset)?;

        let id = self.nodes.len();
        self.nodes.push(Node {
            name: key_node.name.clone(),
            name_lower: key_node.name_lower.clone(),
            path_lower: path_lower.clone(),
            name_raw: Some(key_node.name_raw.clone()),
            compressed: key_node.flags.is_compressed(),
            last_written: key_node.last_written,
            parent,
            children: None,
            child_map: None,
            values: None,
            base_nk: Some(nk_offset),
            cell_offset: None,
        });

        if !tx.index().has_subtree(&path_lower) {
            // Untouched subtree: stays a base-ref until serialization
            return Ok(id);
        }

        // Values, with staged replacements and deletes applied in place
        let mut values = Vec::new();
        for vk_ref in base.value_list_refs(&key_node)? {
            let vk = base.value_key(vk_ref)?;
            let staged_key = (path_lower.clone(), vk.name_lower.clone());
            if tx.deleted_values().contains(&staged_key) {
                continue;
            }
            if let Some(staged) = tx.set_values().get(&staged_key) {
                values.push(staged_tree_value(staged));
            } else {
                let data = base.value_bytes(&vk)?;
                values.push(TreeValue {
                    name: vk.name.clone(),
                    name_lower: vk.name_lower.clone(),
                    name_raw: Some(vk.name_raw.clone()),
                    compressed: vk.flags.is_compressed(),
                    value_type: vk.data_type,
                    data,
                });
            }
        }

        // Children, skipping staged-deleted paths entirely
        let mut children = Vec::new();
        for child_offset in subkey_list::read_offsets(base, key_node.subkey_list_offset)? {
            let child_nk = base.key_node(child_offset)?;
            let child_path = join_path(&path_lower, &child_nk.name_lower);
            if tx.index().is_deleted(&child_path) {
                continue;
            }
            let child_id = self.build_from_base(tx, child_offset, Some(id), child_path)?;
            children.push(child_id);
        }
        self.sort_children(&mut children);

        let child_map = self.make_child_map(&children);
        let node = &mut self.nodes[id];
        node.values = Some(values);
        node.child_map = child_map;
        node.children = Some(children);
        Ok(id)
    }

    /// Applies staged key creations, shallowest paths first.
    fn apply_creations(&mut self, tx: &Transaction<'h>) -> Result<()> {
        let mut paths: Vec<(&String, &str)> = tx
            .created()
            .iter()
            .filter(|(_, key)| !key.pre_existing)
            .map(|(path, key)| (path, key.name.as_str()))
            .collect();
        paths.sort_by(|a, b| {
            let depth_a = a.0.matches('\\').count();
            let depth_b = b.0.matches('\\').count();
            depth_a.cmp(&depth_b).then_with(|| a.0.cmp(b.0))
        });

        for (path, name) in paths {
            let (parent_path, _) = split_path(path);
            let parent_id = self.find_node_and_materialize(parent_path)?;
            self.add_child(parent_id, name.to_string())?;
        }
        Ok(())
    }

    /// Applies staged value writes and deletes through a materializing
    /// path walk. Edits are applied in sorted order so the emitted
    /// value lists are deterministic.
    fn apply_value_edits(&mut self, tx: &Transaction<'h>) -> Result<()> {
        let mut writes: Vec<_> = tx.set_values().iter().collect();
        writes.sort_by(|a, b| a.0.cmp(b.0));

        for ((path, _name_lower), staged) in writes {
            let id = self.find_node_and_materialize(path)?;
            self.ensure_materialized(id)?;
            let value = staged_tree_value(staged);
            let values = self.nodes[id].values.as_mut().expect("materialized");
            match values.iter_mut().find(|v| v.name_lower == value.name_lower) {
                Some(slot) => *slot = value,
                None => values.push(value),
            }
        }

        for (path, name_lower) in tx.deleted_values() {
            let id = match self.find_node_and_materialize(path) {
                Ok(id) => id,
                // Deleting a value of an absent key is a no-op
                Err(RegistryError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            self.ensure_materialized(id)?;
            let values = self.nodes[id].values.as_mut().expect("materialized");
            values.retain(|v| &v.name_lower != name_lower);
        }
        Ok(())
    }

    /// Loads a base-ref node's direct children (as base-refs) and its
    /// values. Idempotent; does not recurse.
    pub fn ensure_materialized(&mut self, id: NodeId) -> Result<()> {
        if self.nodes[id].is_materialized() {
            return Ok(());
        }

        let base = self.base.expect("base-ref node without a base image");
        let nk_offset = self.nodes[id].base_nk.expect("base-ref node without source");
        let key_node = base.key_node(nk_offset)?;

        let mut values = Vec::new();
        for vk_ref in base.value_list_refs(&key_node)? {
            let vk = base.value_key(vk_ref)?;
            let data = base.value_bytes(&vk)?;
            values.push(TreeValue {
                name: vk.name.clone(),
                name_lower: vk.name_lower.clone(),
                name_raw: Some(vk.name_raw.clone()),
                compressed: vk.flags.is_compressed(),
                value_type: vk.data_type,
                data,
            });
        }

        let parent_path = self.nodes[id].path_lower.clone();
        let mut children = Vec::new();
        for child_offset in subkey_list::read_offsets(base, key_node.subkey_list_offset)? {
            let child_nk = base.key_node(child_offset)?;
            let child_path = join_path(&parent_path, &child_nk.name_lower);
            let child_id = self.nodes.len();
            self.nodes.push(Node {
                name: child_nk.name.clone(),
                name_lower: child_nk.name_lower.clone(),
                path_lower: child_path,
                name_raw: Some(child_nk.name_raw.clone()),
                compressed: child_nk.flags.is_compressed(),
                last_written: child_nk.last_written,
                parent: Some(id),
                children: None,
                child_map: None,
                values: None,
                base_nk: Some(child_offset),
                cell_offset: None,
            });
            children.push(child_id);
        }
        self.sort_children(&mut children);

        let child_map = self.make_child_map(&children);
        let node = &mut self.nodes[id];
        node.values = Some(values);
        node.child_map = child_map;
        node.children = Some(children);
        Ok(())
    }

    /// Walks a lowercased path from the root, materializing base-refs
    /// along the way.
    pub fn find_node_and_materialize(&mut self, path_lower: &str) -> Result<NodeId> {
        let mut current = self.root;
        if path_lower.is_empty() {
            return Ok(current);
        }

        for component in path_lower.split('\\') {
            self.ensure_materialized(current)?;
            current = self
                .lookup_child(current, component)
                .ok_or_else(|| RegistryError::not_found("key", path_lower))?;
        }
        Ok(current)
    }

    /// Finds a direct child by lowercased name.
    fn lookup_child(&self, id: NodeId, name_lower: &str) -> Option<NodeId> {
        let node = &self.nodes[id];
        if let Some(map) = &node.child_map {
            return map.get(name_lower).copied();
        }

        let children = node.children.as_ref()?;
        children
            .binary_search_by(|&c| self.nodes[c].name_lower.as_str().cmp(name_lower))
            .ok()
            .map(|i| children[i])
    }

    /// Inserts a freshly created child, keeping the sort order and the
    /// name map consistent.
    fn add_child(&mut self, parent: NodeId, name: String) -> Result<NodeId> {
        self.ensure_materialized(parent)?;

        let name_lower = name.to_lowercase();
        if let Some(existing) = self.lookup_child(parent, &name_lower) {
            return Ok(existing);
        }

        let path_lower = join_path(&self.nodes[parent].path_lower.clone(), &name_lower);
        let id = self.push_created_node(name, Some(parent), path_lower);

        let children = self.nodes[parent].children.as_ref().expect("materialized");
        let pos = children
            .binary_search_by(|&c| self.nodes[c].name_lower.as_str().cmp(name_lower.as_str()))
            .unwrap_err();

        let parent_node = &mut self.nodes[parent];
        let children = parent_node.children.as_mut().expect("materialized");
        children.insert(pos, id);
        let child_count = children.len();

        if let Some(map) = &mut self.nodes[parent].child_map {
            map.insert(name_lower, id);
        } else if child_count > CHILD_MAP_THRESHOLD {
            let children = self.nodes[parent]
                .children
                .as_ref()
                .expect("materialized")
                .clone();
            let map = self.make_child_map(&children);
            self.nodes[parent].child_map = map;
        }

        Ok(id)
    }

    fn push_created_node(
        &mut self,
        name: String,
        parent: Option<NodeId>,
        path_lower: String,
    ) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Node {
            name_lower: name.to_lowercase(),
            name,
            path_lower,
            name_raw: None,
            compressed: true,
            last_written: 0,
            parent,
            children: Some(Vec::new()),
            child_map: None,
            values: Some(Vec::new()),
            base_nk: None,
            cell_offset: None,
        });
        id
    }

    fn sort_children(&self, children: &mut [NodeId]) {
        children.sort_by(|&a, &b| self.nodes[a].name_lower.cmp(&self.nodes[b].name_lower));
    }

    fn make_child_map(&self, children: &[NodeId]) -> Option<HashMap<String, NodeId>> {
        if children.len() <= CHILD_MAP_THRESHOLD {
            return None;
        }
        Some(
            children
                .iter()
                .map(|&c| (self.nodes[c].name_lower.clone(), c))
                .collect(),
        )
    }
}

fn staged_tree_value(staged: &crate::transaction::StagedValue) -> TreeValue {
    TreeValue {
        name: staged.name.clone(),
        name_lower: staged.name.to_lowercase(),
        name_raw: None,
        compressed: true,
        value_type: staged.value_type,
        data: staged.data.clone(),
    }
}

fn join_path(parent: &str, name_lower: &str) -> String {
    if parent.is_empty() {
        name_lower.to_string()
    } else {
        format!("{}\\{}", parent, name_lower)
    }
}

fn split_path(path: &str) -> (&str, &str) {
    match path.rfind('\\') {
        Some(i) => (&path[..i], &path[i + 1..]),
        None => ("", path),
    }
}
