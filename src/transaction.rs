//! Transactional edit staging on top of a base image.
//!
//! A [`Transaction`] accumulates create/delete/set edits without touching
//! the base image. Commit rebuilds a fresh hive image from the base plus
//! the staged edits and hands it to a sink; rollback just drops the
//! staging maps. Paths are case-insensitive: staged state is keyed by
//! the lowercased path while the original-case name travels alongside.

use crate::cell::ValueType;
use crate::emitter;
use crate::error::{RegistryError, Result};
use crate::hive::Hive;
use crate::limits::HiveLimits;
use crate::sink::HiveSink;
use crate::tree::RebuildTree;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, instrument};

/// Normalizes a registry path: trims whitespace and outer separators,
/// drops empty components, folds to lowercase.
pub fn normalize_path(path: &str) -> String {
    path.trim()
        .trim_matches('\\')
        .split('\\')
        .filter(|c| !c.is_empty())
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("\\")
}

/// Splits a path into trimmed original-case components.
fn path_components(path: &str) -> Vec<String> {
    path.trim()
        .trim_matches('\\')
        .split('\\')
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}

fn join_lower(components: &[String]) -> String {
    components
        .iter()
        .map(|c| c.to_lowercase())
        .collect::<Vec<_>>()
        .join("\\")
}

/// Options controlling image emission at commit time.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Timestamp written into the header and newly created keys.
    /// Defaults to the commit wall-clock.
    pub timestamp: Option<chrono::DateTime<chrono::Utc>>,

    /// Reserved; accepted and ignored.
    pub repack: bool,
}

/// A key staged for creation.
#[derive(Debug, Clone)]
pub(crate) struct CreatedKey {
    /// Original-case name of the key's last path component.
    pub name: String,

    /// True if the key already existed in the base image.
    pub pre_existing: bool,
}

/// A staged value write.
#[derive(Debug, Clone)]
pub(crate) struct StagedValue {
    /// Original-case value name.
    pub name: String,

    /// Registry value type, passed through verbatim.
    pub value_type: ValueType,

    /// Raw value payload.
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Open,
    Committed,
    RolledBack,
}

/// A transactional edit session over an optional base image.
pub struct Transaction<'h> {
    base: Option<&'h Hive>,
    limits: Option<HiveLimits>,
    created: HashMap<String, CreatedKey>,
    deleted: HashSet<String>,
    set_values: HashMap<(String, String), StagedValue>,
    deleted_values: HashSet<(String, String)>,
    change_index: Option<ChangeIndex>,
    state: TxState,
}

impl<'h> Transaction<'h> {
    /// Begins a transaction. A `None` base creates a hive from scratch.
    pub fn begin(base: Option<&'h Hive>) -> Self {
        Transaction {
            base,
            limits: None,
            created: HashMap::new(),
            deleted: HashSet::new(),
            set_values: HashMap::new(),
            deleted_values: HashSet::new(),
            change_index: None,
            state: TxState::Open,
        }
    }

    /// Begins a transaction whose staged edits are checked against
    /// `limits`.
    pub fn begin_with_limits(base: Option<&'h Hive>, limits: HiveLimits) -> Self {
        let mut tx = Self::begin(base);
        tx.limits = Some(limits);
        tx
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            TxState::Open => Ok(()),
            TxState::Committed => Err(RegistryError::StateError(
                "transaction already committed",
            )),
            TxState::RolledBack => Err(RegistryError::StateError(
                "transaction already rolled back",
            )),
        }
    }

    fn touch(&mut self) {
        self.change_index = None;
    }

    /// Returns true if the key exists in the staged state or the base.
    fn key_exists(&self, path_lower: &str) -> bool {
        if path_lower.is_empty() {
            return true;
        }
        if self.deleted.contains(path_lower) {
            return false;
        }
        if self.created.contains_key(path_lower) {
            return true;
        }
        match self.base {
            Some(base) => base.find(path_lower).is_ok(),
            None => false,
        }
    }

    /// Stages a key creation. Idempotent.
    ///
    /// # Arguments
    ///
    /// * `path` - Backslash-separated key path.
    /// * `create_parents` - Create missing ancestors instead of failing.
    ///
    /// # Errors
    ///
    /// Fails with `StateError` if the path was deleted in this
    /// transaction, or `NotFound` if a parent is missing and
    /// `create_parents` is false.
    pub fn create_key(&mut self, path: &str, create_parents: bool) -> Result<()> {
        self.ensure_open()?;
        let components = path_components(path);
        if let Some(limits) = &self.limits {
            limits.check_path(&join_lower(&components))?;
        }
        self.create_key_inner(&components, create_parents)
    }

    fn create_key_inner(&mut self, components: &[String], create_parents: bool) -> Result<()> {
        if components.is_empty() {
            // The root always exists
            return Ok(());
        }

        let path_lower = join_lower(components);
        if self.deleted.contains(&path_lower) {
            return Err(RegistryError::StateError(
                "cannot create a key deleted in the same transaction",
            ));
        }
        if self.created.contains_key(&path_lower) {
            return Ok(());
        }

        let in_base = self
            .base
            .map(|b| b.find(&path_lower).is_ok())
            .unwrap_or(false);

        if !in_base {
            let parent = &components[..components.len() - 1];
            if !parent.is_empty() && !self.key_exists(&join_lower(parent)) {
                if !create_parents {
                    return Err(RegistryError::not_found("key", &join_lower(parent)));
                }
                self.create_key_inner(parent, true)?;
            }
        }

        debug!(path = %path_lower, pre_existing = in_base, "Staging key creation");
        self.created.insert(
            path_lower,
            CreatedKey {
                name: components[components.len() - 1].clone(),
                pre_existing: in_base,
            },
        );
        self.touch();
        Ok(())
    }

    /// Stages a key deletion. Idempotent.
    ///
    /// # Arguments
    ///
    /// * `path` - Backslash-separated key path.
    /// * `recursive` - Also delete every descendant. Without it, a key
    ///   with children fails.
    pub fn delete_key(&mut self, path: &str, recursive: bool) -> Result<()> {
        self.ensure_open()?;
        let path_lower = normalize_path(path);
        if path_lower.is_empty() {
            return Err(RegistryError::StateError("cannot delete the root key"));
        }
        if self.deleted.contains(&path_lower) {
            return Ok(());
        }

        let child_prefix = format!("{}\\", path_lower);

        if !recursive {
            if let Some(base) = self.base {
                if let Ok(key) = base.find(&path_lower) {
                    if key.subkey_count() > 0 {
                        return Err(RegistryError::InvalidFormat(format!(
                            "key '{}' has subkeys; use a recursive delete",
                            path_lower
                        )));
                    }
                }
            }
            if self.created.keys().any(|p| p.starts_with(&child_prefix)) {
                return Err(RegistryError::InvalidFormat(format!(
                    "key '{}' has staged subkeys; use a recursive delete",
                    path_lower
                )));
            }
        }

        // Purge staged state under the deleted subtree
        self.created
            .retain(|p, _| p != &path_lower && !p.starts_with(&child_prefix));
        self.set_values
            .retain(|(p, _), _| p != &path_lower && !p.starts_with(&child_prefix));
        self.deleted_values
            .retain(|(p, _)| p != &path_lower && !p.starts_with(&child_prefix));

        if recursive {
            if let Some(base) = self.base {
                if let Ok(key) = base.find(&path_lower) {
                    Self::mark_subtree_deleted(&mut self.deleted, &key, &path_lower)?;
                }
            }
        }

        debug!(path = %path_lower, recursive, "Staging key deletion");
        self.deleted.insert(path_lower);
        self.touch();
        Ok(())
    }

    /// Walks a base subtree once, marking every descendant path deleted.
    fn mark_subtree_deleted(
        deleted: &mut HashSet<String>,
        key: &crate::hive::RegistryKey,
        path_lower: &str,
    ) -> Result<()> {
        for child in key.subkeys()? {
            let child_path = format!("{}\\{}", path_lower, child.key_node().name_lower);
            Self::mark_subtree_deleted(deleted, &child, &child_path)?;
            deleted.insert(child_path);
        }
        Ok(())
    }

    /// Stages a value write, auto-creating the key (with ancestors) if
    /// it is absent from both base and staged state. Overwrites any
    /// prior staged write and clears a staged delete of the same value.
    pub fn set_value(
        &mut self,
        path: &str,
        name: &str,
        value_type: ValueType,
        data: &[u8],
    ) -> Result<()> {
        self.ensure_open()?;
        if let Some(limits) = &self.limits {
            limits.check_value_name(name)?;
            limits.check_value_data(data.len())?;
        }

        let components = path_components(path);
        let path_lower = join_lower(&components);
        if self.deleted.contains(&path_lower) {
            return Err(RegistryError::not_found("key", &path_lower));
        }
        if !self.key_exists(&path_lower) {
            self.create_key_inner(&components, true)?;
        }

        let entry = (path_lower, name.to_lowercase());
        self.deleted_values.remove(&entry);
        self.set_values.insert(
            entry,
            StagedValue {
                name: name.to_string(),
                value_type,
                data: data.to_vec(),
            },
        );
        self.touch();
        Ok(())
    }

    /// Stages a value deletion. Idempotent; clears any staged write of
    /// the same value.
    pub fn delete_value(&mut self, path: &str, name: &str) -> Result<()> {
        self.ensure_open()?;
        let entry = (normalize_path(path), name.to_lowercase());
        self.set_values.remove(&entry);
        self.deleted_values.insert(entry);
        self.touch();
        Ok(())
    }

    /// Discards all staged edits and closes the transaction.
    pub fn rollback(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.created.clear();
        self.deleted.clear();
        self.set_values.clear();
        self.deleted_values.clear();
        self.change_index = None;
        self.state = TxState::RolledBack;
        Ok(())
    }

    /// Rebuilds a fresh hive image from the base plus staged edits and
    /// writes it to `sink`.
    ///
    /// A failed commit leaves the transaction closed; callers must begin
    /// a new transaction to retry.
    #[instrument(skip_all)]
    pub fn commit<S: HiveSink>(&mut self, sink: &mut S, options: &WriteOptions) -> Result<()> {
        self.ensure_open()?;
        self.state = TxState::Committed;

        info!(
            created = self.created.len(),
            deleted = self.deleted.len(),
            set_values = self.set_values.len(),
            deleted_values = self.deleted_values.len(),
            "Committing transaction"
        );

        let index = ChangeIndex::build(self);
        self.change_index = Some(index);

        let mut tree = RebuildTree::build(self)?;
        let image = emitter::rebuild_image(&mut tree, options, self.estimate_cell_bytes())?;
        sink.write_hive(&image)?;
        Ok(())
    }

    /// Builds the change index outside of commit. Test hook.
    #[cfg(test)]
    pub(crate) fn seal_index_for_tests(&mut self) {
        let index = ChangeIndex::build(self);
        self.change_index = Some(index);
    }

    pub(crate) fn base(&self) -> Option<&'h Hive> {
        self.base
    }

    pub(crate) fn created(&self) -> &HashMap<String, CreatedKey> {
        &self.created
    }

    pub(crate) fn set_values(&self) -> &HashMap<(String, String), StagedValue> {
        &self.set_values
    }

    pub(crate) fn deleted_values(&self) -> &HashSet<(String, String)> {
        &self.deleted_values
    }

    pub(crate) fn index(&self) -> &ChangeIndex {
        self.change_index
            .as_ref()
            .expect("change index built at commit entry")
    }

    /// Rough allocation hint for the rebuild's cell buffer.
    pub(crate) fn estimate_cell_bytes(&self) -> usize {
        let staged = self.created.len() + self.set_values.len();
        let base = self
            .base
            .map(|b| b.base_block().hive_length as usize)
            .unwrap_or(0);
        base + 4096 + staged * 256
    }
}

/// Sorted, indexed summary of every changed path.
///
/// Three hash sets give O(1) exact lookups; the sorted union list
/// answers "does anything under this path change" by binary search.
pub(crate) struct ChangeIndex {
    created: HashSet<String>,
    deleted: HashSet<String>,
    value_changed: HashSet<String>,
    sorted_paths: Vec<String>,
}

impl ChangeIndex {
    fn build(tx: &Transaction) -> Self {
        let created: HashSet<String> = tx.created.keys().cloned().collect();
        let deleted: HashSet<String> = tx.deleted.iter().cloned().collect();

        let mut value_changed: HashSet<String> = HashSet::new();
        for (path, _) in tx.set_values.keys() {
            value_changed.insert(path.clone());
        }
        for (path, _) in &tx.deleted_values {
            value_changed.insert(path.clone());
        }

        let mut sorted_paths: Vec<String> = created
            .iter()
            .chain(deleted.iter())
            .chain(value_changed.iter())
            .cloned()
            .collect();
        sorted_paths.sort_unstable();
        sorted_paths.dedup();

        ChangeIndex {
            created,
            deleted,
            value_changed,
            sorted_paths,
        }
    }

    /// True if the exact path was created, deleted, or had value edits.
    pub fn has_exact(&self, path_lower: &str) -> bool {
        self.created.contains(path_lower)
            || self.deleted.contains(path_lower)
            || self.value_changed.contains(path_lower)
    }

    /// True if the path or anything beneath it changed.
    pub fn has_subtree(&self, path_lower: &str) -> bool {
        if path_lower.is_empty() {
            return !self.sorted_paths.is_empty();
        }
        if self.has_exact(path_lower) {
            return true;
        }

        let prefix = format!("{}\\", path_lower);
        let idx = self
            .sorted_paths
            .partition_point(|p| p.as_str() < prefix.as_str());
        idx < self.sorted_paths.len() && self.sorted_paths[idx].starts_with(&prefix)
    }

    /// True if the exact path is staged for deletion.
    pub fn is_deleted(&self, path_lower: &str) -> bool {
        self.deleted.contains(path_lower)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("  \\Software\\Vendor\\  "), "software\\vendor");
        assert_eq!(normalize_path("\\"), "");
        assert_eq!(normalize_path(""), "");
        assert_eq!(normalize_path("A\\\\B"), "a\\b");
    }

    #[test]
    fn test_create_key_is_idempotent() {
        let mut tx = Transaction::begin(None);
        tx.create_key("Software\\Vendor", true).unwrap();
        tx.create_key("software\\VENDOR", true).unwrap();
        assert_eq!(tx.created.len(), 2); // vendor + auto-created parent
        assert_eq!(tx.created["software\\vendor"].name, "Vendor");
    }

    #[test]
    fn test_create_key_requires_parent_without_flag() {
        let mut tx = Transaction::begin(None);
        let result = tx.create_key("Missing\\Child", false);
        assert!(matches!(result, Err(RegistryError::NotFound(_))));

        tx.create_key("Missing", false).unwrap();
        tx.create_key("Missing\\Child", false).unwrap();
    }

    #[test]
    fn test_delete_then_create_refused() {
        let mut tx = Transaction::begin(None);
        tx.create_key("Doomed", false).unwrap();
        tx.delete_key("Doomed", false).unwrap();
        let result = tx.create_key("Doomed", false);
        assert!(matches!(result, Err(RegistryError::StateError(_))));
    }

    #[test]
    fn test_delete_purges_staged_subtree() {
        let mut tx = Transaction::begin(None);
        tx.create_key("Top\\Mid\\Leaf", true).unwrap();
        tx.set_value("Top\\Mid", "v", ValueType::Binary, &[1]).unwrap();
        tx.delete_key("Top", true).unwrap();

        assert!(tx.created.is_empty());
        assert!(tx.set_values.is_empty());
        assert!(tx.deleted.contains("top"));
    }

    #[test]
    fn test_non_recursive_delete_rejects_staged_children() {
        let mut tx = Transaction::begin(None);
        tx.create_key("Top\\Child", true).unwrap();
        assert!(tx.delete_key("Top", false).is_err());
        assert!(tx.delete_key("Top", true).is_ok());
    }

    #[test]
    fn test_set_value_last_write_wins() {
        let mut tx = Transaction::begin(None);
        tx.set_value("Key", "Setting", ValueType::Dword, &[1, 0, 0, 0])
            .unwrap();
        tx.set_value("KEY", "SETTING", ValueType::Dword, &[2, 0, 0, 0])
            .unwrap();

        assert_eq!(tx.set_values.len(), 1);
        let staged = &tx.set_values[&("key".to_string(), "setting".to_string())];
        assert_eq!(staged.data, vec![2, 0, 0, 0]);
        // Original case of the first create is preserved on the key
        assert_eq!(tx.created["key"].name, "Key");
    }

    #[test]
    fn test_delete_value_clears_staged_set() {
        let mut tx = Transaction::begin(None);
        tx.set_value("Key", "Setting", ValueType::Dword, &[1, 0, 0, 0])
            .unwrap();
        tx.delete_value("Key", "Setting").unwrap();

        assert!(tx.set_values.is_empty());
        assert!(tx
            .deleted_values
            .contains(&("key".to_string(), "setting".to_string())));
    }

    #[test]
    fn test_operations_after_rollback_fail() {
        let mut tx = Transaction::begin(None);
        tx.rollback().unwrap();
        assert!(matches!(
            tx.create_key("K", false),
            Err(RegistryError::StateError(_))
        ));
        assert!(matches!(tx.rollback(), Err(RegistryError::StateError(_))));
    }

    #[test]
    fn test_second_commit_fails() {
        let mut tx = Transaction::begin(None);
        let mut sink = MemorySink::new();
        tx.commit(&mut sink, &WriteOptions::default()).unwrap();
        assert!(matches!(
            tx.commit(&mut sink, &WriteOptions::default()),
            Err(RegistryError::StateError(_))
        ));
    }

    #[test]
    fn test_change_index_subtree_queries() {
        let mut tx = Transaction::begin(None);
        tx.create_key("a\\b\\c", true).unwrap();
        tx.set_value("x\\y", "v", ValueType::Binary, &[0]).unwrap();
        tx.change_index = Some(ChangeIndex::build(&tx));

        let index = tx.index();
        assert!(index.has_exact("a\\b\\c"));
        assert!(index.has_exact("x\\y"));
        assert!(!index.has_exact("a\\b\\z"));

        assert!(index.has_subtree("a"));
        assert!(index.has_subtree("a\\b"));
        assert!(index.has_subtree(""));
        assert!(!index.has_subtree("q"));
        // "ab" is a sibling prefix string, not an ancestor path
        assert!(!index.has_subtree("ab"));
    }
}
