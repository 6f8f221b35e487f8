//! Local clipboard list and delta reconciliation.
//!
//! Pure state transitions with no I/O. The sync supervisor owns the only
//! mutable instance; everyone else sees cloned snapshots.

use std::collections::HashSet;

use clipsync_core::{ChangeEvent, ClipboardItem, Operation};
use serde::{Deserialize, Serialize};

/// Where `create` deltas land in the list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertOrder {
    /// Newest batch first; a batch keeps its own order (`[X, Y]` then `[Z]`
    /// gives `[Z, X, Y]`).
    #[default]
    Prepend,
    Append,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClipboardList {
    items: Vec<ClipboardItem>,
    order: InsertOrder,
}

impl ClipboardList {
    pub fn new(order: InsertOrder) -> Self {
        Self {
            items: Vec::new(),
            order,
        }
    }

    pub fn items(&self) -> &[ClipboardItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&ClipboardItem> {
        self.items.iter().find(|item| item.id == id)
    }

    /// Replaces the whole list with a fetch result. Prior state is discarded.
    pub fn replace_all(&mut self, items: Vec<ClipboardItem>) {
        self.items = dedup_by_id(items);
    }

    /// Applies one delta. Returns whether the list changed.
    pub fn apply(&mut self, event: &ChangeEvent) -> bool {
        match event.operation {
            Operation::Create => self.apply_create(&event.items),
            Operation::Update => self.apply_update(&event.items),
            Operation::Delete => self.apply_delete(&event.items),
        }
    }

    /// Removes one item, returning it with its former position.
    pub fn remove(&mut self, id: &str) -> Option<(usize, ClipboardItem)> {
        let index = self.items.iter().position(|item| item.id == id)?;
        Some((index, self.items.remove(index)))
    }

    /// Puts back an item taken out by [`ClipboardList::remove`].
    ///
    /// Does nothing if the id has reappeared in the meantime.
    pub fn restore(&mut self, index: usize, item: ClipboardItem) -> bool {
        if self.get(&item.id).is_some() {
            return false;
        }
        let index = index.min(self.items.len());
        self.items.insert(index, item);
        true
    }

    fn apply_create(&mut self, created: &[ClipboardItem]) -> bool {
        if created.is_empty() {
            return false;
        }
        let created = dedup_by_id(created.to_vec());
        let ids = created
            .iter()
            .map(|item| item.id.as_str())
            .collect::<HashSet<_>>();
        // A create for a known id replaces the stale entry.
        self.items.retain(|item| !ids.contains(item.id.as_str()));

        match self.order {
            InsertOrder::Prepend => {
                self.items.splice(0..0, created);
            }
            InsertOrder::Append => self.items.extend(created),
        }
        true
    }

    fn apply_update(&mut self, updated: &[ClipboardItem]) -> bool {
        let mut changed = false;
        for update in updated {
            if let Some(item) = self.items.iter_mut().find(|item| item.id == update.id)
                && (item.content != update.content
                    || item.origin_device_id != update.origin_device_id)
            {
                item.content = update.content.clone();
                item.origin_device_id = update.origin_device_id.clone();
                changed = true;
            }
        }
        changed
    }

    fn apply_delete(&mut self, deleted: &[ClipboardItem]) -> bool {
        let ids = deleted
            .iter()
            .map(|item| item.id.as_str())
            .collect::<HashSet<_>>();
        let before = self.items.len();
        self.items.retain(|item| !ids.contains(item.id.as_str()));
        self.items.len() != before
    }
}

fn dedup_by_id(items: Vec<ClipboardItem>) -> Vec<ClipboardItem> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.id.clone()))
        .collect()
}
