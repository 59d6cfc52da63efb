//! In-memory index of the control database
//!
//! Models are resolved by id through this index rather than holding each
//! other directly. Every write or change notification goes through
//! [`Repository::apply`], which keeps only winning revisions, so duplicate
//! and out-of-order deliveries converge on the same content.

use parking_lot::RwLock;
use std::collections::BTreeMap;

use crate::storage::{revision_wins, Document};

#[derive(Default)]
pub struct Repository {
    docs: RwLock<BTreeMap<String, Document>>,
}

impl Repository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole index
    pub fn load(&self, docs: Vec<Document>) {
        let mut map = self.docs.write();
        map.clear();
        for doc in docs {
            map.insert(doc.id.clone(), doc);
        }
    }

    /// Record a revision if it is newer than the indexed one; returns whether
    /// the index changed. Tombstones keep the fields of the revision they
    /// replace so the entity kind of a deleted document stays known.
    pub fn apply(&self, doc: &Document) -> bool {
        let Some(rev) = doc.rev.as_deref() else {
            return false;
        };

        let mut map = self.docs.write();
        match map.get_mut(&doc.id) {
            Some(current) => {
                let current_rev = current.rev.as_deref().unwrap_or_default();
                if !revision_wins(rev, current_rev) {
                    return false;
                }
                if doc.deleted {
                    current.rev = doc.rev.clone();
                    current.deleted = true;
                    current.updated_at = doc.updated_at;
                } else {
                    *current = doc.clone();
                }
            }
            None => {
                map.insert(doc.id.clone(), doc.clone());
            }
        }
        true
    }

    /// Live document by id
    pub fn get(&self, id: &str) -> Option<Document> {
        self.docs.read().get(id).filter(|doc| !doc.deleted).cloned()
    }

    /// Document by id, tombstones included
    pub fn get_any(&self, id: &str) -> Option<Document> {
        self.docs.read().get(id).cloned()
    }

    /// Live documents of one kind, ordered by id
    pub fn of_type(&self, doc_type: &str) -> Vec<Document> {
        self.docs
            .read()
            .values()
            .filter(|doc| !doc.deleted && doc.doc_type() == Some(doc_type))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.docs.read().values().filter(|doc| !doc.deleted).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
