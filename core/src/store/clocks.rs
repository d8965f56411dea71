// Clock store: the persisted clock of every document, per repo scope
//
// The local repo's clocks live under its own id; clocks gossiped by peers are
// kept under the peer's id and feed the minimum-clock readiness check.

use super::backend::{Storage, StoreError, TREE_CLOCKS};
use super::seqs::{ClockUpdate, SeqTable};
use crate::clock::Clock;
use crate::keys::{DocId, RepoId};
use std::collections::BTreeMap;

pub struct ClockStore {
    table: SeqTable,
}

impl ClockStore {
    pub fn open(storage: &Storage) -> Result<Self, StoreError> {
        Ok(Self {
            table: SeqTable::new(storage.tree(TREE_CLOCKS)?),
        })
    }

    pub fn get(&self, repo: &RepoId, doc: &DocId) -> Result<Clock, StoreError> {
        self.table.get(repo, doc)
    }

    pub fn get_multiple(
        &self,
        repo: &RepoId,
        docs: &[DocId],
    ) -> Result<BTreeMap<DocId, Clock>, StoreError> {
        docs.iter()
            .map(|doc| Ok((*doc, self.table.get(repo, doc)?)))
            .collect()
    }

    /// Merge `clock` in; see [`SeqTable::update`].
    pub fn update(
        &self,
        repo: &RepoId,
        doc: &DocId,
        clock: &Clock,
    ) -> Result<(Clock, Option<ClockUpdate>), StoreError> {
        self.table.update(repo, doc, clock)
    }

    /// Hard overwrite; never used for incremental sync.
    pub fn set(
        &self,
        repo: &RepoId,
        doc: &DocId,
        clock: &Clock,
    ) -> Result<(Clock, Option<ClockUpdate>), StoreError> {
        self.table.set(repo, doc, clock)
    }

    pub fn document_ids(&self, repo: &RepoId) -> Result<Vec<DocId>, StoreError> {
        self.table.document_ids(repo)
    }

    /// Every scope's clock for `doc`.
    pub fn for_document(&self, doc: &DocId) -> Result<BTreeMap<RepoId, Clock>, StoreError> {
        self.table.scopes_for(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::FeedId;

    #[test]
    fn test_get_multiple_defaults_empty() {
        let store = ClockStore::open(&Storage::temporary().unwrap()).unwrap();
        let repo = RepoId::from_bytes([1; 32]);
        let (a, b) = (DocId::from_bytes([2; 32]), DocId::from_bytes([3; 32]));
        let clock: Clock = [(FeedId::from_bytes([4; 32]), 2)].into_iter().collect();
        store.update(&repo, &a, &clock).unwrap();

        let all = store.get_multiple(&repo, &[a, b]).unwrap();
        assert_eq!(all[&a], clock);
        assert!(all[&b].is_empty());
    }
}
