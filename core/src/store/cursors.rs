// Cursor store: how far each repo wants to follow each actor of a document
//
// A cursor entry of `INFINITY` follows the actor forever (the document's root
// actor, and every actor the local repo writes).

use super::backend::{Storage, StoreError, TREE_CURSORS};
use super::seqs::{ClockUpdate, SeqTable};
use crate::clock::{Clock, Seq};
use crate::keys::{ActorId, DocId, RepoId};

pub struct CursorStore {
    table: SeqTable,
}

impl CursorStore {
    pub fn open(storage: &Storage) -> Result<Self, StoreError> {
        Ok(Self {
            table: SeqTable::new(storage.tree(TREE_CURSORS)?),
        })
    }

    pub fn get(&self, repo: &RepoId, doc: &DocId) -> Result<Clock, StoreError> {
        self.table.get(repo, doc)
    }

    pub fn entry(&self, repo: &RepoId, doc: &DocId, actor: &ActorId) -> Result<Seq, StoreError> {
        self.table.entry(repo, doc, actor)
    }

    pub fn update(
        &self,
        repo: &RepoId,
        doc: &DocId,
        cursor: &Clock,
    ) -> Result<(Clock, Option<ClockUpdate>), StoreError> {
        self.table.update(repo, doc, cursor)
    }

    pub fn set(
        &self,
        repo: &RepoId,
        doc: &DocId,
        cursor: &Clock,
    ) -> Result<(Clock, Option<ClockUpdate>), StoreError> {
        self.table.set(repo, doc, cursor)
    }

    /// Start following `actor` in `doc` up to `seq`.
    pub fn add_actor(
        &self,
        repo: &RepoId,
        doc: &DocId,
        actor: ActorId,
        seq: Seq,
    ) -> Result<Clock, StoreError> {
        let cursor: Clock = [(actor, seq)].into_iter().collect();
        let (merged, _) = self.table.update(repo, doc, &cursor)?;
        Ok(merged)
    }

    pub fn docs_with_actor(
        &self,
        repo: &RepoId,
        actor: &ActorId,
        min_seq: Seq,
    ) -> Result<Vec<DocId>, StoreError> {
        self.table.docs_with_actor(repo, actor, min_seq)
    }

    pub fn document_ids(&self, repo: &RepoId) -> Result<Vec<DocId>, StoreError> {
        self.table.document_ids(repo)
    }
}
