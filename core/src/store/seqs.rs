// Monotonic (scope, document, actor) -> seq table
//
// Shared by the clock and cursor stores. Rows only ever grow: an upsert
// overwrites a row only when the new sequence is strictly greater, and every
// batch runs inside one sled transaction. Writers are serialized so that a
// destructive set sees every row it replaces.

use super::backend::StoreError;
use crate::clock::{Clock, Seq};
use crate::keys::{ActorId, DocId, FeedId, RepoId};
use parking_lot::Mutex;
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult, TransactionError};
use std::collections::{BTreeMap, BTreeSet};

const ID_LEN: usize = 32;
const KEY_LEN: usize = ID_LEN * 3;

/// Emitted when an update actually changed a stored clock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClockUpdate {
    pub scope: RepoId,
    pub doc_id: DocId,
    pub clock: Clock,
}

fn row_key(scope: &RepoId, doc: &DocId, actor: &ActorId) -> Vec<u8> {
    let mut key = Vec::with_capacity(KEY_LEN);
    key.extend_from_slice(scope.as_bytes());
    key.extend_from_slice(doc.as_bytes());
    key.extend_from_slice(actor.as_bytes());
    key
}

fn doc_prefix(scope: &RepoId, doc: &DocId) -> Vec<u8> {
    let mut key = Vec::with_capacity(ID_LEN * 2);
    key.extend_from_slice(scope.as_bytes());
    key.extend_from_slice(doc.as_bytes());
    key
}

fn decode_seq(value: &[u8]) -> Result<Seq, StoreError> {
    let bytes: [u8; 8] = value
        .try_into()
        .map_err(|_| StoreError::Corrupt(format!("seq value of {} bytes", value.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

/// Split a row key into its three ids
fn decode_key(key: &[u8]) -> Result<(RepoId, DocId, ActorId), StoreError> {
    if key.len() != KEY_LEN {
        return Err(StoreError::Corrupt(format!("row key of {} bytes", key.len())));
    }
    let corrupt = |_| StoreError::Corrupt("row key".to_string());
    Ok((
        RepoId::from_slice(&key[..ID_LEN]).map_err(corrupt)?,
        DocId::from_slice(&key[ID_LEN..ID_LEN * 2]).map_err(corrupt)?,
        FeedId::from_slice(&key[ID_LEN * 2..]).map_err(corrupt)?,
    ))
}

fn flatten(err: TransactionError<StoreError>) -> StoreError {
    match err {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => StoreError::Sled(e),
    }
}

pub struct SeqTable {
    tree: sled::Tree,
    write_lock: Mutex<()>,
}

impl SeqTable {
    pub fn new(tree: sled::Tree) -> Self {
        Self {
            tree,
            write_lock: Mutex::new(()),
        }
    }

    /// Full clock stored for (scope, doc); empty if never seen.
    pub fn get(&self, scope: &RepoId, doc: &DocId) -> Result<Clock, StoreError> {
        let mut clock = Clock::new();
        for item in self.tree.scan_prefix(doc_prefix(scope, doc)) {
            let (key, value) = item?;
            let (_, _, actor) = decode_key(&key)?;
            clock.insert(actor, decode_seq(&value)?);
        }
        Ok(clock)
    }

    /// Stored seq for one actor, zero if absent.
    pub fn entry(&self, scope: &RepoId, doc: &DocId, actor: &ActorId) -> Result<Seq, StoreError> {
        match self.tree.get(row_key(scope, doc, actor))? {
            Some(value) => decode_seq(&value),
            None => Ok(0),
        }
    }

    /// Fold `clock` into the stored rows. Returns the merged clock, and a
    /// change descriptor only when some row was created or raised.
    pub fn update(
        &self,
        scope: &RepoId,
        doc: &DocId,
        clock: &Clock,
    ) -> Result<(Clock, Option<ClockUpdate>), StoreError> {
        let _guard = self.write_lock.lock();
        let changed = self
            .tree
            .transaction(|tx| -> ConflictableTransactionResult<bool, StoreError> {
                let mut changed = false;
                for (actor, seq) in clock.iter() {
                    let key = row_key(scope, doc, actor);
                    let current = match tx.get(key.as_slice())? {
                        Some(value) => Some(
                            decode_seq(&value).map_err(ConflictableTransactionError::Abort)?,
                        ),
                        None => None,
                    };
                    let write = match current {
                        Some(current) => *seq > current,
                        None => true,
                    };
                    if write {
                        tx.insert(key, seq.to_be_bytes().to_vec())?;
                        changed = true;
                    }
                }
                Ok(changed)
            })
            .map_err(flatten)?;

        let merged = self.get(scope, doc)?;
        let update = changed.then(|| ClockUpdate {
            scope: *scope,
            doc_id: *doc,
            clock: merged.clone(),
        });
        Ok((merged, update))
    }

    /// Destructive overwrite: drop every row for (scope, doc), then apply
    /// `clock`. Only for authoritative resets.
    pub fn set(
        &self,
        scope: &RepoId,
        doc: &DocId,
        clock: &Clock,
    ) -> Result<(Clock, Option<ClockUpdate>), StoreError> {
        // sled transactions cannot scan; the lock keeps the prefix stable
        let _guard = self.write_lock.lock();
        let previous = self.get(scope, doc)?;
        let existing = self
            .tree
            .scan_prefix(doc_prefix(scope, doc))
            .keys()
            .collect::<Result<Vec<_>, _>>()?;

        self.tree
            .transaction(|tx| -> ConflictableTransactionResult<(), StoreError> {
                for key in &existing {
                    tx.remove(key.clone())?;
                }
                for (actor, seq) in clock.iter() {
                    tx.insert(row_key(scope, doc, actor), seq.to_be_bytes().to_vec())?;
                }
                Ok(())
            })
            .map_err(flatten)?;

        let current = self.get(scope, doc)?;
        let update = (current != previous).then(|| ClockUpdate {
            scope: *scope,
            doc_id: *doc,
            clock: current.clone(),
        });
        Ok((current, update))
    }

    /// Documents in `scope` whose entry for `actor` is at least `min_seq`.
    pub fn docs_with_actor(
        &self,
        scope: &RepoId,
        actor: &ActorId,
        min_seq: Seq,
    ) -> Result<Vec<DocId>, StoreError> {
        let mut docs = BTreeSet::new();
        for item in self.tree.scan_prefix(scope.as_bytes()) {
            let (key, value) = item?;
            let (_, doc, row_actor) = decode_key(&key)?;
            if row_actor == *actor && decode_seq(&value)? >= min_seq {
                docs.insert(doc);
            }
        }
        Ok(docs.into_iter().collect())
    }

    /// Every document with at least one row in `scope`.
    pub fn document_ids(&self, scope: &RepoId) -> Result<Vec<DocId>, StoreError> {
        let mut docs = BTreeSet::new();
        for key in self.tree.scan_prefix(scope.as_bytes()).keys() {
            let (_, doc, _) = decode_key(&key?)?;
            docs.insert(doc);
        }
        Ok(docs.into_iter().collect())
    }

    /// Clocks for one document across every scope.
    pub fn scopes_for(&self, doc: &DocId) -> Result<BTreeMap<RepoId, Clock>, StoreError> {
        let mut out: BTreeMap<RepoId, Clock> = BTreeMap::new();
        for item in self.tree.iter() {
            let (key, value) = item?;
            let (scope, row_doc, actor) = decode_key(&key)?;
            if row_doc == *doc {
                out.entry(scope).or_default().insert(actor, decode_seq(&value)?);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::backend::Storage;

    fn id(n: u8) -> [u8; 32] {
        [n; 32]
    }

    fn table() -> SeqTable {
        let storage = Storage::temporary().unwrap();
        SeqTable::new(storage.tree("seqs").unwrap())
    }

    fn clock(entries: &[(u8, Seq)]) -> Clock {
        entries
            .iter()
            .map(|(a, s)| (FeedId::from_bytes(id(*a)), *s))
            .collect()
    }

    #[test]
    fn test_update_never_regresses() {
        let t = table();
        let (scope, doc) = (RepoId::from_bytes(id(1)), DocId::from_bytes(id(2)));

        t.update(&scope, &doc, &clock(&[(9, 5)])).unwrap();
        let (merged, update) = t.update(&scope, &doc, &clock(&[(9, 3)])).unwrap();

        assert_eq!(merged, clock(&[(9, 5)]));
        assert!(update.is_none());
        assert_eq!(t.get(&scope, &doc).unwrap(), clock(&[(9, 5)]));
    }

    #[test]
    fn test_update_reports_change() {
        let t = table();
        let (scope, doc) = (RepoId::from_bytes(id(1)), DocId::from_bytes(id(2)));
        let (_, update) = t.update(&scope, &doc, &clock(&[(9, 1), (8, 2)])).unwrap();
        let update = update.unwrap();
        assert_eq!(update.doc_id, doc);
        assert_eq!(update.clock, clock(&[(9, 1), (8, 2)]));
    }

    #[test]
    fn test_set_overwrites() {
        let t = table();
        let (scope, doc) = (RepoId::from_bytes(id(1)), DocId::from_bytes(id(2)));
        t.update(&scope, &doc, &clock(&[(9, 5), (8, 1)])).unwrap();
        let (current, update) = t.set(&scope, &doc, &clock(&[(9, 2)])).unwrap();
        assert_eq!(current, clock(&[(9, 2)]));
        assert!(update.is_some());
    }

    #[test]
    fn test_set_is_exact_under_concurrent_updates() {
        let t = std::sync::Arc::new(table());
        let (scope, doc) = (RepoId::from_bytes(id(1)), DocId::from_bytes(id(2)));
        let target = clock(&[(9, 2)]);

        let writers: Vec<_> = (10..14u8)
            .map(|actor| {
                let t = t.clone();
                std::thread::spawn(move || {
                    for seq in 1..=200 {
                        t.update(&scope, &doc, &clock(&[(actor, seq)])).unwrap();
                    }
                })
            })
            .collect();

        for _ in 0..50 {
            let (current, _) = t.set(&scope, &doc, &target).unwrap();
            assert_eq!(current, target);
        }
        for writer in writers {
            writer.join().unwrap();
        }
        assert_eq!(t.set(&scope, &doc, &target).unwrap().0, target);
    }

    #[test]
    fn test_scopes_are_isolated() {
        let t = table();
        let doc = DocId::from_bytes(id(2));
        t.update(&RepoId::from_bytes(id(1)), &doc, &clock(&[(9, 5)])).unwrap();
        t.update(&RepoId::from_bytes(id(3)), &doc, &clock(&[(9, 7)])).unwrap();

        assert_eq!(t.entry(&RepoId::from_bytes(id(1)), &doc, &FeedId::from_bytes(id(9))).unwrap(), 5);
        let all = t.scopes_for(&doc).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[&RepoId::from_bytes(id(3))], clock(&[(9, 7)]));
    }

    #[test]
    fn test_docs_with_actor_threshold() {
        let t = table();
        let scope = RepoId::from_bytes(id(1));
        t.update(&scope, &DocId::from_bytes(id(2)), &clock(&[(9, 5)])).unwrap();
        t.update(&scope, &DocId::from_bytes(id(3)), &clock(&[(9, 1)])).unwrap();
        t.update(&scope, &DocId::from_bytes(id(4)), &clock(&[(7, 9)])).unwrap();

        let actor = FeedId::from_bytes(id(9));
        assert_eq!(t.docs_with_actor(&scope, &actor, 0).unwrap().len(), 2);
        assert_eq!(
            t.docs_with_actor(&scope, &actor, 3).unwrap(),
            vec![DocId::from_bytes(id(2))]
        );
        assert_eq!(t.document_ids(&scope).unwrap().len(), 3);
    }
}
