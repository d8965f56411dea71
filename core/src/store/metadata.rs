// Metadata ledger: which ids are documents or files, which actors belong to
// which document, merges and deletions
//
// The ledger is a local writable feed of JSON blocks. The in-memory index is
// rebuilt by replaying it on load; writes made while loading are buffered
// and applied afterwards. A block is appended only if it changes the index.

use super::backend::StoreError;
use crate::clock::Clock;
use crate::feed::Feed;
use crate::keys::{ActorId, DocId, FeedId};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One ledger entry. Untagged: the field set tells the variants apart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataBlock {
    File {
        id: FeedId,
        bytes: u64,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Actors {
        id: DocId,
        actors: Vec<ActorId>,
    },
    Merge {
        id: DocId,
        merge: Clock,
    },
    Deleted {
        id: DocId,
        deleted: bool,
    },
}

impl MetadataBlock {
    /// Parse and validate a block from untrusted bytes.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let block: MetadataBlock = serde_json::from_slice(bytes).ok()?;
        block.is_valid().then_some(block)
    }

    pub fn is_valid(&self) -> bool {
        match self {
            MetadataBlock::File { mime_type, .. } => !mime_type.is_empty(),
            MetadataBlock::Actors { actors, .. } => !actors.is_empty(),
            MetadataBlock::Merge { merge, .. } => !merge.is_empty(),
            MetadataBlock::Deleted { deleted, .. } => *deleted,
        }
    }

    /// Keep only the valid blocks of a batch
    pub fn filter_valid(blocks: Vec<MetadataBlock>) -> Vec<MetadataBlock> {
        blocks.into_iter().filter(|b| b.is_valid()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub bytes: u64,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
}

/// Replay state of the ledger
#[derive(Debug)]
pub enum LedgerState {
    Loading { buffered: Vec<MetadataBlock> },
    Ready,
}

#[derive(Default)]
struct MetadataIndex {
    docs: BTreeSet<DocId>,
    files: BTreeMap<FeedId, FileMetadata>,
    actors: BTreeMap<DocId, BTreeSet<ActorId>>,
    merges: BTreeMap<DocId, Clock>,
    deleted: BTreeSet<DocId>,
}

impl MetadataIndex {
    /// Fold a block in. Returns true if anything changed.
    fn apply(&mut self, block: &MetadataBlock) -> bool {
        match block {
            MetadataBlock::File {
                id,
                bytes,
                mime_type,
            } => {
                let meta = FileMetadata {
                    bytes: *bytes,
                    mime_type: mime_type.clone(),
                };
                self.files.insert(*id, meta.clone()) != Some(meta)
            }
            MetadataBlock::Actors { id, actors } => {
                let mut changed = self.docs.insert(*id);
                let known = self.actors.entry(*id).or_default();
                for actor in actors {
                    changed |= known.insert(*actor);
                }
                changed
            }
            MetadataBlock::Merge { id, merge } => {
                let changed = self.docs.insert(*id);
                self.merges.entry(*id).or_default().union_with(merge) || changed
            }
            MetadataBlock::Deleted { id, .. } => self.deleted.insert(*id),
        }
    }
}

pub struct Metadata {
    ledger: Arc<Feed>,
    state: Mutex<LedgerState>,
    index: RwLock<MetadataIndex>,
}

impl Metadata {
    pub fn new(ledger: Arc<Feed>) -> Self {
        Self {
            ledger,
            state: Mutex::new(LedgerState::Loading {
                buffered: Vec::new(),
            }),
            index: RwLock::new(MetadataIndex::default()),
        }
    }

    pub fn ledger_id(&self) -> FeedId {
        self.ledger.id()
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.state.lock(), LedgerState::Ready)
    }

    /// Replay the ledger, then apply whatever was written while loading.
    /// Returns the number of ledger blocks replayed.
    pub fn load(&self) -> Result<usize, StoreError> {
        let buffered = {
            let mut state = self.state.lock();
            let buffered = match &mut *state {
                LedgerState::Ready => return Ok(0),
                LedgerState::Loading { buffered } => std::mem::take(buffered),
            };

            let mut index = self.index.write();
            let length = self.ledger.len();
            for i in 0..length {
                let bytes = self
                    .ledger
                    .get(i)
                    .map_err(|e| StoreError::Ledger(e.to_string()))?
                    .ok_or_else(|| StoreError::Ledger(format!("missing ledger block {}", i)))?;
                match MetadataBlock::parse(&bytes) {
                    Some(block) => {
                        index.apply(&block);
                    }
                    None => warn!("Skipping malformed ledger block {}", i),
                }
            }
            *state = LedgerState::Ready;
            info!("Metadata ledger loaded ({} blocks)", length);
            buffered
        };

        let replayed = self.ledger.len() as usize;
        for block in buffered {
            self.add_block(block)?;
        }
        Ok(replayed)
    }

    /// Record a block: applied and persisted if it changes anything.
    pub fn add_block(&self, block: MetadataBlock) -> Result<bool, StoreError> {
        if !block.is_valid() {
            return Err(StoreError::Ledger(format!("invalid block {:?}", block)));
        }

        let mut state = self.state.lock();
        if let LedgerState::Loading { buffered } = &mut *state {
            buffered.push(block);
            return Ok(false);
        }

        let changed = self.index.write().apply(&block);
        if changed {
            let bytes =
                serde_json::to_vec(&block).map_err(|e| StoreError::Serialization(e.to_string()))?;
            self.ledger
                .append(&bytes)
                .map_err(|e| StoreError::Ledger(e.to_string()))?;
            debug!("Ledger: recorded {:?}", block);
        }
        Ok(changed)
    }

    pub fn add_actor(&self, doc: DocId, actor: ActorId) -> Result<bool, StoreError> {
        self.add_actors(doc, vec![actor])
    }

    pub fn add_actors(&self, doc: DocId, actors: Vec<ActorId>) -> Result<bool, StoreError> {
        self.add_block(MetadataBlock::Actors { id: doc, actors })
    }

    pub fn merge(&self, doc: DocId, clock: Clock) -> Result<bool, StoreError> {
        self.add_block(MetadataBlock::Merge {
            id: doc,
            merge: clock,
        })
    }

    pub fn delete(&self, doc: DocId) -> Result<bool, StoreError> {
        self.add_block(MetadataBlock::Deleted {
            id: doc,
            deleted: true,
        })
    }

    pub fn add_file(&self, id: FeedId, bytes: u64, mime_type: &str) -> Result<bool, StoreError> {
        self.add_block(MetadataBlock::File {
            id,
            bytes,
            mime_type: mime_type.to_string(),
        })
    }

    pub fn is_doc(&self, id: &DocId) -> bool {
        self.index.read().docs.contains(id)
    }

    pub fn is_file(&self, id: &FeedId) -> bool {
        self.index.read().files.contains_key(id)
    }

    pub fn is_deleted(&self, id: &DocId) -> bool {
        self.index.read().deleted.contains(id)
    }

    pub fn file(&self, id: &FeedId) -> Option<FileMetadata> {
        self.index.read().files.get(id).cloned()
    }

    pub fn actors(&self, doc: &DocId) -> Vec<ActorId> {
        self.index
            .read()
            .actors
            .get(doc)
            .map(|a| a.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Union of every clock merged into `doc`
    pub fn merged_clock(&self, doc: &DocId) -> Clock {
        self.index.read().merges.get(doc).cloned().unwrap_or_default()
    }

    /// Known, non-deleted documents
    pub fn doc_ids(&self) -> Vec<DocId> {
        let index = self.index.read();
        index
            .docs
            .iter()
            .filter(|d| !index.deleted.contains(*d))
            .copied()
            .collect()
    }

    pub fn docs_with_actor(&self, actor: &ActorId) -> Vec<DocId> {
        self.index
            .read()
            .actors
            .iter()
            .filter(|(_, actors)| actors.contains(actor))
            .map(|(doc, _)| *doc)
            .collect()
    }
}
