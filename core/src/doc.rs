//! Document backend
//!
//! Holds one document's merge state and decides when its changes become
//! visible. A document is *ready* once its clock dominates the minimum clock
//! learned from peers; until then patches are held back, and the transition
//! to ready emits the full current patch. Local changes are reported exactly
//! once, as a `local` patch.

use crate::clock::{is_satisfied, Clock, Seq};
use crate::keys::{ActorId, DocId};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum DocError {
    #[error("Merge engine error: {0}")]
    Engine(String),

    #[error("Actor {actor}: expected change {expected}, got {got}")]
    OutOfOrder {
        actor: ActorId,
        expected: Seq,
        got: Seq,
    },
}

/// One change: the payload of block `seq - 1` of `actor`'s feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub actor: ActorId,
    pub seq: Seq,
    pub data: Vec<u8>,
}

/// The CRDT behind a document. The replication engine only orders and
/// delivers changes; merging them is up to the engine.
pub trait MergeEngine: Send + Sync + 'static {
    type State: Send + 'static;
    type Patch: Clone + fmt::Debug + Send + 'static;

    fn init(&self) -> Self::State;

    /// Apply changes from peers (or replayed from storage), in causal order
    /// per actor.
    fn apply_changes(&self, state: &mut Self::State, changes: &[Change])
        -> anyhow::Result<Self::Patch>;

    fn apply_local_change(&self, state: &mut Self::State, change: &Change)
        -> anyhow::Result<Self::Patch>;

    /// Patch that builds the whole current state from scratch
    fn get_patch(&self, state: &Self::State) -> Self::Patch;
}

/// What a document operation produced for the application
#[derive(Debug, Clone, PartialEq)]
pub enum DocEvent<P> {
    Ready {
        doc_id: DocId,
        patch: P,
        clock: Clock,
    },
    Patch {
        doc_id: DocId,
        patch: P,
        local: bool,
        clock: Clock,
    },
}

pub struct DocBackend<E: MergeEngine> {
    id: DocId,
    engine: Arc<E>,
    state: E::State,
    clock: Clock,
    /// `None` until we know what "minimally synced" means for this document
    min_clock: Option<Clock>,
    ready: bool,
}

impl<E: MergeEngine> DocBackend<E> {
    pub fn new(id: DocId, engine: Arc<E>, min_clock: Option<Clock>) -> Self {
        let state = engine.init();
        Self {
            id,
            engine,
            state,
            clock: Clock::new(),
            min_clock,
            ready: false,
        }
    }

    pub fn id(&self) -> DocId {
        self.id
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn min_clock(&self) -> Option<&Clock> {
        self.min_clock.as_ref()
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn state(&self) -> &E::State {
        &self.state
    }

    /// Apply remote changes. Changes already applied are skipped; a change
    /// that would leave a gap stops that actor's run.
    pub fn apply_remote_changes(
        &mut self,
        changes: Vec<Change>,
    ) -> Result<Option<DocEvent<E::Patch>>, DocError> {
        let mut next = self.clock.clone();
        let mut accepted = Vec::with_capacity(changes.len());
        for change in changes {
            let expected = next.get(&change.actor) + 1;
            if change.seq < expected {
                continue;
            }
            if change.seq > expected {
                warn!(
                    "Doc {}: gap in actor {} (have {}, got {})",
                    self.id.short(),
                    change.actor.short(),
                    expected - 1,
                    change.seq
                );
                continue;
            }
            next.insert(change.actor, change.seq);
            accepted.push(change);
        }

        if accepted.is_empty() {
            return Ok(self.poll_ready());
        }

        let patch = self
            .engine
            .apply_changes(&mut self.state, &accepted)
            .map_err(|e| DocError::Engine(e.to_string()))?;
        self.clock = next;
        debug!(
            "Doc {}: applied {} remote change(s)",
            self.id.short(),
            accepted.len()
        );

        if self.ready {
            return Ok(Some(DocEvent::Patch {
                doc_id: self.id,
                patch,
                local: false,
                clock: self.clock.clone(),
            }));
        }
        // The Ready event carries the full patch, which includes this one
        Ok(self.poll_ready())
    }

    /// Apply a change this repo just wrote.
    pub fn apply_local_change(
        &mut self,
        change: Change,
    ) -> Result<Option<DocEvent<E::Patch>>, DocError> {
        let expected = self.clock.get(&change.actor) + 1;
        if change.seq != expected {
            return Err(DocError::OutOfOrder {
                actor: change.actor,
                expected,
                got: change.seq,
            });
        }

        let patch = self
            .engine
            .apply_local_change(&mut self.state, &change)
            .map_err(|e| DocError::Engine(e.to_string()))?;
        self.clock.insert(change.actor, change.seq);

        if self.ready {
            return Ok(Some(DocEvent::Patch {
                doc_id: self.id,
                patch,
                local: true,
                clock: self.clock.clone(),
            }));
        }
        Ok(self.poll_ready())
    }

    /// Raise the minimum clock with one learned from a peer.
    pub fn update_min_clock(&mut self, clock: &Clock) -> Option<DocEvent<E::Patch>> {
        match self.min_clock.as_mut() {
            Some(min) => {
                min.union_with(clock);
            }
            None => self.min_clock = Some(clock.clone()),
        }
        self.poll_ready()
    }

    /// Flip to ready if the minimum clock is now satisfied. Emits the full
    /// patch exactly once.
    pub fn poll_ready(&mut self) -> Option<DocEvent<E::Patch>> {
        if self.ready {
            return None;
        }
        let min = self.min_clock.as_ref()?;
        if !is_satisfied(min, &self.clock) {
            return None;
        }
        self.ready = true;
        debug!("Doc {} ready at {:?}", self.id.short(), self.clock);
        Some(DocEvent::Ready {
            doc_id: self.id,
            patch: self.engine.get_patch(&self.state),
            clock: self.clock.clone(),
        })
    }
}
