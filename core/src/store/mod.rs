// Store module: durable causality bookkeeping and keys

pub mod backend;
pub mod clocks;
pub mod cursors;
pub mod keys;
pub mod metadata;
pub mod seqs;

pub use backend::{Storage, StoreError};
pub use clocks::ClockStore;
pub use cursors::CursorStore;
pub use keys::KeyStore;
pub use metadata::{FileMetadata, LedgerState, Metadata, MetadataBlock};
pub use seqs::{ClockUpdate, SeqTable};
