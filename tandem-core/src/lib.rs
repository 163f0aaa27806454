//! # tandem-core — Replicated text engine for Tandem
//!
//! A sequence CRDT for plain text plus the binary codec used to ship its
//! updates between replicas. No I/O and no async: the networking layer lives
//! in `tandem-collab`.
//!
//! ## Architecture
//!
//! ```text
//!   Clock ──► ItemId (counter, replica)
//!                │
//!                ▼
//!   Document ── Vec<Item> (tombstones kept)
//!      │            ▲
//!      │ snapshot   │ merge_update
//!      ▼            │
//!   Update ──► codec::encode_update ──► bytes ──► codec::decode_update
//! ```
//!
//! ## Modules
//!
//! - [`id`] — replica ids, item ids, Lamport-style clock, state vectors
//! - [`text`] — the replicated text document
//! - [`codec`] — framed update encoding and differential sync
//! - [`error`] — error taxonomy

pub mod id;
pub mod text;
pub mod codec;
pub mod error;

pub use id::{Clock, ItemId, ReplicaId, StateVector};
pub use text::{DeleteSet, Document, Item, MergeOutcome, OrphanedOp, Update};
pub use codec::{decode_stream, decode_update, diff_since, encode_update, merge_state_vectors};
pub use error::CoreError;
