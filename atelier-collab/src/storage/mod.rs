//! Persistent storage for authoritative documents.
//!
//! ```text
//! ┌─────────────┐  accepted batches  ┌──────────────┐
//! │     Hub     │ ─────────────────► │ DocumentStore│
//! │ (in-memory) │ ◄───────────────── │ (RocksDB)    │
//! └─────────────┘  recover / reload  └──────┬───────┘
//!                                           │ column families
//!                                           ▼
//!                     ┌──────────────────────────────────────────┐
//!                     │ CF "documents": snapshots (JSON + LZ4)   │
//!                     │ CF "batches":   accepted forward patches │
//!                     │ CF "metadata":  versions, tombstones     │
//!                     └──────────────────────────────────────────┘
//! ```
//!
//! A document on disk is its latest snapshot plus every batch accepted
//! after it; loading replays those batches in version order.

pub mod rocks;

pub use rocks::{DocumentMetadata, DocumentStore, StoreConfig, StoreError, StoredDocument};
