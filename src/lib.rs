//! Offline-first document sync engine.
//!
//! `docsync` keeps a local, transactional document cache eventually
//! consistent with a remote document store over a pair of bidirectional
//! streams, while serving live queries with ordered, exactly-once snapshot
//! delivery. Writes apply optimistically to the cache and are replayed to
//! the backend in order; queries keep answering from the cache while
//! offline and reconcile once the streams recover.
//!
//! [`api::SyncClient`] is the entry point: construct it with
//! [`api::ClientSettings`], a credential provider, a persistence backend and
//! a datastore, then `listen`, `write` and read through it. Everything the
//! client does runs on one serial task queue, so callers never coordinate
//! with the engine's internals.

pub mod api;
pub mod core;
pub mod error;
pub mod local;
pub mod model;
pub mod mutation;
pub mod remote;
pub mod runtime;
pub mod util;
pub mod value;
