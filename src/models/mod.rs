//! Data models for the expiring-object store.
//!
//! Records are kept in memory only; nothing here is persisted.

pub mod record;
