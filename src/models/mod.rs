//! Data models for the catalog sync engine.
//!
//! This module contains the core data structures used throughout the crate:
//! - [`Source`]: Immutable descriptor of a remote catalog and its [`SyncCapability`]
//! - [`SyncJob`]: One synchronization attempt with its [`SyncTrigger`], [`JobState`] and [`ErrorKind`]
//! - [`CatalogSnapshot`]: What a fetcher hands back for a source (movies, series, episodes, genres)
//! - [`SyncConfig`], [`PersistedState`], [`AppSettings`]: Configuration documents
//!
//! # Architecture Note
//!
//! The models carry no behavior beyond their own invariants. Job state transitions are
//! enforced on [`SyncJob`] itself so every component that touches a job gets the same
//! "Running exactly once, terminal exactly once" guarantee.

pub mod catalog;
pub mod config;
pub mod job;
pub mod source;

pub use catalog::{CatalogSnapshot, ContentKind, Episode, Genre, MergeStats, Movie, Series};
pub use config::{AppSettings, PersistedState, SyncConfig};
pub use job::{ErrorKind, JobState, SyncJob, SyncTrigger};
pub use source::{Source, SyncCapability};
