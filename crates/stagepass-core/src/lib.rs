//! stagepass-core - Offline-first sync engine for Stagepass
//!
//! This crate contains the synchronization and conflict-resolution core
//! shared by all Stagepass clients (gate scanners, vendor terminals, the
//! attendee app). Devices operate fully offline - scanning tickets, taking
//! cashless payments, toggling favorites - and reconcile with the server
//! later without losing or duplicating writes.
//!
//! The pieces, bottom up:
//!
//! - [`queue::MutationQueue`] - durable, ordered store of pending writes
//! - [`resolver::ConflictResolver`] - stateless merge decisions
//! - [`handler::OfflineMutationHandler`] - records writes, drives replay
//! - [`sync::SyncManager`] - full pull+push passes with phases and progress
//! - [`background::BackgroundSyncService`] - scheduled/opportunistic passes
//!
//! The application's composition root owns every instance; there is no
//! global state. Network and record storage are injected through the
//! traits in [`transport`].

pub mod background;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod handler;
pub mod models;
pub mod queue;
pub mod resolver;
pub mod sync;
pub mod transport;

pub use error::{Error, ErrorClass, Result};
pub use models::{Mutation, MutationId, QueueItem, SyncResult};
