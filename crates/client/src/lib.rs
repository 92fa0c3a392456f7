//! Client for the Veo video-generation service.
//!
//! Layers, bottom up:
//!
//! - [`transport`]: authenticated HTTP with error normalisation and retry.
//! - [`api`]: typed endpoint wrappers plus the [`api::StatusSource`] and
//!   [`api::VideoService`] seams.
//! - [`tracker`]: stream-first, poll-fallback job tracking.
//! - [`orchestrator`]: validate, submit, track, and record.
//! - [`store`]: client-side job state for display.

pub mod api;
pub mod config;
pub mod credentials;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod retry;
pub mod sse;
pub mod store;
pub mod tracker;
pub mod transport;
