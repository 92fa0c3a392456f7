//! Domain types shared by the Veo generation client.
//!
//! Holds the wire data model (requests, job snapshots, statuses), the
//! local pre-flight validation rules, and the core error type. Nothing in
//! this crate performs I/O.

pub mod error;
pub mod generation;
pub mod job;
pub mod types;
