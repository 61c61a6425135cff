//! Jobgate - Distributed Admission Control
//!
//! This crate decides whether a unit of work may run now without breaking
//! any of the rate limits shared by every process that points at the same
//! counter store and lock service. Limits cover jobs per window, items per
//! window and concurrent jobs, at namespace and per-key scope.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
