//! Audit trail: session event logs and artifact fingerprints.

pub mod eventlog;
pub mod hasher;
