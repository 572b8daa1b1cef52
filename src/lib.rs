//! cookport: convert Chef cookbooks into Ansible roles.
//!
//! Recipes are parsed into a structural model, declarations are resolved
//! against a mapping registry, and a generator drafts the role. Every draft
//! goes through a validation gateway; failures are distilled into feedback
//! for the next attempt until the role passes or attempts run out.

pub mod audit;
pub mod cli;
pub mod config;
pub mod convert;
pub mod core;
pub mod error;
pub mod mapping;
pub mod oracle;
pub mod output;
