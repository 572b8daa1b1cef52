//! Mapping rules and the registry that resolves resource declarations to
//! target primitives.

pub mod defaults;
pub mod registry;
pub mod rule;

pub use registry::{LoadReport, MappingRegistry, RegistryBuilder};
pub use rule::{MappingRule, Resolution, TargetInvocation};
