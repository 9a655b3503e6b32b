//! Flow definitions and their compilation into [`crate::core::model::FlowModel`].

pub mod builder;
pub mod definition;

pub use builder::{CompileReport, CompileWarning, FlowBuilder, compile};
pub use definition::{FlowDefinition, NodeDefinition, NodePatch, RuleDefinition};
