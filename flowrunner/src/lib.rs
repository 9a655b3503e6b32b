//! Deterministic conversation flow controller with a forkable execution history.
//!
//! A declarative flow (gates, nodes, retry policies) is compiled once into an
//! immutable [`core::model::FlowModel`]. Each turn, the [`controller`] picks the
//! next node and mode from the accumulated runtime state, and the [`run`]
//! facade records the turn in a parent-pointer history tree that can be forked
//! at any user reply.
//!
//! - **[`core`]**: Pure, deterministic logic (gates, eligibility, selection,
//!   history, branches). No I/O.
//! - **[`io`]**: Flow/config/run files, schema validation, and the fact
//!   extractor seam.
//!
//! [`workspace`] coordinates both for the CLI commands.

pub mod controller;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod flow;
pub mod io;
pub mod logging;
pub mod run;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod workspace;
