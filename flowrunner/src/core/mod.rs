//! Deterministic, pure logic shared by the flow controller.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod branches;
pub mod eligibility;
pub mod facts;
pub mod gates;
pub mod history;
pub mod model;
pub mod selector;
pub mod session;
pub mod state;
pub mod tree_view;
pub mod types;
