//! SQL building for the query engine
//!
//! Provides identifier and literal escaping, typed MySQL fragments and the
//! rule compiler.

pub mod condition;
pub mod fragment;
pub mod sanitize;

pub use condition::ConditionCompiler;
pub use sanitize::{quote_identifier, validate_identifier};
