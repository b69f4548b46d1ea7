//! CLI Protocol Module
//!
//! Typed command construction and response parsing for the array's
//! line-oriented management CLI.

pub mod commands;
pub mod parser;

pub use commands::*;
pub use parser::*;
