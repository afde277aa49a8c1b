//! Domain model module declarations.

pub mod output;
pub mod prompt;
pub mod session;
