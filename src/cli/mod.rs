//! Command-line interface for blockproc
//!
//! `blockproc run` reduces every block of a JSON-encoded array with one of the
//! built-in [`Reducer`]s, and `blockproc config` inspects the merged settings.

pub mod commands;
pub mod reduce;

pub use commands::Cli;
pub use reduce::Reducer;
