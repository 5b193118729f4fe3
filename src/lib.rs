//! Command-line front end for the Malloy query language.
//!
//! Compilation is delegated to an external Malloy compiler through the
//! [`runtime::Runtime`] trait; this crate handles configuration, connection
//! descriptors, database drivers and output.

pub mod cli;
pub mod commands;
pub mod config;
pub mod connection;
pub mod drivers;
pub mod error;
pub mod executor;
pub mod formatter;
pub mod output;
pub mod runtime;
pub mod store;

pub use cli::{CliMode, Dispatcher};
pub use error::{MalloyError, MalloyResult};
pub use executor::{QuerySelection, ResultPayload, RunOptions};
