//! OCI runtime implementations.
//!
//! The engine talks to runtimes through [`crate::runtime::OciRuntime`]; the
//! one shipped here drives a runtime binary that follows the runc command
//! line. Tests substitute their own implementation.

pub mod cli;

pub use self::cli::CliRuntime;
