#![forbid(unsafe_code)]

//! Harness that checks whether a package-installing client routes all of its
//! downloads through a configured HTTP(S) proxy, with and without proxy
//! credentials and TLS verification.

pub mod cli;
pub mod config;
pub mod correlate;
pub mod doctor;
pub mod error;
pub mod invoker;
pub mod matrix;
pub mod proxy;
pub mod sandbox;
pub mod suite;
pub mod util;

pub use cli::run_from_env;
pub use error::{HarnessError, Result};
