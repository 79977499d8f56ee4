//! Common utilities shared between the controller and the session endpoint

pub mod config;
pub mod error;
pub mod logging;
pub mod paths;

pub use error::{Error, Result};
