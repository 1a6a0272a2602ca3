//! Unified error types for routelab

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for routelab operations
#[derive(Error, Debug)]
pub enum Error {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Config errors
    #[error("Failed to read lab file '{path}': {source}")]
    ConfigRead { path: PathBuf, source: io::Error },

    #[error("Failed to parse lab file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Lab validation failed: {0}")]
    ConfigValidation(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Topology construction errors
    #[error("Node '{0}' is already declared")]
    DuplicateName(String),

    #[error("Unknown node '{0}' - not declared in topology")]
    UnknownNode(String),

    // Router configuration errors
    #[error("Node '{0}' is not realized yet")]
    NotReady(String),

    #[error("Node '{node}' rejected '{directive}': {diagnostic}")]
    Configuration {
        node: String,
        directive: String,
        diagnostic: String,
    },

    #[error("Router '{router}' cannot {action} while {state}")]
    RouterState {
        router: String,
        action: String,
        state: String,
    },

    #[error("Node '{0}' is not a router")]
    NotARouter(String),

    // Probe errors
    #[error("Probe from '{node}' could not run '{command}': {message}")]
    ProbeExecution {
        node: String,
        command: String,
        message: String,
    },

    #[error("Failed to write results to '{path}': {source}")]
    ResultSink { path: PathBuf, source: io::Error },

    // Substrate errors
    #[error("Substrate error: {0}")]
    Substrate(String),

    #[error("Command '{command}' failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("Insufficient privileges: {0}")]
    InsufficientPrivileges(String),
}

/// Result type alias for routelab operations
pub type Result<T> = std::result::Result<T, Error>;
