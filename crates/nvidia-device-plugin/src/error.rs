//! Error types shared by the plugin components.

use core::error::Error;

use derive_more::Display;

/// Errors surfaced by the lifecycle manager to the process entry point.
#[derive(Debug, Display)]
pub enum PluginError {
    #[display("Failed to remove stale socket {path}")]
    SocketCleanup { path: String },

    #[display("Failed to create device plugin directory {path}")]
    CreateDir { path: String },

    #[display("Failed to bind device plugin socket {path}")]
    Bind { path: String },

    #[display("Device plugin is already serving on {path}")]
    AlreadyServing { path: String },

    #[display("No devices to advertise")]
    NoDevices,
}

impl Error for PluginError {}

/// Errors raised by the hardware collaborator.
#[derive(Debug, Display)]
pub enum BackendError {
    #[display("Failed to initialize hardware library: {message}")]
    Init { message: String },

    #[display("Failed to enumerate devices: {message}")]
    Enumerate { message: String },

    #[display("Failed to watch fault events: {message}")]
    Watch { message: String },
}

impl Error for BackendError {}
