//! ISO 11783-13 file server and file client.

pub mod client;
pub mod error_codes;
pub mod server;
pub mod types;

pub use client::{ClientState, FileClient, FileClientConfig, FsClientOutcome, FsCompletion};
pub use error_codes::{FSError, FileAttributes, OpenFlags};
pub use server::{FileServer, FileServerConfig, FsOutcome};
pub use types::{FSFunction, FileEntry, FileHandle, FileServerProperties, FileServerStatus, Tan, VolumeState};
