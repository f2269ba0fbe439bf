pub mod args;
pub mod path;
pub mod probe;
pub mod probedb;
pub mod prober;
pub mod remap;
pub mod report;

// Re-export commonly used types
pub use args::Args;
pub use path::{path_diff, DiffFlags, Iface, InvalidPath, Path, PathHop, MAX_PATH_LENGTH};
pub use probedb::ProbeDb;
pub use remap::{Remap, RemapError};

// Re-export external dependencies commonly used across modules
pub use anyhow::Result;
