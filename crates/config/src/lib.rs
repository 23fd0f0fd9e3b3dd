//! Configuration for pgharbor.
//!
//! Configuration is loaded from an INI file: the `[main]` section sets
//! engine-wide defaults, each `[server <name>]` section describes one
//! upstream database instance. Values accept unit suffixes (sizes `b/k/m/g`,
//! durations `s/m/h/d/w`) and `$NAME` environment expansion.
//!
//! Live reload parses the new file into a staging [`Config`], classifies
//! every changed field as hot (appliable in place) or restart-required, and
//! only publishes the staged configuration when no restart-required field
//! changed.

pub mod model;
pub mod parse;
pub mod reload;
pub mod state;

pub use model::{
    Compression, CompressionFamily, Config, Encryption, HugePage, LogLevel, LogMode, LogType,
    ProcessTitleMode, Retention, ServerConfig, StorageEngines,
};
pub use parse::{load_file, parse, serialize};
pub use reload::{transfer, ReloadOutcome};
pub use state::ConfigHandle;
