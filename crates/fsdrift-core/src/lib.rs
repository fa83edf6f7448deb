//! Domain model for fsdrift, a differential fuzzer that drives a
//! content-addressed user-space filesystem and a trusted kernel filesystem
//! through the same operation sequence and flags any observable divergence.
//!
//! This crate holds the pieces that do no I/O against the system under
//! test: the operation vocabulary, the open-flag sets, the weighted
//! probability model and its JSON configuration, the hash-period schedule,
//! and the deterministic tree digest.

pub mod config;
pub mod error;
pub mod flags;
pub mod op;
pub mod periods;
pub mod probability;
pub mod tree;

pub use config::{load_config, load_config_file, ConfigError};
pub use error::root_cause;
pub use flags::OpenFlags;
pub use op::{OpKind, OpSpec, Operation, SideError, SideOutput, Whence};
pub use periods::HashPeriods;
pub use probability::{ProbabilityRanges, ProbabilityTable};
pub use tree::{describe_divergence, digest_tree};
