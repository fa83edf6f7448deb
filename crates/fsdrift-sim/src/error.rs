use std::io;

/// Errors that stop a fuzzing run.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// The two sides produced observably different outputs.
    #[error("{op}: {detail}")]
    Mismatch { op: String, detail: String },

    /// The whole-tree digests disagree.
    #[error("tree digests do not match after operation {id}")]
    TreeDivergence { id: u64 },

    /// A programming error: unknown handle, impossible descriptor state.
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// The generator could not produce a valid operation.
    #[error("no valid operation after {0} attempts")]
    Unsatisfiable(usize),

    /// The snapshot propagation log never reported completion.
    #[error("timed out waiting for snapshot propagation")]
    SnapshotTimeout,

    /// Control-channel or SUT lifecycle failure.
    #[error("sut: {0}")]
    Sut(String),
}

impl EngineError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        EngineError::Io { context: context.into(), source }
    }
}
