//! The fsdrift operation-sequence engine.
//!
//! The engine generates statistically-weighted, structurally-valid
//! filesystem operations, applies each one to the system under test and to
//! a trusted kernel filesystem in immediate succession, compares the two
//! recorded outputs, and periodically cross-checks whole-tree digests.
//! Any divergence is a bug in the system under test.

pub mod driver;
pub mod error;
mod execute;
pub mod generate;
pub mod loopback;
pub mod state;
pub mod sut;
pub mod sys;

pub use driver::Engine;
pub use error::EngineError;
pub use loopback::LoopbackSut;
pub use state::VirtualState;
pub use sut::{ProcessSut, SutController};
