//! Environment setup and teardown: the per-run test directory, the
//! reference subtree, and the two SUT instances.

use std::fs;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::PathBuf;

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use tracing::warn;

use fsdrift_sim::{EngineError, ProcessSut, SutController};

/// Everything a run operates on. The test directory is deliberately kept
/// around after the run for post-mortem inspection.
pub struct TestBed {
    pub test_dir: PathBuf,
    pub ref_dir: PathBuf,
    pub suts: Vec<Box<dyn SutController>>,
}

/// Create the test directory, the reference subtree and two SUT instances
/// sharing one store and encryption key, then bring both instances up.
pub fn set_up(server_bin: &str, rng: &mut ChaCha8Rng) -> Result<TestBed, EngineError> {
    let test_dir = tempfile::Builder::new()
        .prefix("fsdrift-")
        .tempdir()
        .map_err(|e| EngineError::io("creating test directory", e))?
        .into_path();

    // The reference root must carry the same mode the SUT serves for its
    // mount root, or the very first metadata digest would diverge.
    let ref_dir = test_dir.join("ref");
    fs::DirBuilder::new()
        .mode(0o777)
        .create(&ref_dir)
        .map_err(|e| EngineError::io(format!("creating {}", ref_dir.display()), e))?;
    fs::set_permissions(&ref_dir, fs::Permissions::from_mode(0o777))
        .map_err(|e| EngineError::io(format!("chmod {}", ref_dir.display()), e))?;

    let mut encryption_key = [0u8; 16];
    rng.fill(&mut encryption_key[..]);

    let mut suts: Vec<Box<dyn SutController>> = Vec::with_capacity(2);
    for i in 0..2 {
        let sut = ProcessSut::create(
            &test_dir,
            &test_dir.join(format!("sut{i}")),
            server_bin,
            &encryption_key,
        )?;
        suts.push(Box::new(sut));
    }
    for sut in &mut suts {
        sut.start()?;
    }

    Ok(TestBed { test_dir, ref_dir, suts })
}

/// Take both instances down, logging rather than failing: teardown runs
/// on both the clean and the diagnostic exit path.
pub fn tear_down(suts: &mut [Box<dyn SutController>]) {
    for sut in suts {
        if let Err(err) = sut.stop() {
            warn!("teardown: {err}");
        }
    }
}
