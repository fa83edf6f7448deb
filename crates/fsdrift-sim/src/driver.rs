use std::path::PathBuf;

use rand_chacha::ChaCha8Rng;
use tracing::{error, info, warn};

use fsdrift_core::{
    describe_divergence, digest_tree, HashPeriods, OpSpec, Operation, ProbabilityRanges,
    ProbabilityTable,
};

use crate::error::EngineError;
use crate::generate;
use crate::state::VirtualState;
use crate::sut::SutController;

/// How many times the driver resamples before declaring the current state
/// unable to satisfy any generated operation.
pub const MAX_GENERATION_ATTEMPTS: usize = 100;

/// The sequence driver: owns the virtual state, the RNG, both SUT
/// instances and the reference directory, and runs the
/// generate → execute → compare → bookkeep → cross-check loop.
pub struct Engine {
    pub suts: Vec<Box<dyn SutController>>,
    /// Index of the instance currently being driven; rotated by the
    /// swap-clients operation.
    pub active: usize,
    pub ref_dir: PathBuf,
    pub state: VirtualState,
    pub rng: ChaCha8Rng,
    ranges: ProbabilityRanges,
    periods: HashPeriods,
    max_ops: u64,
    ops_done: u64,
    /// SUT digest after the last successful comparison.
    last_digest: Vec<u8>,
}

impl Engine {
    pub fn new(
        suts: Vec<Box<dyn SutController>>,
        ref_dir: PathBuf,
        table: &ProbabilityTable,
        periods: HashPeriods,
        max_ops: u64,
        rng: ChaCha8Rng,
    ) -> Self {
        Engine {
            suts,
            active: 0,
            ref_dir,
            state: VirtualState::new(),
            rng,
            ranges: table.ranges(),
            periods,
            max_ops,
            ops_done: 0,
            last_digest: Vec::new(),
        }
    }

    pub fn ops_done(&self) -> u64 {
        self.ops_done
    }

    pub(crate) fn active_sut_mut(&mut self) -> &mut dyn SutController {
        self.suts[self.active].as_mut()
    }

    /// Reopen the cwd handles if an operation left them closed (chdir
    /// failure, remount, swap).
    pub fn ensure_cwds(&mut self) -> Result<(), EngineError> {
        if self.state.sut_cwd == -1 || self.state.ref_cwd == -1 {
            let mnt = self.suts[self.active].mount_dir().to_path_buf();
            self.state.open_cwds(&mnt, &self.ref_dir)?;
        }
        Ok(())
    }

    /// Run random operations until `max_ops` is reached or a divergence
    /// aborts the run. Tracked handles are closed on the way out either
    /// way.
    pub fn run(&mut self) -> Result<(), EngineError> {
        info!("ranges: {}", self.ranges);
        let result = self.run_loop();
        if let Err(err) = self.state.close_all() {
            warn!("closing handles after the run: {err}");
        }
        result
    }

    fn run_loop(&mut self) -> Result<(), EngineError> {
        loop {
            self.ensure_cwds()?;
            let Some(spec) = self.next_spec()? else {
                return Ok(());
            };
            self.step_with(spec)?;
        }
    }

    /// Sample a kind and materialize an operation, retrying when the
    /// state cannot satisfy the sampled kind. `None` means the run is
    /// complete.
    fn next_spec(&mut self) -> Result<Option<OpSpec>, EngineError> {
        if self.ops_done >= self.max_ops {
            return Ok(None);
        }
        for _ in 0..MAX_GENERATION_ATTEMPTS {
            let kind = self.ranges.sample(&mut self.rng);
            if let Some(spec) = generate::next_spec(&mut self.rng, &self.state, kind) {
                return Ok(Some(spec));
            }
        }
        Err(EngineError::Unsatisfiable(MAX_GENERATION_ATTEMPTS))
    }

    /// Execute one operation on both sides, compare the outputs, update
    /// the virtual state, and cross-check the tree digests on schedule.
    pub fn step_with(&mut self, spec: OpSpec) -> Result<Operation, EngineError> {
        let op = self.execute(self.ops_done, spec)?;
        info!("{op}");
        self.outputs_match(&op)?;
        self.state.bookkeep(&op);
        self.ops_done += 1;
        if op.id > 0 {
            self.check_trees(op.id)?;
        }
        Ok(op)
    }

    fn check_trees(&mut self, id: u64) -> Result<(), EngineError> {
        let (include_metadata, include_content) = self.periods.toggles(id);
        let mnt = self.suts[self.active].mount_dir().to_path_buf();
        let sut_digest = digest_tree(&mnt, include_metadata, include_content)
            .map_err(|e| EngineError::io("hashing the fs under test", e))?;
        let ref_digest = digest_tree(&self.ref_dir, include_metadata, include_content)
            .map_err(|e| EngineError::io("hashing the reference fs", e))?;
        if sut_digest != ref_digest {
            error!(
                "tree difference between the fs under test and the reference: {}",
                describe_divergence("sut", &sut_digest, "ref", &ref_digest)
            );
            error!(
                "tree difference between the fs under test and its last good digest: {}",
                describe_divergence("sut", &sut_digest, "last-good", &self.last_digest)
            );
            return Err(EngineError::TreeDivergence { id });
        }
        self.last_digest = sut_digest;
        Ok(())
    }
}
