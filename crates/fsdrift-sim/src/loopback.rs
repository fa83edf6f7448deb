//! A SUT double whose "mount" is a plain kernel directory.
//!
//! Control commands that mutate the tree (`unlink`, `rename`) are executed
//! locally so both sides of the differential comparison behave
//! identically; snapshot and lifecycle operations are no-ops. This lets
//! the whole engine run end-to-end in tests without a server process.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::EngineError;
use crate::sut::{remove_tree_post_order, SutController};

pub struct LoopbackSut {
    mnt: PathBuf,
    staging: PathBuf,
    cache: PathBuf,
}

impl LoopbackSut {
    pub fn create(base: &Path) -> io::Result<Self> {
        let mnt = base.join("mnt");
        let staging = base.join("staging");
        let cache = base.join("cache");
        fs::create_dir_all(&mnt)?;
        fs::create_dir_all(&staging)?;
        fs::create_dir_all(&cache)?;
        Ok(LoopbackSut { mnt, staging, cache })
    }

    /// Drop a file into the staging area, as an unpushed SUT would have.
    pub fn stage_file(&self, name: &str, contents: &[u8]) -> io::Result<()> {
        fs::write(self.staging.join(name), contents)
    }
}

impl SutController for LoopbackSut {
    fn mount_dir(&self) -> &Path {
        &self.mnt
    }

    fn staging_dir(&self) -> &Path {
        &self.staging
    }

    fn cache_dir(&self) -> &Path {
        &self.cache
    }

    fn start(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    fn stop(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    fn remount(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    fn control(&mut self, request: &str) -> io::Result<Vec<u8>> {
        let request = request.trim_end_matches('\n');
        debug!("loopback control: {request:?}");
        if let Some(path) = request.strip_prefix("unlink ") {
            remove_tree_post_order(&self.mnt.join(path))?;
            return Ok(Vec::new());
        }
        if let Some(rest) = request.strip_prefix("rename ") {
            let (from, to) = rest.split_once(' ').ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, format!("rename wants 2 paths: {rest:?}"))
            })?;
            fs::rename(self.mnt.join(from), self.mnt.join(to))?;
            return Ok(Vec::new());
        }
        match request {
            "flush" | "push" | "trim" | "pull" => Ok(Vec::new()),
            other if other.starts_with("graft2 ") => Ok(Vec::new()),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unknown control command: {other:?}"),
            )),
        }
    }

    fn wait_for_snapshot(&mut self) -> Result<(), EngineError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirrors_unlink_and_rename() {
        let dir = tempfile::tempdir().unwrap();
        let mut sut = LoopbackSut::create(dir.path()).unwrap();
        fs::create_dir_all(sut.mount_dir().join("alfa/bravo")).unwrap();
        fs::write(sut.mount_dir().join("alfa/bravo/charlie"), b"x").unwrap();

        sut.control("rename alfa delta").unwrap();
        assert!(sut.mount_dir().join("delta/bravo/charlie").exists());

        sut.control("unlink delta").unwrap();
        assert!(!sut.mount_dir().join("delta").exists());
    }

    #[test]
    fn unknown_commands_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut sut = LoopbackSut::create(dir.path()).unwrap();
        assert!(sut.control("graft old new").is_err());
        assert!(sut.control("push").is_ok());
    }
}
