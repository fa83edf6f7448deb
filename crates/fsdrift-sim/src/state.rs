use std::collections::BTreeSet;
use std::os::unix::io::RawFd;
use std::path::Path;

use fsdrift_core::{OpSpec, Operation};
use tracing::debug;

use crate::error::EngineError;
use crate::sys;

/// An unfinished `create`/`open`: the only valid parent for `seek`,
/// `read`, `write`, `close` and `ftruncate`.
#[derive(Debug, Clone)]
pub struct OpenHandle {
    pub op_id: u64,
    pub path: String,
    pub sut_fd: RawFd,
    pub ref_fd: RawFd,
}

/// Tracked view of the filesystem shared by both sides.
///
/// Paths are logical, relative to the mount root; the empty string is the
/// root itself. The sets mirror what exists on the reference filesystem
/// after every matched operation, and the cwd handles are the directory
/// descriptors every `*at` call resolves against.
#[derive(Debug)]
pub struct VirtualState {
    pub existing_dirs: BTreeSet<String>,
    pub existing_files: BTreeSet<String>,
    pub open_ops: Vec<OpenHandle>,
    pub cwd_path: String,
    pub sut_cwd: RawFd,
    pub ref_cwd: RawFd,
}

impl Default for VirtualState {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualState {
    pub fn new() -> Self {
        VirtualState {
            existing_dirs: BTreeSet::new(),
            existing_files: BTreeSet::new(),
            open_ops: Vec::new(),
            cwd_path: String::new(),
            sut_cwd: -1,
            ref_cwd: -1,
        }
    }

    pub fn handle(&self, op_id: u64) -> Option<&OpenHandle> {
        self.open_ops.iter().find(|h| h.op_id == op_id)
    }

    /// Open both cwd handles at the tracked cwd path. The handles must be
    /// closed on both sides when this is called; a half-open state is an
    /// invariant violation, not something to paper over.
    pub fn open_cwds(&mut self, sut_mnt: &Path, ref_root: &Path) -> Result<(), EngineError> {
        if self.sut_cwd != -1 || self.ref_cwd != -1 {
            return Err(EngineError::Invariant(format!(
                "open_cwds: not both closed: sut_cwd={} ref_cwd={}",
                self.sut_cwd, self.ref_cwd
            )));
        }
        let sut_path = sut_mnt.join(&self.cwd_path);
        debug!("opening {} as sut cwd", sut_path.display());
        let sut_cwd = sys::open(&sut_path, sys::cwd_open_flags(), 0)
            .map_err(|e| EngineError::io(format!("opening {}", sut_path.display()), e))?;
        let ref_path = ref_root.join(&self.cwd_path);
        debug!("opening {} as ref cwd", ref_path.display());
        let ref_cwd = match sys::open(&ref_path, sys::cwd_open_flags(), 0) {
            Ok(fd) => fd,
            Err(e) => {
                let _ = sys::close(sut_cwd);
                return Err(EngineError::io(format!("opening {}", ref_path.display()), e));
            }
        };
        self.sut_cwd = sut_cwd;
        self.ref_cwd = ref_cwd;
        debug!("sut_cwd={} ref_cwd={}", self.sut_cwd, self.ref_cwd);
        Ok(())
    }

    pub fn close_cwds(&mut self) -> Result<(), EngineError> {
        if self.sut_cwd != -1 {
            let fd = self.sut_cwd;
            self.sut_cwd = -1;
            sys::close(fd).map_err(|e| EngineError::io(format!("closing sut cwd {fd}"), e))?;
        }
        if self.ref_cwd != -1 {
            let fd = self.ref_cwd;
            self.ref_cwd = -1;
            sys::close(fd).map_err(|e| EngineError::io(format!("closing ref cwd {fd}"), e))?;
        }
        Ok(())
    }

    /// Close every tracked handle, then both cwd handles. Called before a
    /// remount or swap and on the way out of a run.
    pub fn close_all(&mut self) -> Result<(), EngineError> {
        for handle in std::mem::take(&mut self.open_ops) {
            if handle.sut_fd != -1 {
                sys::close(handle.sut_fd)
                    .map_err(|e| EngineError::io(format!("closing sut fd for op {}", handle.op_id), e))?;
            }
            if handle.ref_fd != -1 {
                sys::close(handle.ref_fd)
                    .map_err(|e| EngineError::io(format!("closing ref fd for op {}", handle.op_id), e))?;
            }
            debug!("closed handles of op {}", handle.op_id);
        }
        self.close_cwds()
    }

    /// Convert a logical path to the cwd-relative form handed to `*at`
    /// syscalls.
    pub fn relativize(&self, path: &str) -> String {
        let rel = relative_path(&self.cwd_path, path);
        debug!("remapped {path:?} to {rel:?} relative to {:?}", self.cwd_path);
        rel
    }

    /// Apply the state mutation for a matched operation. Only called once
    /// the outputs have been compared; failures leave the sets untouched
    /// except where noted (`chdir` records the cwd path on success; its
    /// descriptors are tracked by the executor, which owns the transition).
    pub fn bookkeep(&mut self, op: &Operation) {
        let succeeded = op.reference.ok();
        match &op.spec {
            OpSpec::Create { path, .. } | OpSpec::Open { path, .. } => {
                if succeeded {
                    if !self.existing_dirs.contains(path) {
                        self.existing_files.insert(path.clone());
                    }
                    self.open_ops.push(OpenHandle {
                        op_id: op.id,
                        path: path.clone(),
                        sut_fd: op.sut.fd,
                        ref_fd: op.reference.fd,
                    });
                }
            }
            OpSpec::Close { parent } => {
                if succeeded {
                    self.open_ops.retain(|h| h.op_id != *parent);
                }
            }
            OpSpec::Unlink1 { path } => {
                if succeeded {
                    self.existing_files.remove(path);
                }
            }
            OpSpec::Unlink2 { path } => {
                if succeeded {
                    self.existing_dirs.retain(|d| !path_has_prefix(d, path));
                    self.existing_files.retain(|f| !path_has_prefix(f, path));
                }
            }
            OpSpec::Mkdir { path, .. } => {
                if succeeded {
                    self.existing_dirs.insert(path.clone());
                }
            }
            OpSpec::Rmdir { path } => {
                if succeeded {
                    self.existing_dirs.remove(path);
                }
            }
            OpSpec::Rename1 { path, new_path } | OpSpec::Rename2 { path, new_path } => {
                if succeeded {
                    if path_has_prefix(&self.cwd_path, path) {
                        let new_cwd_path = format!("{new_path}{}", &self.cwd_path[path.len()..]);
                        let prev = std::mem::replace(&mut self.cwd_path, new_cwd_path);
                        debug!("changed cwd_path from {prev:?} to {:?} after rename", self.cwd_path);
                    }
                    rewrite_prefix(&mut self.existing_files, path, new_path);
                    rewrite_prefix(&mut self.existing_dirs, path, new_path);
                }
            }
            OpSpec::Chdir { path } => {
                if succeeded {
                    debug!("updated cwd_path from {:?} to {path:?} after chdir", self.cwd_path);
                    self.cwd_path = path.clone();
                }
            }
            OpSpec::Seek { .. }
            | OpSpec::Read { .. }
            | OpSpec::Write { .. }
            | OpSpec::Truncate { .. }
            | OpSpec::Ftruncate { .. }
            | OpSpec::SutFlush
            | OpSpec::SutPush
            | OpSpec::SutRemount
            | OpSpec::SutPruneCache
            | OpSpec::SutTrim
            | OpSpec::SutSwapClients => {}
        }
        debug_assert!(
            self.existing_dirs.is_disjoint(&self.existing_files),
            "a path is tracked as both file and directory after {}",
            op.kind()
        );
    }
}

/// Segment-aware prefix test: `alfa` is a prefix of `alfa` and
/// `alfa/bravo`, but not of `alfabet`.
pub fn path_has_prefix(path: &str, prefix: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    path == prefix
        || (path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/'))
}

fn rewrite_prefix(set: &mut BTreeSet<String>, old: &str, new: &str) {
    let moved: Vec<String> = set.iter().filter(|p| path_has_prefix(p, old)).cloned().collect();
    for path in moved {
        set.remove(&path);
        set.insert(format!("{new}{}", &path[old.len()..]));
    }
}

/// Compute `target` relative to `base`, both taken as absolute logical
/// paths rooted at the mount.
fn relative_path(base: &str, target: &str) -> String {
    let base: Vec<&str> = base.split('/').filter(|s| !s.is_empty()).collect();
    let target: Vec<&str> = target.split('/').filter(|s| !s.is_empty()).collect();
    let common = base.iter().zip(target.iter()).take_while(|(b, t)| b == t).count();
    let mut parts: Vec<&str> = vec![".."; base.len() - common];
    parts.extend(&target[common..]);
    if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}
