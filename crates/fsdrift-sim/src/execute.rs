//! Dual execution: every operation is applied to the system under test
//! and to the reference filesystem in immediate succession, on the same
//! thread, and both outputs are recorded for comparison.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::warn;

use fsdrift_core::{OpKind, OpSpec, OpenFlags, Operation, SideError, SideOutput};

use crate::driver::Engine;
use crate::error::EngineError;
use crate::sut::remove_tree_post_order;
use crate::sys;

impl Engine {
    pub(crate) fn execute(&mut self, id: u64, spec: OpSpec) -> Result<Operation, EngineError> {
        let mut op = Operation {
            id,
            spec,
            sut: SideOutput::default(),
            reference: SideOutput::default(),
        };
        match op.spec.clone() {
            OpSpec::Create { path, mode } => {
                self.require_cwds()?;
                let rel = self.state.relativize(&path);
                let flags = OpenFlags::create_equivalent().bits();
                op.sut = SideOutput::from_io_result(
                    sys::openat(self.state.sut_cwd, &rel, flags, mode),
                    |fd, out| out.fd = fd,
                );
                op.reference = SideOutput::from_io_result(
                    sys::openat(self.state.ref_cwd, &rel, flags, mode),
                    |fd, out| out.fd = fd,
                );
            }
            OpSpec::Open { path, flags, mode } => {
                self.require_cwds()?;
                let rel = self.state.relativize(&path);
                let raw = flags.filter_supported().bits();
                op.sut = SideOutput::from_io_result(
                    sys::openat(self.state.sut_cwd, &rel, raw, mode),
                    |fd, out| out.fd = fd,
                );
                op.reference = SideOutput::from_io_result(
                    sys::openat(self.state.ref_cwd, &rel, raw, mode),
                    |fd, out| out.fd = fd,
                );
            }
            OpSpec::Seek { parent, offset, whence } => {
                let (sut_fd, ref_fd) = self.parent_fds(parent)?;
                op.sut = SideOutput::from_io_result(sys::lseek(sut_fd, offset, whence), |off, out| {
                    out.offset = off
                });
                op.reference =
                    SideOutput::from_io_result(sys::lseek(ref_fd, offset, whence), |off, out| {
                        out.offset = off
                    });
            }
            OpSpec::Read { parent, len } => {
                let (sut_fd, ref_fd) = self.parent_fds(parent)?;
                let mut sut_buf = vec![0u8; len];
                let mut ref_buf = vec![0u8; len];
                op.sut = SideOutput::from_io_result(sys::read(sut_fd, &mut sut_buf), |n, out| {
                    out.n = n
                });
                op.sut.buf = sut_buf;
                op.reference = SideOutput::from_io_result(sys::read(ref_fd, &mut ref_buf), |n, out| {
                    out.n = n
                });
                op.reference.buf = ref_buf;
            }
            OpSpec::Write { parent, buf } => {
                let (sut_fd, ref_fd) = self.parent_fds(parent)?;
                op.sut = SideOutput::from_io_result(sys::write(sut_fd, &buf), |n, out| out.n = n);
                op.reference =
                    SideOutput::from_io_result(sys::write(ref_fd, &buf), |n, out| out.n = n);
            }
            OpSpec::Close { parent } => {
                let (sut_fd, ref_fd) = self.parent_fds(parent)?;
                op.sut = SideOutput::from_io_result(sys::close(sut_fd), |_, _| {});
                op.reference = SideOutput::from_io_result(sys::close(ref_fd), |_, _| {});
            }
            OpSpec::Unlink1 { path } => {
                self.require_cwds()?;
                let rel = self.state.relativize(&path);
                op.sut = SideOutput::from_io_result(
                    sys::unlinkat(self.state.sut_cwd, &rel, 0),
                    |_, _| {},
                );
                op.reference = SideOutput::from_io_result(
                    sys::unlinkat(self.state.ref_cwd, &rel, 0),
                    |_, _| {},
                );
            }
            OpSpec::Unlink2 { path } => {
                match self.active_sut_mut().control(&format!("unlink {path}")) {
                    Ok(_) => op.reference = self.reference_unlink_tree(&path),
                    Err(err) => {
                        let side = SideError::from_io(&err);
                        // The SUT refuses to unlink trees pinned by open
                        // fids; mirror the refusal instead of mutating the
                        // reference.
                        if is_busy(&side) {
                            op.sut.error = Some(side.clone());
                            op.reference.error = Some(side);
                        } else {
                            op.sut.error = Some(side);
                            op.reference = self.reference_unlink_tree(&path);
                        }
                    }
                }
            }
            OpSpec::Truncate { path, len } => {
                let mnt = self.active_mount();
                op.sut = SideOutput::from_io_result(
                    sys::truncate(&mnt.join(&path), len as i64),
                    |_, _| {},
                );
                op.reference = SideOutput::from_io_result(
                    sys::truncate(&self.ref_dir.join(&path), len as i64),
                    |_, _| {},
                );
            }
            OpSpec::Ftruncate { parent, len } => {
                let (sut_fd, ref_fd) = self.parent_fds(parent)?;
                op.sut = SideOutput::from_io_result(sys::ftruncate(sut_fd, len as i64), |_, _| {});
                op.reference =
                    SideOutput::from_io_result(sys::ftruncate(ref_fd, len as i64), |_, _| {});
            }
            OpSpec::Mkdir { path, mode } => {
                self.require_cwds()?;
                let rel = self.state.relativize(&path);
                op.sut = SideOutput::from_io_result(
                    sys::mkdirat(self.state.sut_cwd, &rel, mode),
                    |_, _| {},
                );
                op.reference = SideOutput::from_io_result(
                    sys::mkdirat(self.state.ref_cwd, &rel, mode),
                    |_, _| {},
                );
            }
            OpSpec::Rmdir { path } => {
                self.require_cwds()?;
                let rel = self.state.relativize(&path);
                op.sut = SideOutput::from_io_result(
                    sys::unlinkat(self.state.sut_cwd, &rel, libc::AT_REMOVEDIR),
                    |_, _| {},
                );
                op.reference = SideOutput::from_io_result(
                    sys::unlinkat(self.state.ref_cwd, &rel, libc::AT_REMOVEDIR),
                    |_, _| {},
                );
            }
            OpSpec::Rename1 { path, new_path } => {
                let mnt = self.active_mount();
                op.sut = SideOutput::from_io_result(
                    fs::rename(mnt.join(&path), mnt.join(&new_path)),
                    |_, _| {},
                );
                op.reference = SideOutput::from_io_result(
                    fs::rename(self.ref_dir.join(&path), self.ref_dir.join(&new_path)),
                    |_, _| {},
                );
            }
            OpSpec::Rename2 { path, new_path } => {
                match self.active_sut_mut().control(&format!("rename {path} {new_path}")) {
                    Ok(_) => {
                        op.reference = SideOutput::from_io_result(
                            fs::rename(self.ref_dir.join(&path), self.ref_dir.join(&new_path)),
                            |_, _| {},
                        );
                    }
                    Err(err) => {
                        let side = SideError::from_io(&err);
                        if is_busy(&side) {
                            op.sut.error = Some(side.clone());
                            op.reference.error = Some(side);
                        } else {
                            op.sut.error = Some(side);
                            op.reference = SideOutput::from_io_result(
                                fs::rename(self.ref_dir.join(&path), self.ref_dir.join(&new_path)),
                                |_, _| {},
                            );
                        }
                    }
                }
            }
            OpSpec::Chdir { path } => {
                self.require_cwds()?;
                let sut_target = self.active_mount().join(&path);
                let ref_target = self.ref_dir.join(&path);
                let (fd, err) = chdir_side(self.state.sut_cwd, &sut_target);
                // The executor owns the descriptor transition so the
                // tracked state never points at closed descriptors, even
                // when the comparison later fails.
                self.state.sut_cwd = fd;
                op.sut.fd = fd;
                op.sut.error = err;
                let (fd, err) = chdir_side(self.state.ref_cwd, &ref_target);
                self.state.ref_cwd = fd;
                op.reference.fd = fd;
                op.reference.error = err;
            }
            OpSpec::SutFlush => op.sut = self.control_output("flush"),
            OpSpec::SutPush => op.sut = self.control_output("push"),
            OpSpec::SutTrim => op.sut = self.control_output("trim"),
            OpSpec::SutRemount => {
                let result = self
                    .state
                    .close_all()
                    .and_then(|_| self.suts[self.active].remount());
                if let Err(err) = result {
                    op.sut.error = Some(SideError::message(err.to_string()));
                }
            }
            OpSpec::SutPruneCache => {
                if let Err(err) = self.prune_cache_flow() {
                    op.sut.error = Some(SideError::message(err.to_string()));
                }
            }
            OpSpec::SutSwapClients => {
                if let Err(err) = self.swap_clients_flow() {
                    op.sut.error = Some(SideError::message(err.to_string()));
                }
            }
        }
        Ok(op)
    }

    fn control_output(&mut self, command: &str) -> SideOutput {
        match self.active_sut_mut().control(command) {
            Ok(_) => SideOutput::default(),
            Err(err) => SideOutput::failed(SideError::from_io(&err)),
        }
    }

    fn require_cwds(&self) -> Result<(), EngineError> {
        if self.state.sut_cwd < 0 || self.state.ref_cwd < 0 {
            return Err(EngineError::Invariant(format!(
                "cwd handles not open: sut_cwd={} ref_cwd={}",
                self.state.sut_cwd, self.state.ref_cwd
            )));
        }
        Ok(())
    }

    fn parent_fds(&self, parent: u64) -> Result<(i32, i32), EngineError> {
        let handle = self.state.handle(parent).ok_or_else(|| {
            EngineError::Invariant(format!("no open handle for parent operation {parent}"))
        })?;
        Ok((handle.sut_fd, handle.ref_fd))
    }

    fn active_mount(&self) -> PathBuf {
        self.suts[self.active].mount_dir().to_path_buf()
    }

    fn reference_unlink_tree(&self, path: &str) -> SideOutput {
        SideOutput::from_io_result(remove_tree_post_order(&self.ref_dir.join(path)), |_, _| {})
    }

    fn prune_cache_flow(&mut self) -> Result<(), EngineError> {
        self.active_sut_mut()
            .control("push")
            .map_err(|e| EngineError::io("push", e))?;
        self.suts[self.active].wait_for_snapshot()?;
        self.suts[self.active]
            .prune_cache()
            .map_err(|e| EngineError::io("pruning cache", e))?;
        Ok(())
    }

    /// Promote the other instance: flush everything out of the current
    /// one, wait for the snapshot to propagate, then replay the new
    /// instance's pull worklog back at it.
    fn swap_clients_flow(&mut self) -> Result<(), EngineError> {
        self.state.close_all()?;
        self.active_sut_mut()
            .control("push")
            .map_err(|e| EngineError::io("push before swap", e))?;
        self.suts[self.active].wait_for_snapshot()?;
        self.active = (self.active + 1) % self.suts.len();
        let worklog = self
            .active_sut_mut()
            .control("pull")
            .map_err(|e| EngineError::io("pull after swap", e))?;
        let text = String::from_utf8_lossy(&worklog).into_owned();
        for command in text.lines() {
            tracing::debug!("pull worklog command {command:?}");
            if command.starts_with('#') {
                continue;
            }
            if command.starts_with("graft2 ")
                || command.starts_with("unlink ")
                || command == "flush"
                || command == "pull"
            {
                self.active_sut_mut().control(command).map_err(|e| {
                    EngineError::Sut(format!("running worklog command {command:?}: {e}"))
                })?;
            } else {
                return Err(EngineError::Sut(format!(
                    "unexpected command from pull worklog: {command:?}"
                )));
            }
        }
        Ok(())
    }

    /// Compare the recorded outputs of both sides; a mismatch fails the
    /// run. Also checks post-conditions of SUT-only operations.
    pub(crate) fn outputs_match(&mut self, op: &Operation) -> Result<(), EngineError> {
        if !errors_match(op) {
            return Err(EngineError::Mismatch {
                op: op.to_string(),
                detail: "mismatching errors".into(),
            });
        }
        if !op.reference.ok() {
            return Ok(());
        }
        match op.kind() {
            OpKind::Create | OpKind::Open => {
                if op.sut.fd < 0 || op.reference.fd < 0 {
                    return Err(EngineError::Mismatch {
                        op: op.to_string(),
                        detail: "negative fd(s)".into(),
                    });
                }
            }
            OpKind::Seek => {
                // Offsets are tracked by the kernel on each side; the SUT
                // never even sees the call, so divergence is suspicious
                // but not conclusive.
                if op.sut.offset != op.reference.offset {
                    warn!(
                        "different offsets after seek: sut={} ref={}",
                        op.sut.offset, op.reference.offset
                    );
                }
            }
            OpKind::Read => {
                if op.sut.n != op.reference.n {
                    return Err(EngineError::Mismatch {
                        op: op.to_string(),
                        detail: "read: number of bytes mismatch".into(),
                    });
                }
                if op.sut.buf != op.reference.buf {
                    return Err(EngineError::Mismatch {
                        op: op.to_string(),
                        detail: format!(
                            "read: mismatch sut={:?} ref={:?}",
                            String::from_utf8_lossy(&op.sut.buf),
                            String::from_utf8_lossy(&op.reference.buf),
                        ),
                    });
                }
            }
            OpKind::Write => {
                if op.sut.n != op.reference.n {
                    return Err(EngineError::Mismatch {
                        op: op.to_string(),
                        detail: "write: number of bytes mismatch".into(),
                    });
                }
            }
            OpKind::SutPush => self.check_staging_empty(op)?,
            _ => {}
        }
        Ok(())
    }

    fn check_staging_empty(&mut self, op: &Operation) -> Result<(), EngineError> {
        let staging = self.suts[self.active].staging_dir().to_path_buf();
        let found = find_regular_file(&staging)
            .map_err(|e| EngineError::io(format!("walking {}", staging.display()), e))?;
        if found.is_none() {
            return Ok(());
        }
        // A removed file with a fid still pointing at it legitimately
        // keeps the staging area populated; close everything and look
        // again.
        self.state.close_all()?;
        if let Some(file) = find_regular_file(&staging)
            .map_err(|e| EngineError::io(format!("walking {}", staging.display()), e))?
        {
            return Err(EngineError::Mismatch {
                op: op.to_string(),
                detail: format!("staging not empty after push: {}", file.display()),
            });
        }
        Ok(())
    }
}

fn errors_match(op: &Operation) -> bool {
    let sut = op.sut.error.as_ref();
    let reference = op.reference.error.as_ref();
    match op.kind() {
        // SUT-specific semantics diverge from the reference filesystem by
        // design; only agreement on success vs failure is required.
        OpKind::Rename2 | OpKind::Unlink2 => sut.is_some() == reference.is_some(),
        OpKind::Seek
            if sut.is_none() && reference.map_or(false, |e| e.is_errno(libc::EINVAL)) =>
        {
            warn!("seek succeeded on the fs under test, EINVAL on the reference (9p quirk)");
            true
        }
        _ => match (sut, reference) {
            (Some(a), Some(b)) => a.message == b.message,
            (None, None) => true,
            _ => false,
        },
    }
}

/// One side of a chdir: close the old cwd handle, open the new one.
/// Failure leaves that side at -1; the driver reopens both handles before
/// the next operation.
fn chdir_side(old_fd: i32, target: &Path) -> (i32, Option<SideError>) {
    if let Err(err) = sys::close(old_fd) {
        return (-1, Some(SideError::from_io(&err)));
    }
    match sys::open(target, sys::cwd_open_flags(), 0) {
        Ok(fd) => (fd, None),
        Err(err) => (-1, Some(SideError::from_io(&err))),
    }
}

fn is_busy(err: &SideError) -> bool {
    err.is_errno(libc::EBUSY) || err.message.contains("resource busy")
}

fn find_regular_file(dir: &Path) -> io::Result<Option<PathBuf>> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            if let Some(found) = find_regular_file(&path)? {
                return Ok(Some(found));
            }
        } else {
            return Ok(Some(path));
        }
    }
    Ok(None)
}
