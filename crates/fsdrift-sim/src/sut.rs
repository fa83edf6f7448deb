//! The narrow seam between the engine and a system under test.
//!
//! The engine only ever sees a [`SutController`]: directories to operate
//! in, a textual control channel, and lifecycle operations. [`ProcessSut`]
//! is the real thing, one server process mounted over 9P; tests use
//! [`crate::loopback::LoopbackSut`].

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::error::EngineError;

/// Maximum control-channel response size.
const MAX_RESPONSE: usize = 16384;

/// One instance of the filesystem under test.
pub trait SutController {
    /// Where the filesystem is mounted; logical paths resolve under here.
    fn mount_dir(&self) -> &Path;

    /// The staging area holding dirty blocks not yet pushed.
    fn staging_dir(&self) -> &Path;

    /// The local block cache.
    fn cache_dir(&self) -> &Path;

    /// Bring the instance up (spawn and mount).
    fn start(&mut self) -> Result<(), EngineError>;

    /// Take the instance down (unmount and stop).
    fn stop(&mut self) -> Result<(), EngineError>;

    /// Full bounce: unmount, stop, start, mount. The caller is responsible
    /// for closing every handle into the mount first.
    fn remount(&mut self) -> Result<(), EngineError>;

    /// Send one command over the control channel and return the response
    /// (up to 16 KiB). Errors are operation results, not run failures: the
    /// comparator decides whether they match the reference side.
    fn control(&mut self, request: &str) -> io::Result<Vec<u8>>;

    /// Block until the propagation log reports the snapshot done.
    fn wait_for_snapshot(&mut self) -> Result<(), EngineError>;

    /// Delete every regular file under the cache directory.
    fn prune_cache(&self) -> io::Result<()> {
        prune_files(self.cache_dir())
    }
}

/// Remove regular files under `dir`, recursively, keeping directories.
pub(crate) fn prune_files(dir: &Path) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            prune_files(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Remove the subtree rooted at `path`, children before parents, the way
/// the SUT's recursive unlink behaves.
pub(crate) fn remove_tree_post_order(path: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.is_dir() {
        for entry in fs::read_dir(path)? {
            remove_tree_post_order(&entry?.path())?;
        }
        fs::remove_dir(path)?;
    } else {
        fs::remove_file(path)?;
    }
    Ok(())
}

/// A server process serving the filesystem under test over a unix socket,
/// mounted over 9P under its own base directory.
pub struct ProcessSut {
    base: PathBuf,
    cache: PathBuf,
    ctl: PathBuf,
    mnt: PathBuf,
    propagation_log: PathBuf,
    socket: PathBuf,
    staging: PathBuf,
    server_bin: String,
    child: Option<Child>,
}

impl ProcessSut {
    /// Lay out the instance directory and write the server's config file.
    /// Both instances of a run share `test_dir` (and with it the on-disk
    /// store and the encryption key) so push and pull exchange snapshots.
    pub fn create(
        test_dir: &Path,
        sut_dir: &Path,
        server_bin: &str,
        encryption_key: &[u8],
    ) -> Result<Self, EngineError> {
        let mkdir = |path: &Path, mode: u32| -> Result<(), EngineError> {
            fs::DirBuilder::new()
                .mode(mode)
                .create(path)
                .map_err(|e| EngineError::io(format!("creating {}", path.display()), e))
        };
        mkdir(sut_dir, 0o700)?;
        let mnt = sut_dir.join("mnt");
        mkdir(&mnt, 0o777)?;
        fs::set_permissions(&mnt, fs::Permissions::from_mode(0o777))
            .map_err(|e| EngineError::io(format!("chmod {}", mnt.display()), e))?;

        let socket = sut_dir.join("sut.sock");
        let key_hex: String = encryption_key.iter().map(|b| format!("{b:02x}")).collect();
        let config = format!(
            "storage disk\n\
             disk-store-dir {store}\n\
             encryption-key {key_hex}\n\
             listen-net unix\n\
             listen-addr {socket}\n\
             mount-point {mnt}\n",
            store = test_dir.join("store").display(),
            socket = socket.display(),
            mnt = mnt.display(),
        );
        let config_path = sut_dir.join("config");
        let mut f = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&config_path)
            .map_err(|e| EngineError::io(format!("creating {}", config_path.display()), e))?;
        f.write_all(config.as_bytes())
            .map_err(|e| EngineError::io(format!("writing {}", config_path.display()), e))?;

        Ok(ProcessSut {
            cache: sut_dir.join("cache"),
            ctl: mnt.join("ctl"),
            mnt,
            propagation_log: sut_dir.join("propagation.log"),
            socket,
            staging: sut_dir.join("staging"),
            base: sut_dir.to_path_buf(),
            server_bin: server_bin.to_string(),
            child: None,
        })
    }

    fn spawn(&mut self) -> Result<(), EngineError> {
        let open_log = |name: &str| -> Result<File, EngineError> {
            let path = self.base.join(name);
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| EngineError::io(format!("creating {}", path.display()), e))
        };
        let stdout = open_log("stdout")?;
        let stderr = open_log("stderr")?;
        let child = Command::new(&self.server_bin)
            .arg("-debug")
            .current_dir(&self.base)
            .env("SUT_BASE", &self.base)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|e| EngineError::io(format!("spawning {}", self.server_bin), e))?;

        // The server is up once its socket accepts connections.
        let mut last_err = None;
        for _ in 0..10 {
            match UnixStream::connect(&self.socket) {
                Ok(_) => {
                    self.child = Some(child);
                    return Ok(());
                }
                Err(e) => {
                    last_err = Some(e);
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
        }
        Err(EngineError::Sut(format!(
            "{} did not come up on {}: {}",
            self.server_bin,
            self.socket.display(),
            last_err.expect("no connect attempt recorded"),
        )))
    }

    fn interrupt(&mut self) -> Result<(), EngineError> {
        let Some(mut child) = self.child.take() else {
            return Err(EngineError::Sut("stop: server is not running".into()));
        };
        let pid = child.id() as libc::pid_t;
        if unsafe { libc::kill(pid, libc::SIGINT) } < 0 {
            return Err(EngineError::io(
                format!("could not interrupt {pid}"),
                io::Error::last_os_error(),
            ));
        }
        child
            .wait()
            .map_err(|e| EngineError::io(format!("could not wait {pid}"), e))?;
        Ok(())
    }

    fn mount(&self) -> Result<(), EngineError> {
        let uid = unsafe { libc::getuid() };
        let gid = unsafe { libc::getgid() };
        let output = Command::new("sudo")
            .arg("mount")
            .arg("-t")
            .arg("9p")
            .arg(&self.socket)
            .arg(&self.mnt)
            .arg("-o")
            .arg(format!("trans=unix,dfltuid={uid},dfltgid={gid}"))
            .output()
            .map_err(|e| EngineError::io("running mount", e))?;
        if !output.status.success() {
            info!("mount: {}", String::from_utf8_lossy(&output.stdout));
            return Err(EngineError::Sut(format!(
                "mounting {} on {}: {}",
                self.socket.display(),
                self.mnt.display(),
                String::from_utf8_lossy(&output.stderr).trim(),
            )));
        }
        info!("mounted {} on {}", self.socket.display(), self.mnt.display());
        Ok(())
    }

    fn unmount(&self) -> Result<(), EngineError> {
        let status = Command::new("sudo")
            .arg("umount")
            .arg(&self.mnt)
            .status()
            .map_err(|e| EngineError::io("running umount", e))?;
        if !status.success() {
            error!("could not unmount {} (running lsof to diagnose)", self.mnt.display());
            let lsof = Command::new("sudo").arg("lsof").arg(&self.mnt).status();
            if let Err(e) = lsof {
                warn!("lsof failed: {e}");
            }
            return Err(EngineError::Sut(format!("unmounting {}", self.mnt.display())));
        }
        Ok(())
    }

    fn is_propagating(&self) -> Result<bool, EngineError> {
        let text = fs::read_to_string(&self.propagation_log)
            .map_err(|e| EngineError::io(format!("reading {}", self.propagation_log.display()), e))?;
        Ok(text.lines().any(|line| !line.starts_with('d')))
    }
}

impl SutController for ProcessSut {
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
        self.spawn()?;
        self.mount()
    }

    fn stop(&mut self) -> Result<(), EngineError> {
        self.unmount()?;
        self.interrupt()
    }

    fn remount(&mut self) -> Result<(), EngineError> {
        self.unmount()?;
        self.interrupt()?;
        self.spawn()?;
        self.mount()
    }

    fn control(&mut self, request: &str) -> io::Result<Vec<u8>> {
        let mut f = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o666)
            .open(&self.ctl)?;
        let mut framed = request.to_string();
        if !framed.ends_with('\n') {
            framed.push('\n');
        }
        if let Err(err) = f.write_all(framed.as_bytes()) {
            return Err(strip_ctl_prefix(err));
        }
        f.seek(SeekFrom::Start(0))?;
        let mut buf = vec![0u8; MAX_RESPONSE];
        let n = f.read(&mut buf)?;
        buf.truncate(n);
        debug!("control: request={request:?} response={:?}", String::from_utf8_lossy(&buf));
        Ok(buf)
    }

    fn wait_for_snapshot(&mut self) -> Result<(), EngineError> {
        for _ in 0..25 {
            if !self.is_propagating()? {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(250));
        }
        Err(EngineError::SnapshotTimeout)
    }
}

/// Error responses surface as write-time errors whose message carries a
/// `write ... ctl: ` prefix; keep only what the server actually said.
fn strip_ctl_prefix(err: io::Error) -> io::Error {
    let text = err.to_string();
    if text.starts_with("write ") {
        if let Some(i) = text.find("ctl: ") {
            return io::Error::new(err.kind(), text[i + 5..].to_string());
        }
    }
    err
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prune_keeps_directories_and_drops_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("a"), b"x").unwrap();
        fs::write(dir.path().join("sub/b"), b"y").unwrap();
        prune_files(dir.path()).unwrap();
        assert!(dir.path().join("sub").is_dir());
        assert!(!dir.path().join("a").exists());
        assert!(!dir.path().join("sub/b").exists());
    }

    #[test]
    fn remove_tree_takes_out_the_whole_subtree() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        fs::write(dir.path().join("a/b/c"), b"z").unwrap();
        remove_tree_post_order(&dir.path().join("a")).unwrap();
        assert!(!dir.path().join("a").exists());
    }

    #[test]
    fn ctl_prefix_is_stripped() {
        let err = io::Error::new(io::ErrorKind::Other, "write /mnt/ctl: tree is busy");
        assert_eq!(strip_ctl_prefix(err).to_string(), "tree is busy");
        let err = io::Error::new(io::ErrorKind::Other, "something else entirely");
        assert_eq!(strip_ctl_prefix(err).to_string(), "something else entirely");
    }
}
