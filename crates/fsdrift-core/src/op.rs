use std::fmt;
use std::io;
use std::str::FromStr;

use crate::flags::OpenFlags;

/// The closed set of operations the fuzzer can issue.
///
/// The ordering is stable: probability ranges index into it, so new kinds
/// must only ever be appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpKind {
    Create,
    Open,
    Seek,
    Read,
    Write,
    Close,
    Unlink1,
    Unlink2,
    Truncate,
    Ftruncate,
    Mkdir,
    Rmdir,
    Rename1,
    Rename2,
    Chdir,
    SutFlush,
    SutPush,
    SutRemount,
    SutPruneCache,
    SutTrim,
    SutSwapClients,
}

impl OpKind {
    pub const COUNT: usize = 21;

    /// All kinds in enumeration order.
    pub const ALL: [OpKind; OpKind::COUNT] = [
        OpKind::Create,
        OpKind::Open,
        OpKind::Seek,
        OpKind::Read,
        OpKind::Write,
        OpKind::Close,
        OpKind::Unlink1,
        OpKind::Unlink2,
        OpKind::Truncate,
        OpKind::Ftruncate,
        OpKind::Mkdir,
        OpKind::Rmdir,
        OpKind::Rename1,
        OpKind::Rename2,
        OpKind::Chdir,
        OpKind::SutFlush,
        OpKind::SutPush,
        OpKind::SutRemount,
        OpKind::SutPruneCache,
        OpKind::SutTrim,
        OpKind::SutSwapClients,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// The canonical lower-case name used in configuration files.
    pub fn name(self) -> &'static str {
        match self {
            OpKind::Create => "create",
            OpKind::Open => "open",
            OpKind::Seek => "seek",
            OpKind::Read => "read",
            OpKind::Write => "write",
            OpKind::Close => "close",
            OpKind::Unlink1 => "unlink1",
            OpKind::Unlink2 => "unlink2",
            OpKind::Truncate => "truncate",
            OpKind::Ftruncate => "ftruncate",
            OpKind::Mkdir => "mkdir",
            OpKind::Rmdir => "rmdir",
            OpKind::Rename1 => "rename1",
            OpKind::Rename2 => "rename2",
            OpKind::Chdir => "chdir",
            OpKind::SutFlush => "sut-flush",
            OpKind::SutPush => "sut-push",
            OpKind::SutRemount => "sut-remount",
            OpKind::SutPruneCache => "sut-prune-cache",
            OpKind::SutTrim => "sut-trim",
            OpKind::SutSwapClients => "sut-swap-clients",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error returned when a configuration names an operation kind that does
/// not exist.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown operation kind: {0:?}")]
pub struct UnknownKind(pub String);

impl FromStr for OpKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OpKind::ALL
            .iter()
            .copied()
            .find(|k| k.name() == s)
            .ok_or_else(|| UnknownKind(s.to_string()))
    }
}

/// Seek origin, mirroring lseek(2)'s whence argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Start,
    Current,
    End,
}

/// A generated operation, one payload per kind.
///
/// Operations that act on an open handle refer to the `create`/`open` that
/// produced it by operation id (`parent`), resolved through the open-handle
/// table at execution time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpSpec {
    Create { path: String, mode: u32 },
    Open { path: String, flags: OpenFlags, mode: u32 },
    Seek { parent: u64, offset: i64, whence: Whence },
    Read { parent: u64, len: usize },
    Write { parent: u64, buf: Vec<u8> },
    Close { parent: u64 },
    Unlink1 { path: String },
    Unlink2 { path: String },
    Truncate { path: String, len: u64 },
    Ftruncate { parent: u64, len: u64 },
    Mkdir { path: String, mode: u32 },
    Rmdir { path: String },
    Rename1 { path: String, new_path: String },
    Rename2 { path: String, new_path: String },
    Chdir { path: String },
    SutFlush,
    SutPush,
    SutRemount,
    SutPruneCache,
    SutTrim,
    SutSwapClients,
}

impl OpSpec {
    pub fn kind(&self) -> OpKind {
        match self {
            OpSpec::Create { .. } => OpKind::Create,
            OpSpec::Open { .. } => OpKind::Open,
            OpSpec::Seek { .. } => OpKind::Seek,
            OpSpec::Read { .. } => OpKind::Read,
            OpSpec::Write { .. } => OpKind::Write,
            OpSpec::Close { .. } => OpKind::Close,
            OpSpec::Unlink1 { .. } => OpKind::Unlink1,
            OpSpec::Unlink2 { .. } => OpKind::Unlink2,
            OpSpec::Truncate { .. } => OpKind::Truncate,
            OpSpec::Ftruncate { .. } => OpKind::Ftruncate,
            OpSpec::Mkdir { .. } => OpKind::Mkdir,
            OpSpec::Rmdir { .. } => OpKind::Rmdir,
            OpSpec::Rename1 { .. } => OpKind::Rename1,
            OpSpec::Rename2 { .. } => OpKind::Rename2,
            OpSpec::Chdir { .. } => OpKind::Chdir,
            OpSpec::SutFlush => OpKind::SutFlush,
            OpSpec::SutPush => OpKind::SutPush,
            OpSpec::SutRemount => OpKind::SutRemount,
            OpSpec::SutPruneCache => OpKind::SutPruneCache,
            OpSpec::SutTrim => OpKind::SutTrim,
            OpSpec::SutSwapClients => OpKind::SutSwapClients,
        }
    }

    /// The open-handle back-reference, for the kinds that have one.
    pub fn parent(&self) -> Option<u64> {
        match self {
            OpSpec::Seek { parent, .. }
            | OpSpec::Read { parent, .. }
            | OpSpec::Write { parent, .. }
            | OpSpec::Close { parent }
            | OpSpec::Ftruncate { parent, .. } => Some(*parent),
            _ => None,
        }
    }
}

impl fmt::Display for OpSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpSpec::Create { path, mode } => write!(f, "create {path:?} mode=0{mode:o}"),
            OpSpec::Open { path, flags, mode } => {
                write!(f, "open {path:?} flags={flags} mode=0{mode:o}")
            }
            OpSpec::Seek { parent, offset, whence } => {
                write!(f, "seek parent={parent} offset={offset} whence={whence:?}")
            }
            OpSpec::Read { parent, len } => write!(f, "read parent={parent} len={len}"),
            OpSpec::Write { parent, buf } => write!(f, "write parent={parent} len={}", buf.len()),
            OpSpec::Close { parent } => write!(f, "close parent={parent}"),
            OpSpec::Unlink1 { path } => write!(f, "unlink1 {path:?}"),
            OpSpec::Unlink2 { path } => write!(f, "unlink2 {path:?}"),
            OpSpec::Truncate { path, len } => write!(f, "truncate {path:?} len={len}"),
            OpSpec::Ftruncate { parent, len } => write!(f, "ftruncate parent={parent} len={len}"),
            OpSpec::Mkdir { path, mode } => write!(f, "mkdir {path:?} mode=0{mode:o}"),
            OpSpec::Rmdir { path } => write!(f, "rmdir {path:?}"),
            OpSpec::Rename1 { path, new_path } => write!(f, "rename1 {path:?} -> {new_path:?}"),
            OpSpec::Rename2 { path, new_path } => write!(f, "rename2 {path:?} -> {new_path:?}"),
            OpSpec::Chdir { path } => write!(f, "chdir {path:?}"),
            other => f.write_str(other.kind().name()),
        }
    }
}

/// Error recorded for one side of an executed operation.
///
/// The message is the root cause (innermost source) so the two sides can be
/// compared by string equality; the errno is kept for the comparisons that
/// care about a specific error (seek's EINVAL relaxation, busy trees).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SideError {
    pub errno: Option<i32>,
    pub message: String,
}

impl SideError {
    pub fn from_io(err: &io::Error) -> Self {
        SideError {
            errno: err.raw_os_error(),
            message: crate::error::root_cause(err),
        }
    }

    pub fn message(msg: impl Into<String>) -> Self {
        SideError { errno: None, message: msg.into() }
    }

    pub fn is_errno(&self, errno: i32) -> bool {
        self.errno == Some(errno)
    }
}

impl fmt::Display for SideError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Everything one side (SUT or reference) produced for an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SideOutput {
    /// Bytes transferred, for read/write.
    pub n: usize,
    /// The buffer filled by read.
    pub buf: Vec<u8>,
    /// Returned handle for create/open/chdir; -1 when absent or failed.
    pub fd: i32,
    /// Resulting offset for seek.
    pub offset: i64,
    pub error: Option<SideError>,
}

impl Default for SideOutput {
    fn default() -> Self {
        SideOutput { n: 0, buf: Vec::new(), fd: -1, offset: 0, error: None }
    }
}

impl SideOutput {
    pub fn ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn failed(err: SideError) -> Self {
        SideOutput { error: Some(err), ..SideOutput::default() }
    }

    pub fn from_io_result<T>(res: io::Result<T>, apply: impl FnOnce(T, &mut SideOutput)) -> Self {
        let mut out = SideOutput::default();
        match res {
            Ok(value) => apply(value, &mut out),
            Err(err) => out.error = Some(SideError::from_io(&err)),
        }
        out
    }
}

/// One executed operation: the generated spec plus both sides' outputs.
#[derive(Debug, Clone)]
pub struct Operation {
    pub id: u64,
    pub spec: OpSpec,
    pub sut: SideOutput,
    pub reference: SideOutput,
}

impl Operation {
    pub fn kind(&self) -> OpKind {
        self.spec.kind()
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[op id={} {} sut:(n={} fd={} off={} err={:?}) ref:(n={} fd={} off={} err={:?})]",
            self.id,
            self.spec,
            self.sut.n,
            self.sut.fd,
            self.sut.offset,
            self.sut.error.as_ref().map(|e| &e.message),
            self.reference.n,
            self.reference.fd,
            self.reference.offset,
            self.reference.error.as_ref().map(|e| &e.message),
        )
    }
}
