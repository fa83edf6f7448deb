use std::fmt;

bitflags::bitflags! {
    /// Bitset over the open(2) flag space.
    ///
    /// `O_RDONLY` is zero, so the access mode is not representable as a
    /// flag bit; it lives in the low `O_ACCMODE` bits and is read through
    /// [`OpenFlags::access_mode`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: i32 {
        const WRONLY = libc::O_WRONLY;
        const RDWR = libc::O_RDWR;

        const CLOEXEC = libc::O_CLOEXEC;
        const CREAT = libc::O_CREAT;
        const DIRECTORY = libc::O_DIRECTORY;
        const EXCL = libc::O_EXCL;
        const NOCTTY = libc::O_NOCTTY;
        const NOFOLLOW = libc::O_NOFOLLOW;
        const TRUNC = libc::O_TRUNC;
        const TMPFILE = libc::O_TMPFILE;

        const APPEND = libc::O_APPEND;
        const ASYNC = libc::O_ASYNC;
        const DIRECT = libc::O_DIRECT;
        const DSYNC = libc::O_DSYNC;
        const LARGEFILE = libc::O_LARGEFILE;
        const NOATIME = libc::O_NOATIME;
        const NONBLOCK = libc::O_NONBLOCK;
        const SYNC = libc::O_SYNC;
        const PATH = libc::O_PATH;
    }
}

impl OpenFlags {
    /// The subset the system under test is expected to honor. Matching the
    /// kernel for the rest (O_DIRECT, O_SYNC, O_PATH, O_TMPFILE, ...) is
    /// not worth the cost; they are filtered out before execution.
    pub fn supported() -> OpenFlags {
        OpenFlags::APPEND
            | OpenFlags::ASYNC
            | OpenFlags::CLOEXEC
            | OpenFlags::CREAT
            | OpenFlags::DIRECTORY
            | OpenFlags::EXCL
            | OpenFlags::LARGEFILE
            | OpenFlags::NOATIME
            | OpenFlags::NOCTTY
            | OpenFlags::NOFOLLOW
            | OpenFlags::NONBLOCK
            | OpenFlags::RDWR
            | OpenFlags::TRUNC
            | OpenFlags::WRONLY
    }

    /// creat(2) is equivalent to open(2) with these flags.
    pub fn create_equivalent() -> OpenFlags {
        OpenFlags::CREAT | OpenFlags::WRONLY | OpenFlags::TRUNC
    }

    /// The access mode field (`O_RDONLY`, `O_WRONLY` or `O_RDWR`).
    pub fn access_mode(self) -> i32 {
        self.bits() & libc::O_ACCMODE
    }

    /// Restrict to the supported set plus the access-mode bits; applied by
    /// the executor before the flags reach openat(2).
    pub fn filter_supported(self) -> OpenFlags {
        OpenFlags::from_bits_retain(
            self.bits() & (OpenFlags::supported().bits() | libc::O_ACCMODE),
        )
    }

    /// Whether a mode argument is required (file may be created).
    pub fn requires_mode(self) -> bool {
        self.contains(OpenFlags::CREAT)
            || self.bits() & libc::O_TMPFILE == libc::O_TMPFILE
    }
}

impl fmt::Display for OpenFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: &[(i32, &str)] = &[
            (libc::O_WRONLY, "O_WRONLY"),
            (libc::O_RDWR, "O_RDWR"),
            (libc::O_CLOEXEC, "O_CLOEXEC"),
            (libc::O_CREAT, "O_CREAT"),
            (libc::O_DIRECTORY, "O_DIRECTORY"),
            (libc::O_EXCL, "O_EXCL"),
            (libc::O_NOCTTY, "O_NOCTTY"),
            (libc::O_NOFOLLOW, "O_NOFOLLOW"),
            (libc::O_TRUNC, "O_TRUNC"),
            (libc::O_APPEND, "O_APPEND"),
            (libc::O_ASYNC, "O_ASYNC"),
            (libc::O_DIRECT, "O_DIRECT"),
            (libc::O_DSYNC, "O_DSYNC"),
            (libc::O_NOATIME, "O_NOATIME"),
            (libc::O_NONBLOCK, "O_NONBLOCK"),
            (libc::O_SYNC, "O_SYNC"),
        ];
        let bits = self.bits();
        let mut parts: Vec<&str> = Vec::new();
        let mut known = 0;
        for (bit, name) in NAMES {
            known |= *bit;
            if *bit != 0 && bits & *bit == *bit {
                parts.push(name);
            }
        }
        let rest = bits & !known;
        if parts.is_empty() && rest == 0 {
            return f.write_str("0");
        }
        write!(f, "{}", parts.join("|"))?;
        if rest != 0 {
            if !parts.is_empty() {
                f.write_str("|")?;
            }
            write!(f, "0x{rest:x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_equivalent_matches_creat() {
        let flags = OpenFlags::create_equivalent();
        assert!(flags.contains(OpenFlags::CREAT));
        assert!(flags.contains(OpenFlags::WRONLY));
        assert!(flags.contains(OpenFlags::TRUNC));
        assert_eq!(flags.access_mode(), libc::O_WRONLY);
    }

    #[test]
    fn filter_drops_unsupported_status_flags() {
        let flags = OpenFlags::RDWR | OpenFlags::DIRECT | OpenFlags::SYNC | OpenFlags::APPEND;
        let filtered = flags.filter_supported();
        assert!(filtered.contains(OpenFlags::RDWR));
        assert!(filtered.contains(OpenFlags::APPEND));
        assert!(!filtered.intersects(OpenFlags::DIRECT | OpenFlags::SYNC));
    }

    #[test]
    fn filter_keeps_the_access_mode() {
        let flags = OpenFlags::from_bits_retain(libc::O_WRONLY | libc::O_DIRECT);
        assert_eq!(flags.filter_supported().access_mode(), libc::O_WRONLY);
    }

    #[test]
    fn mode_required_for_creat_and_tmpfile() {
        assert!(OpenFlags::create_equivalent().requires_mode());
        assert!(OpenFlags::from_bits_retain(libc::O_TMPFILE | libc::O_RDWR).requires_mode());
        assert!(!OpenFlags::RDWR.requires_mode());
    }

    #[test]
    fn display_names_flags() {
        let flags = OpenFlags::RDWR | OpenFlags::APPEND;
        assert_eq!(flags.to_string(), "O_RDWR|O_APPEND");
        assert_eq!(OpenFlags::empty().to_string(), "0");
    }
}
