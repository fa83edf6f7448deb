use std::fmt::Write as _;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use sha2::{Digest, Sha256};

/// Produce a deterministic textual digest of the subtree rooted at `root`.
///
/// Nodes are visited in lexicographic basename order at every level; the
/// root itself is described with an empty relative path. One line per
/// node:
///
/// - directory (metadata): `path="R" mode=0MMM`
/// - regular file (metadata): `path="R" size=N mode=0MMM`
/// - regular file (content): `path="R" hash=HH..` (lowercase-hex SHA-256)
///
/// The format is diffable, not just comparable, and is kept byte-stable
/// across runs so digests can be compared between processes.
pub fn digest_tree(
    root: &Path,
    include_metadata: bool,
    include_content: bool,
) -> io::Result<Vec<u8>> {
    let mut out = String::new();
    digest_node(&mut out, root, "", include_metadata, include_content)?;
    Ok(out.into_bytes())
}

fn digest_node(
    out: &mut String,
    base: &Path,
    rel: &str,
    include_metadata: bool,
    include_content: bool,
) -> io::Result<()> {
    let full = if rel.is_empty() { base.to_path_buf() } else { base.join(rel) };
    let meta = fs::metadata(&full)?;
    let mode = meta.permissions().mode() & 0o7777;

    if meta.is_dir() {
        if include_metadata {
            let _ = writeln!(out, "path={rel:?} mode=0{mode:o}");
        }
        let mut names: Vec<String> = Vec::new();
        for entry in fs::read_dir(&full)? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        for name in names {
            let child = if rel.is_empty() { name } else { format!("{rel}/{name}") };
            digest_node(out, base, &child, include_metadata, include_content)?;
        }
    } else {
        if include_metadata {
            let _ = writeln!(out, "path={rel:?} size={} mode=0{mode:o}", meta.len());
        }
        if include_content {
            let data = fs::read(&full)?;
            let hash = Sha256::digest(&data);
            let _ = write!(out, "path={rel:?} hash=");
            for byte in hash {
                let _ = write!(out, "{byte:02x}");
            }
            out.push('\n');
        }
    }
    Ok(())
}

/// Render the first point where two digests disagree, line by line.
pub fn describe_divergence(
    left_label: &str,
    left: &[u8],
    right_label: &str,
    right: &[u8],
) -> String {
    let left_text = String::from_utf8_lossy(left);
    let right_text = String::from_utf8_lossy(right);
    let mut left_lines = left_text.lines();
    let mut right_lines = right_text.lines();
    let mut line = 0;
    loop {
        line += 1;
        match (left_lines.next(), right_lines.next()) {
            (None, None) => return format!("{left_label} and {right_label} are identical"),
            (l, r) if l == r => continue,
            (l, r) => {
                return format!(
                    "line {line}: {left_label}: {} | {right_label}: {}",
                    l.unwrap_or("<missing>"),
                    r.unwrap_or("<missing>"),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs::Permissions;

    use super::*;

    fn write_file(path: &Path, contents: &[u8], mode: u32) {
        fs::write(path, contents).unwrap();
        fs::set_permissions(path, Permissions::from_mode(mode)).unwrap();
    }

    fn scratch_tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::set_permissions(dir.path(), Permissions::from_mode(0o755)).unwrap();
        fs::create_dir(dir.path().join("bravo")).unwrap();
        fs::set_permissions(dir.path().join("bravo"), Permissions::from_mode(0o755)).unwrap();
        write_file(&dir.path().join("alfa"), b"hello", 0o644);
        write_file(&dir.path().join("bravo/charlie"), b"", 0o600);
        dir
    }

    #[test]
    fn digest_is_deterministic() {
        let dir = scratch_tree();
        let a = digest_tree(dir.path(), true, true).unwrap();
        let b = digest_tree(dir.path(), true, true).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn digest_format_is_stable() {
        let dir = scratch_tree();
        let digest = digest_tree(dir.path(), true, false).unwrap();
        let expected = "path=\"\" mode=0755\n\
                        path=\"alfa\" size=5 mode=0644\n\
                        path=\"bravo\" mode=0755\n\
                        path=\"bravo/charlie\" size=0 mode=0600\n";
        assert_eq!(String::from_utf8(digest).unwrap(), expected);
    }

    #[test]
    fn content_lines_hold_the_sha256() {
        let dir = scratch_tree();
        let digest = String::from_utf8(digest_tree(dir.path(), false, true).unwrap()).unwrap();
        // SHA-256 of "hello".
        assert!(digest.contains(
            "path=\"alfa\" hash=2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        ));
        // SHA-256 of the empty input.
        assert!(digest.contains(
            "path=\"bravo/charlie\" hash=e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        ));
    }

    #[test]
    fn metadata_digest_ignores_content_changes_of_equal_size() {
        let dir = scratch_tree();
        let before = digest_tree(dir.path(), true, false).unwrap();
        write_file(&dir.path().join("alfa"), b"world", 0o644);
        let after = digest_tree(dir.path(), true, false).unwrap();
        assert_eq!(before, after);

        let with_content = digest_tree(dir.path(), true, true).unwrap();
        let reverted = {
            write_file(&dir.path().join("alfa"), b"hello", 0o644);
            digest_tree(dir.path(), true, true).unwrap()
        };
        assert_ne!(with_content, reverted);
    }

    #[test]
    fn divergence_reports_the_first_differing_line() {
        let dir = scratch_tree();
        let before = digest_tree(dir.path(), true, false).unwrap();
        write_file(&dir.path().join("alfa"), b"longer than before", 0o644);
        let after = digest_tree(dir.path(), true, false).unwrap();
        let report = describe_divergence("sut", &after, "ref", &before);
        assert!(report.contains("line 2"), "{report}");
        assert!(report.contains("size=18"), "{report}");
        assert!(report.contains("size=5"), "{report}");
    }

    #[test]
    fn identical_digests_say_so() {
        let report = describe_divergence("sut", b"a\n", "ref", b"a\n");
        assert!(report.contains("identical"));
    }
}
