//! Materializes a structurally valid operation from a sampled kind and
//! the current virtual state.
//!
//! Generation is stateless with respect to its own history: everything it
//! needs comes from the tracked sets and the RNG. When a kind's
//! precondition cannot be met (a `seek` with nothing open, a `chdir` with
//! nowhere to go) it returns `None` and the driver resamples.

use std::collections::BTreeSet;

use rand::seq::SliceRandom;
use rand::Rng;

use fsdrift_core::{OpKind, OpSpec, OpenFlags, Whence};

use crate::state::{path_has_prefix, VirtualState};

/// Pathname components are drawn from here.
pub const NATO_ALPHABET: [&str; 26] = [
    "alfa", "bravo", "charlie", "delta", "echo", "foxtrot", "golf", "hotel", "india", "juliett",
    "kilo", "lima", "mike", "november", "oscar", "papa", "quebec", "romeo", "sierra", "tango",
    "uniform", "victor", "whiskey", "x-ray", "yankee", "zulu",
];

const PATH_ATTEMPTS: usize = 100;

/// Produce the payload for `kind`, or `None` if the current state cannot
/// satisfy its preconditions.
pub fn next_spec<R: Rng>(rng: &mut R, state: &VirtualState, kind: OpKind) -> Option<OpSpec> {
    match kind {
        OpKind::Create => Some(OpSpec::Create {
            // 5% existing directory, 5% existing file, else a new node
            // with a 20% chance of nesting.
            path: random_pathname(rng, state, 5, 5, 20),
            mode: 0o777,
        }),
        OpKind::Open => {
            let flags = random_open_flags(rng);
            let mode = if flags.requires_mode() { 0o777 } else { 0 };
            Some(OpSpec::Open { path: random_pathname(rng, state, 25, 65, 20), flags, mode })
        }
        OpKind::Seek => Some(OpSpec::Seek {
            parent: random_parent(rng, state)?,
            offset: rng.gen_range(0..1024),
            whence: match rng.gen_range(0..3) {
                0 => Whence::Start,
                1 => Whence::Current,
                _ => Whence::End,
            },
        }),
        OpKind::Read => Some(OpSpec::Read {
            parent: random_parent(rng, state)?,
            len: rng.gen_range(0..512),
        }),
        OpKind::Write => {
            let parent = random_parent(rng, state)?;
            let mut buf = vec![0u8; rng.gen_range(0..512)];
            rng.fill(buf.as_mut_slice());
            Some(OpSpec::Write { parent, buf })
        }
        OpKind::Close => Some(OpSpec::Close { parent: random_parent(rng, state)? }),
        OpKind::Unlink1 => Some(OpSpec::Unlink1 { path: random_pathname(rng, state, 25, 65, 20) }),
        OpKind::Unlink2 => {
            let path = random_pathname(rng, state, 50, 40, 20);
            // Removing the tree holding the cwd would make swapping
            // clients impossible.
            if path_has_prefix(&state.cwd_path, &path) {
                return None;
            }
            Some(OpSpec::Unlink2 { path })
        }
        OpKind::Truncate => Some(OpSpec::Truncate {
            path: random_pathname(rng, state, 10, 70, 50),
            len: rng.gen_range(0..512),
        }),
        OpKind::Ftruncate => Some(OpSpec::Ftruncate {
            parent: random_parent(rng, state)?,
            len: rng.gen_range(0..512),
        }),
        OpKind::Mkdir => Some(OpSpec::Mkdir {
            path: random_pathname(rng, state, 10, 10, 20),
            mode: 0o777,
        }),
        OpKind::Rmdir => Some(OpSpec::Rmdir { path: random_pathname(rng, state, 65, 15, 20) }),
        OpKind::Rename1 => {
            let path = if rng.gen_range(0..2) == 0 {
                random_tracked(rng, &state.existing_dirs, state, 5, 75)?
            } else {
                random_tracked(rng, &state.existing_files, state, 5, 75)?
            };
            let word = random_word(rng);
            let new_path = match path.rsplit_once('/') {
                Some((dir, _)) => format!("{dir}/{word}"),
                None => word.to_string(),
            };
            Some(OpSpec::Rename1 { path, new_path })
        }
        OpKind::Rename2 => {
            let (path, new_path) = match rng.gen_range(0..4) {
                0 => (
                    random_tracked(rng, &state.existing_files, state, 3, 75)?,
                    random_tracked(rng, &state.existing_files, state, 3, 75)?,
                ),
                1 => (
                    random_tracked(rng, &state.existing_dirs, state, 3, 75)?,
                    random_tracked(rng, &state.existing_dirs, state, 3, 75)?,
                ),
                2 => (
                    random_tracked(rng, &state.existing_files, state, 3, 75)?,
                    random_tracked(rng, &state.existing_dirs, state, 3, 75)?,
                ),
                _ => (
                    random_tracked(rng, &state.existing_dirs, state, 3, 75)?,
                    random_tracked(rng, &state.existing_files, state, 3, 75)?,
                ),
            };
            Some(OpSpec::Rename2 { path, new_path })
        }
        OpKind::Chdir => {
            let path = random_tracked(rng, &state.existing_dirs, state, 3, 100)?;
            if path == state.cwd_path {
                return None;
            }
            Some(OpSpec::Chdir { path })
        }
        OpKind::SutFlush => Some(OpSpec::SutFlush),
        OpKind::SutPush => Some(OpSpec::SutPush),
        OpKind::SutRemount => Some(OpSpec::SutRemount),
        OpKind::SutPruneCache => Some(OpSpec::SutPruneCache),
        OpKind::SutTrim => Some(OpSpec::SutTrim),
        OpKind::SutSwapClients => Some(OpSpec::SutSwapClients),
    }
}

fn random_word<R: Rng>(rng: &mut R) -> &'static str {
    NATO_ALPHABET.choose(rng).unwrap()
}

fn random_parent<R: Rng>(rng: &mut R, state: &VirtualState) -> Option<u64> {
    state.open_ops.choose(rng).map(|h| h.op_id)
}

/// Open in read-write mode 90% of the time so read and write actually
/// exercise data paths instead of collecting EBADF.
fn random_open_flags<R: Rng>(rng: &mut R) -> OpenFlags {
    if rng.gen_range(0..10) < 9 {
        return OpenFlags::RDWR;
    }
    OpenFlags::from_bits_retain(rng.gen::<i32>() & OpenFlags::supported().bits())
}

fn pick<R: Rng>(rng: &mut R, set: &BTreeSet<String>) -> String {
    let i = rng.gen_range(0..set.len());
    set.iter().nth(i).unwrap().clone()
}

/// Draw a pathname: an existing directory with probability `p_dir`, an
/// existing file with probability `p_file`, otherwise a fresh node
/// (nested under an existing directory with probability `p_nest`).
fn random_pathname<R: Rng>(
    rng: &mut R,
    state: &VirtualState,
    p_dir: u32,
    p_file: u32,
    p_nest: u32,
) -> String {
    let n = rng.gen_range(0..100);
    let tracked = if n < p_dir {
        &state.existing_dirs
    } else if n < p_dir + p_file {
        &state.existing_files
    } else {
        &EMPTY
    };
    if !tracked.is_empty() {
        return pick(rng, tracked);
    }
    if !state.existing_dirs.is_empty() && rng.gen_range(0..100) < p_nest {
        let dir = pick(rng, &state.existing_dirs);
        return format!("{dir}/{}", random_word(rng));
    }
    random_word(rng).to_string()
}

static EMPTY: BTreeSet<String> = BTreeSet::new();

/// With probability `p_existing`, a tracked entry from `set` no deeper
/// than `max_elements`; otherwise a fresh `max_elements`-deep candidate
/// avoiding tracked paths (best effort, bounded attempts).
fn random_tracked<R: Rng>(
    rng: &mut R,
    set: &BTreeSet<String>,
    state: &VirtualState,
    max_elements: usize,
    p_existing: u32,
) -> Option<String> {
    if rng.gen_range(0..100) < p_existing {
        let eligible: Vec<&String> =
            set.iter().filter(|p| p.split('/').count() <= max_elements).collect();
        return eligible.choose(rng).map(|p| (*p).clone());
    }
    let mut candidate = fresh_candidate(rng, max_elements);
    for _ in 0..PATH_ATTEMPTS {
        if !state.existing_files.contains(&candidate) && !state.existing_dirs.contains(&candidate) {
            break;
        }
        candidate = fresh_candidate(rng, max_elements);
    }
    Some(candidate)
}

fn fresh_candidate<R: Rng>(rng: &mut R, elements: usize) -> String {
    let parts: Vec<&str> = (0..elements).map(|_| random_word(rng)).collect();
    parts.join("/")
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use crate::state::OpenHandle;

    use super::*;

    fn rng() -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(0xdecaf)
    }

    #[test]
    fn handle_kinds_need_an_open_op() {
        let state = VirtualState::new();
        let mut rng = rng();
        for kind in [OpKind::Seek, OpKind::Read, OpKind::Write, OpKind::Close, OpKind::Ftruncate] {
            assert_eq!(next_spec(&mut rng, &state, kind), None, "{kind}");
        }
    }

    #[test]
    fn handle_kinds_reference_a_tracked_parent() {
        let mut state = VirtualState::new();
        state.open_ops.push(OpenHandle { op_id: 9, path: "alfa".into(), sut_fd: 3, ref_fd: 4 });
        let mut rng = rng();
        match next_spec(&mut rng, &state, OpKind::Read) {
            Some(OpSpec::Read { parent, len }) => {
                assert_eq!(parent, 9);
                assert!(len < 512);
            }
            other => panic!("unexpected spec: {other:?}"),
        }
    }

    #[test]
    fn create_always_generates() {
        let state = VirtualState::new();
        let mut rng = rng();
        for _ in 0..100 {
            match next_spec(&mut rng, &state, OpKind::Create) {
                Some(OpSpec::Create { path, mode }) => {
                    assert!(!path.is_empty());
                    assert_eq!(mode, 0o777);
                }
                other => panic!("unexpected spec: {other:?}"),
            }
        }
    }

    #[test]
    fn unlink_tree_never_targets_the_cwd() {
        let mut state = VirtualState::new();
        state.cwd_path = "alfa/bravo".into();
        state.existing_dirs.insert("alfa".into());
        state.existing_dirs.insert("alfa/bravo".into());
        state.existing_files.insert("charlie".into());
        let mut rng = rng();
        for _ in 0..500 {
            if let Some(OpSpec::Unlink2 { path }) = next_spec(&mut rng, &state, OpKind::Unlink2) {
                assert!(!path_has_prefix(&state.cwd_path, &path), "{path}");
            }
        }
    }

    #[test]
    fn chdir_needs_a_different_existing_dir() {
        let mut state = VirtualState::new();
        let mut rng = rng();
        assert_eq!(next_spec(&mut rng, &state, OpKind::Chdir), None);

        state.existing_dirs.insert("delta".into());
        let mut seen = false;
        for _ in 0..50 {
            if let Some(OpSpec::Chdir { path }) = next_spec(&mut rng, &state, OpKind::Chdir) {
                assert_eq!(path, "delta");
                seen = true;
            }
        }
        assert!(seen);
    }

    #[test]
    fn rename_sibling_keeps_the_directory() {
        let mut state = VirtualState::new();
        state.existing_files.insert("golf/hotel".into());
        state.existing_dirs.insert("golf".into());
        let mut rng = rng();
        for _ in 0..200 {
            if let Some(OpSpec::Rename1 { path, new_path }) =
                next_spec(&mut rng, &state, OpKind::Rename1)
            {
                if path.contains('/') {
                    let dir = path.rsplit_once('/').unwrap().0;
                    assert!(new_path.starts_with(&format!("{dir}/")), "{path} -> {new_path}");
                }
            }
        }
    }

    #[test]
    fn open_flags_stay_within_the_supported_set() {
        let mut rng = rng();
        for _ in 0..1000 {
            let flags = random_open_flags(&mut rng);
            assert_eq!(flags, flags.filter_supported());
        }
    }

    #[test]
    fn sut_kinds_have_no_payload() {
        let state = VirtualState::new();
        let mut rng = rng();
        assert_eq!(next_spec(&mut rng, &state, OpKind::SutPush), Some(OpSpec::SutPush));
        assert_eq!(
            next_spec(&mut rng, &state, OpKind::SutSwapClients),
            Some(OpSpec::SutSwapClients)
        );
    }
}
