use std::fs;
use std::path::Path;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use fsdrift_core::{digest_tree, HashPeriods, OpSpec, OpenFlags, ProbabilityTable, Whence};
use fsdrift_sim::{Engine, EngineError, LoopbackSut};

/// Build an engine over two loopback instances sharing one backing
/// directory (two clients of the same store) and a reference directory.
fn engine(dir: &Path, seed: u64, max_ops: u64, periods: &str) -> Engine {
    let ref_dir = dir.join("ref");
    fs::create_dir(&ref_dir).unwrap();
    let sut0 = LoopbackSut::create(&dir.join("sut")).unwrap();
    let sut1 = LoopbackSut::create(&dir.join("sut")).unwrap();
    Engine::new(
        vec![Box::new(sut0), Box::new(sut1)],
        ref_dir,
        &ProbabilityTable::uniform(),
        periods.parse::<HashPeriods>().unwrap(),
        max_ops,
        ChaCha8Rng::seed_from_u64(seed),
    )
}

#[test]
fn zero_ops_is_a_clean_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut eng = engine(dir.path(), 1, 0, "1,1");
    eng.run().unwrap();
    assert_eq!(eng.ops_done(), 0);
}

#[test]
fn random_run_against_the_loopback_sut_is_clean() {
    for seed in [7, 42, 1234] {
        let dir = tempfile::tempdir().unwrap();
        let mut eng = engine(dir.path(), seed, 80, "1,5");
        eng.run().unwrap_or_else(|e| panic!("seed {seed}: {e}"));
        assert_eq!(eng.ops_done(), 80);
    }
}

#[test]
fn create_then_close_leaves_an_empty_file_on_both_sides() {
    let dir = tempfile::tempdir().unwrap();
    let mut eng = engine(dir.path(), 1, u64::MAX, "1,1");
    eng.ensure_cwds().unwrap();

    let op = eng
        .step_with(OpSpec::Create { path: "alfa".into(), mode: 0o777 })
        .unwrap();
    assert_eq!(op.id, 0);
    assert!(op.sut.fd >= 0 && op.reference.fd >= 0);
    assert!(eng.state.existing_files.contains("alfa"));
    assert!(eng.state.handle(0).is_some());

    eng.step_with(OpSpec::Close { parent: 0 }).unwrap();
    assert!(eng.state.handle(0).is_none());
    assert_eq!(eng.ops_done(), 2);

    assert_eq!(fs::read(dir.path().join("sut/mnt/alfa")).unwrap(), b"");
    assert_eq!(fs::read(dir.path().join("ref/alfa")).unwrap(), b"");
    let digest =
        String::from_utf8(digest_tree(&dir.path().join("ref"), true, false).unwrap()).unwrap();
    assert!(digest.contains("path=\"alfa\" size=0"), "{digest}");
}

#[test]
fn write_seek_read_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let mut eng = engine(dir.path(), 1, u64::MAX, "1,1");
    eng.ensure_cwds().unwrap();

    eng.step_with(OpSpec::Open {
        path: "bravo".into(),
        flags: OpenFlags::CREAT | OpenFlags::RDWR,
        mode: 0o777,
    })
    .unwrap();
    let op = eng
        .step_with(OpSpec::Write { parent: 0, buf: b"hello".to_vec() })
        .unwrap();
    assert_eq!(op.sut.n, 5);
    assert_eq!(op.reference.n, 5);

    let op = eng
        .step_with(OpSpec::Seek { parent: 0, offset: 0, whence: Whence::Start })
        .unwrap();
    assert_eq!(op.sut.offset, 0);

    let op = eng.step_with(OpSpec::Read { parent: 0, len: 5 }).unwrap();
    assert_eq!(op.sut.buf, b"hello");
    assert_eq!(op.reference.buf, b"hello");

    eng.step_with(OpSpec::Close { parent: 0 }).unwrap();

    let digest =
        String::from_utf8(digest_tree(&dir.path().join("sut/mnt"), false, true).unwrap()).unwrap();
    // SHA-256 of "hello".
    assert!(
        digest.contains("2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"),
        "{digest}"
    );
}

#[test]
fn renaming_the_directory_holding_the_cwd_rewrites_it() {
    let dir = tempfile::tempdir().unwrap();
    let mut eng = engine(dir.path(), 1, u64::MAX, "1,1");
    eng.ensure_cwds().unwrap();

    eng.step_with(OpSpec::Mkdir { path: "charlie".into(), mode: 0o777 }).unwrap();
    eng.step_with(OpSpec::Chdir { path: "charlie".into() }).unwrap();
    assert_eq!(eng.state.cwd_path, "charlie");

    eng.step_with(OpSpec::Rename1 { path: "charlie".into(), new_path: "delta".into() })
        .unwrap();
    assert_eq!(eng.state.cwd_path, "delta");
    assert!(eng.state.existing_dirs.contains("delta"));
    assert!(!eng.state.existing_dirs.contains("charlie"));
    assert!(dir.path().join("sut/mnt/delta").is_dir());
    assert!(dir.path().join("ref/delta").is_dir());

    // The rewritten cwd keeps relative operations working on both sides.
    eng.step_with(OpSpec::Create { path: "delta/echo".into(), mode: 0o777 }).unwrap();
    eng.step_with(OpSpec::Close { parent: 3 }).unwrap();
    assert!(dir.path().join("sut/mnt/delta/echo").is_file());
    assert!(dir.path().join("ref/delta/echo").is_file());
}

#[test]
fn injected_divergence_aborts_with_a_tree_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let mut eng = engine(dir.path(), 1, u64::MAX, "1,1");
    eng.ensure_cwds().unwrap();

    eng.step_with(OpSpec::Create { path: "alfa".into(), mode: 0o777 }).unwrap();
    eng.step_with(OpSpec::Close { parent: 0 }).unwrap();

    // Flip a byte on the reference only; the next operation's digest
    // comparison must catch it.
    fs::write(dir.path().join("ref/alfa"), b"corrupted").unwrap();
    let err = eng
        .step_with(OpSpec::Mkdir { path: "bravo".into(), mode: 0o777 })
        .unwrap_err();
    assert!(matches!(err, EngineError::TreeDivergence { .. }), "{err}");
}

#[test]
fn recursive_unlink_via_the_control_channel_matches_the_reference_walk() {
    let dir = tempfile::tempdir().unwrap();
    let mut eng = engine(dir.path(), 1, u64::MAX, "1,1");
    eng.ensure_cwds().unwrap();

    eng.step_with(OpSpec::Mkdir { path: "golf".into(), mode: 0o777 }).unwrap();
    eng.step_with(OpSpec::Create { path: "golf/hotel".into(), mode: 0o777 }).unwrap();
    eng.step_with(OpSpec::Close { parent: 1 }).unwrap();

    eng.step_with(OpSpec::Unlink2 { path: "golf".into() }).unwrap();
    assert!(!dir.path().join("sut/mnt/golf").exists());
    assert!(!dir.path().join("ref/golf").exists());
    assert!(eng.state.existing_dirs.is_empty());
    assert!(eng.state.existing_files.is_empty());

    // Unlinking something that is gone fails identically on both sides,
    // which the relaxed comparison accepts.
    eng.step_with(OpSpec::Unlink2 { path: "golf".into() }).unwrap();
}

#[test]
fn swap_clients_promotes_the_other_instance() {
    let dir = tempfile::tempdir().unwrap();
    let mut eng = engine(dir.path(), 1, u64::MAX, "1,1");
    eng.ensure_cwds().unwrap();

    eng.step_with(OpSpec::Create { path: "india".into(), mode: 0o777 }).unwrap();
    eng.step_with(OpSpec::SutSwapClients).unwrap();
    assert_eq!(eng.active, 1);
    assert!(eng.state.open_ops.is_empty(), "swap closes every tracked handle");

    // The loop reopens the cwd handles on the new active instance.
    eng.ensure_cwds().unwrap();
    eng.step_with(OpSpec::Create { path: "juliett".into(), mode: 0o777 }).unwrap();
    assert!(dir.path().join("sut/mnt/juliett").is_file());
}

#[test]
fn push_fails_when_the_staging_area_keeps_files() {
    let dir = tempfile::tempdir().unwrap();
    let ref_dir = dir.path().join("ref");
    fs::create_dir(&ref_dir).unwrap();
    let sut0 = LoopbackSut::create(&dir.path().join("sut")).unwrap();
    sut0.stage_file("dirty-block", b"x").unwrap();
    let sut1 = LoopbackSut::create(&dir.path().join("sut")).unwrap();
    let mut eng = Engine::new(
        vec![Box::new(sut0), Box::new(sut1)],
        ref_dir,
        &ProbabilityTable::uniform(),
        "1,1".parse().unwrap(),
        u64::MAX,
        ChaCha8Rng::seed_from_u64(1),
    );
    eng.ensure_cwds().unwrap();

    let err = eng.step_with(OpSpec::SutPush).unwrap_err();
    assert!(matches!(err, EngineError::Mismatch { .. }), "{err}");
    assert!(err.to_string().contains("staging not empty"), "{err}");
}
