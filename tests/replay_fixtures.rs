//! Golden replay fixtures
//!
//! Every `.json` file under `tests/replays/` is replayed against the echo
//! engine in strict mode. The `dir-test` macro generates one test per file, so
//! adding a fixture needs no registration. Each fixture uses its own port.

use dir_test::{dir_test, Fixture};
use replay_harness::{
    config::HarnessConfig, logger::HarnessLogger, replay::Replay, verify::run_replay,
    verify::StrictPolicy,
};
use similar_asserts::assert_eq;
use std::path::Path;
use std::time::Duration;

#[dir_test(
    dir: "$CARGO_MANIFEST_DIR/tests/replays",
    glob: "**/*.json",
)]
fn test_fixture_replay(fixture: Fixture<&str>) {
    let path = Path::new(fixture.path());
    let before = Replay::load(path).unwrap();

    let config = HarnessConfig::new(env!("CARGO_BIN_EXE_echo_engine"))
        .with_receive_timeout(Duration::from_secs(5));
    let logger = HarnessLogger::capturing();
    let verdict = run_replay(path, &config, &mut StrictPolicy, &logger)
        .unwrap_or_else(|e| panic!("{} failed: {e}", fixture.path()));

    assert_eq!(verdict.actions_replayed, before.actions.len());
    assert_eq!(verdict.payloads_updated, 0);
}

/// Loading then saving a fixture must not change what it decodes to
#[dir_test(
    dir: "$CARGO_MANIFEST_DIR/tests/replays",
    glob: "**/*.json",
)]
fn test_fixture_round_trip(fixture: Fixture<&str>) {
    let original = Replay::from_json(fixture.content()).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let copy = dir.path().join("copy.json");
    original.save(&copy).unwrap();

    assert_eq!(Replay::load(&copy).unwrap(), original);
}
