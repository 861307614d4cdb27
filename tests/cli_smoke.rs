//! CLI startup smoke tests.
//!
//! Verifies that subcommands that need no network exit cleanly without
//! panicking. Uses `std::process::Command` against the compiled binary.

use std::process::Command;

fn prbar_bin() -> std::path::PathBuf {
    env!("CARGO_BIN_EXE_prbar").into()
}

#[test]
fn help_exits_zero() {
    let output = Command::new(prbar_bin())
        .arg("--help")
        .output()
        .expect("failed to run prbar --help");

    assert!(
        output.status.success(),
        "prbar --help failed:\nstdout: {}\nstderr: {}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr),
    );

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("prbar"), "help output should mention 'prbar': {stdout}");
    assert!(stdout.contains("reset"), "help should list subcommands: {stdout}");
}

#[test]
fn version_exits_zero() {
    let output = Command::new(prbar_bin())
        .arg("--version")
        .output()
        .expect("failed to run prbar --version");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains("prbar"),
        "version output should mention 'prbar': {stdout}"
    );
}

#[test]
fn reset_and_ledger_on_empty_state_dir() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = dir.path().join("missing.toml");

    for sub in ["reset", "ledger"] {
        let output = Command::new(prbar_bin())
            .arg("-C")
            .arg(dir.path())
            .arg("--config")
            .arg(&config)
            .arg(sub)
            .output()
            .expect("failed to run prbar");

        assert!(
            output.status.success(),
            "prbar {sub} failed:\nstdout: {}\nstderr: {}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr),
        );
    }
}

#[test]
fn ledger_lists_entries() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("ledger.tsv"),
        "merged/acme/app#42\tt:2024-01-02T00:00:00Z\n",
    )
    .unwrap();

    let output = Command::new(prbar_bin())
        .arg("--state-dir")
        .arg(dir.path())
        .arg("--config")
        .arg(dir.path().join("missing.toml"))
        .arg("ledger")
        .output()
        .expect("failed to run prbar ledger");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("merged/acme/app#42"), "ledger output: {stdout}");
}
