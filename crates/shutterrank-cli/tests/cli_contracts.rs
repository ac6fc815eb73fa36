#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;
use ulid::Ulid;

fn sr_binary_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_sr"))
}

fn sr_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(sr_binary_path());
    command.arg("--db").arg(db_path);
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run sr command {:?}: {err}", args),
    }
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn assert_success(output: &Output, context: &str) {
    assert!(
        output.status.success(),
        "{context} failed\nstdout={}\nstderr={}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

fn temp_path(tag: &str, suffix: &str) -> PathBuf {
    std::env::temp_dir().join(format!("shutterrank-it-{tag}-{}.{suffix}", Ulid::new()))
}

fn write_fixture_catalog(path: &Path) {
    let catalog = serde_json::json!([
        {
            "id": "alpine-lake",
            "display_url": "https://photos.example/alpine-lake/800/600",
            "title": "Alpine Lake",
            "width": 800,
            "height": 600
        },
        {
            "id": "city-dusk",
            "display_url": "https://photos.example/city-dusk/800/600",
            "title": "City at Dusk",
            "width": 800,
            "height": 600
        },
        {
            "id": "desert-ridge",
            "display_url": "https://photos.example/desert-ridge/800/600",
            "title": "Desert Ridge"
        }
    ]);

    match std::fs::write(path, catalog.to_string()) {
        Ok(()) => {}
        Err(err) => panic!("failed to write fixture catalog: {err}"),
    }
}

#[test]
fn help_contract_lists_expected_subcommands() {
    let output = match Command::new(sr_binary_path()).arg("--help").output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in [
        "catalog",
        "vote",
        "undo",
        "standings",
        "next",
        "replay",
        "log",
        "config",
    ] {
        assert!(
            stdout.contains(required),
            "help output missing subcommand {required}"
        );
    }
}

#[test]
fn end_to_end_vote_standings_next_and_backup_round_trip() {
    let db_path = temp_path("e2e", "sqlite3");
    let catalog_path = temp_path("catalog", "json");
    let backup_path = temp_path("backup", "json");
    write_fixture_catalog(&catalog_path);

    let catalog_str = match catalog_path.to_str() {
        Some(value) => value,
        None => panic!("temp catalog path must be valid UTF-8"),
    };
    let backup_str = match backup_path.to_str() {
        Some(value) => value,
        None => panic!("temp backup path must be valid UTF-8"),
    };

    let import = sr_output(&db_path, &["catalog", "import", "--file", catalog_str]);
    assert_success(&import, "catalog import");

    for (winner, loser, at) in [
        ("alpine-lake", "city-dusk", "2026-03-01T10:00:00Z"),
        ("alpine-lake", "desert-ridge", "2026-03-01T10:01:00Z"),
        ("city-dusk", "desert-ridge", "2026-03-01T10:02:00Z"),
    ] {
        let vote = sr_output(
            &db_path,
            &[
                "vote",
                "--winner",
                winner,
                "--loser",
                loser,
                "--occurred-at",
                at,
            ],
        );
        assert_success(&vote, "vote");
    }

    let standings = sr_output(&db_path, &["standings", "--json"]);
    assert_success(&standings, "standings");
    let standings_value = stdout_json(&standings);
    assert_eq!(standings_value["contract_version"], "standings.v1");
    assert_eq!(standings_value["photo_count"], 3);
    assert_eq!(standings_value["processed_events"], 3);
    assert_eq!(standings_value["skipped_events"], 0);
    assert_eq!(
        standings_value["entries"][0]["id"], "alpine-lake",
        "two straight wins should lead the standings"
    );

    let next = sr_output(&db_path, &["next", "--seed", "7", "--json"]);
    assert_success(&next, "next");
    let next_value = stdout_json(&next);
    assert_eq!(next_value["contract_version"], "next_pair.v1");
    assert_ne!(next_value["left"], next_value["right"]);
    let policy = match next_value["policy"].as_str() {
        Some(value) => value.to_string(),
        None => panic!("next payload missing policy"),
    };
    assert!(["placement", "exploration", "refinement"].contains(&policy.as_str()));

    let export = sr_output(&db_path, &["log", "export", "--output", backup_str]);
    assert_success(&export, "log export");

    let undo = sr_output(&db_path, &["undo"]);
    assert_success(&undo, "undo");

    let after_undo = sr_output(&db_path, &["replay", "--json"]);
    assert_success(&after_undo, "replay after undo");
    assert_eq!(stdout_json(&after_undo)["processed_events"], 2);

    let restore = sr_output(&db_path, &["log", "import", "--file", backup_str]);
    assert_success(&restore, "log import");

    let restored = sr_output(&db_path, &["standings", "--json"]);
    assert_success(&restored, "standings after restore");
    let restored_value = stdout_json(&restored);
    assert_eq!(restored_value["processed_events"], 3);
    assert_eq!(
        restored_value["entries"], standings_value["entries"],
        "imported backup must replay to the snapshot it was exported from"
    );

    let _ = std::fs::remove_file(&db_path);
    let _ = std::fs::remove_file(&catalog_path);
    let _ = std::fs::remove_file(&backup_path);
}

#[test]
fn next_fails_cleanly_on_an_empty_catalog() {
    let db_path = temp_path("empty", "sqlite3");

    let next = sr_output(&db_path, &["next", "--seed", "1"]);
    assert!(!next.status.success());
    let stderr = String::from_utf8_lossy(&next.stderr);
    assert!(
        stderr.contains("insufficient items"),
        "unexpected stderr: {stderr}"
    );

    let _ = std::fs::remove_file(&db_path);
}
