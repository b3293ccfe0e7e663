//! Drives the tgctl and tgserver binaries against a throwaway configuration.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

struct Fixture {
    dir: TempDir,
    conf: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        Self::with_document(|_| {})
    }

    fn with_document(tweak: impl FnOnce(&mut serde_json::Value)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut document = serde_json::json!({
            "database_name": "cli",
            "shm_dir": dir.path().join("shm"),
        });
        tweak(&mut document);
        let conf = dir.path().join("tgctl.json");
        std::fs::write(&conf, serde_json::to_vec_pretty(&document).unwrap()).unwrap();
        Self { dir, conf }
    }

    fn tgctl(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_tgctl"))
            .arg("--conf")
            .arg(&self.conf)
            .args(args)
            .output()
            .unwrap()
    }

    fn start(&self, extra: &[&str]) -> Output {
        let log = self.dir.path().join("server.log");
        let mut args = vec![
            "start",
            "--server",
            env!("CARGO_BIN_EXE_tgserver"),
            "--log-file",
            log.to_str().unwrap(),
        ];
        args.extend_from_slice(extra);
        self.tgctl(&args)
    }

    fn status(&self) -> String {
        let output = self.tgctl(&["status"]);
        assert_eq!(output.status.code(), Some(0));
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    fn lock_file(&self) -> Option<PathBuf> {
        std::fs::read_dir(self.dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .find(|p| p.extension().is_some_and(|ext| ext == "pid"))
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = self.tgctl(&["kill"]);
    }
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

fn json_stdout(output: &Output) -> serde_json::Value {
    serde_json::from_slice(&output.stdout).unwrap()
}

#[test]
fn test_status_of_absent_server() {
    let fixture = Fixture::new();
    assert_eq!(fixture.status(), "inactive");
}

#[test]
fn test_start_status_shutdown_cycle() {
    let fixture = Fixture::new();

    let started = fixture.start(&[]);
    assert_eq!(started.status.code(), Some(0), "{}", stderr(&started));
    assert_eq!(fixture.status(), "running");
    assert!(fixture.lock_file().is_some());

    let again = fixture.start(&[]);
    assert_eq!(again.status.code(), Some(1));
    assert!(stderr(&again).contains("already_running"), "{}", stderr(&again));

    let sessions = fixture.tgctl(&["session", "list"]);
    assert_eq!(sessions.status.code(), Some(0), "{}", stderr(&sessions));
    let sessions = json_stdout(&sessions);
    assert_eq!(sessions.as_array().map(Vec::len), Some(1));
    assert_eq!(sessions[0]["application"], "tgctl");

    let stats = fixture.tgctl(&["dbstats", "show"]);
    assert_eq!(stats.status.code(), Some(0), "{}", stderr(&stats));
    let stats = json_stdout(&stats);
    assert!(stats
        .as_array()
        .unwrap()
        .iter()
        .any(|item| item["key"] == "server.pid" && item["value"].is_u64()));

    let stopped = fixture.tgctl(&["shutdown"]);
    assert_eq!(stopped.status.code(), Some(0), "{}", stderr(&stopped));
    assert_eq!(fixture.status(), "inactive");
    assert!(fixture.lock_file().is_none());

    let idle = fixture.tgctl(&["shutdown"]);
    assert_eq!(idle.status.code(), Some(0));
}

#[test]
fn test_kill_removes_server_and_resources() {
    let fixture = Fixture::new();
    let started = fixture.start(&[]);
    assert_eq!(started.status.code(), Some(0), "{}", stderr(&started));

    let killed = fixture.tgctl(&["kill"]);
    assert_eq!(killed.status.code(), Some(0), "{}", stderr(&killed));
    assert_eq!(fixture.status(), "inactive");
    assert!(fixture.lock_file().is_none());

    let shm = fixture.dir.path().join("shm");
    let leftovers: Vec<_> = std::fs::read_dir(&shm)
        .map(|entries| entries.filter_map(|e| e.ok()).collect())
        .unwrap_or_default();
    assert!(leftovers.is_empty(), "{:?}", leftovers);
}

#[test]
fn test_force_start_replaces_running_server() {
    let fixture = Fixture::new();
    let first = fixture.start(&[]);
    assert_eq!(first.status.code(), Some(0), "{}", stderr(&first));

    let second = fixture.start(&["--force"]);
    assert_eq!(second.status.code(), Some(0), "{}", stderr(&second));
    assert_eq!(fixture.status(), "running");
}

#[test]
fn test_monitor_records_progress() {
    let fixture = Fixture::new();
    let monitor = fixture.dir.path().join("monitor.jsonl");
    let output = fixture.tgctl(&["--monitor", monitor.to_str().unwrap(), "shutdown"]);
    assert_eq!(output.status.code(), Some(0));

    let records: Vec<serde_json::Value> = std::fs::read_to_string(&monitor)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert!(records.len() >= 2);
    assert_eq!(records[0]["kind"], "start");
    let last = records.last().unwrap();
    assert_eq!(last["kind"], "finish");
    assert_eq!(last["exit_code"], 0);
    assert!(records.iter().all(|r| r["format"] == "tgctl-monitor/1"));
}

#[test]
fn test_invalid_configuration_exits_with_config_error() {
    let fixture = Fixture::with_document(|doc| {
        doc["session"] = serde_json::json!({ "max_sessions": 0 });
    });
    let output = fixture.tgctl(&["status"]);
    assert_eq!(output.status.code(), Some(3));

    let missing = Command::new(env!("CARGO_BIN_EXE_tgctl"))
        .arg("--conf")
        .arg(Path::new("/nonexistent/tgctl.json"))
        .arg("status")
        .output()
        .unwrap();
    assert_eq!(missing.status.code(), Some(3));
}

#[test]
fn test_token_authentication_for_admin_commands() {
    let fixture = Fixture::with_document(|doc| {
        doc["authentication"] = serde_json::json!({ "enabled": true, "tokens": ["letmein"] });
    });
    let started = fixture.start(&[]);
    assert_eq!(started.status.code(), Some(0), "{}", stderr(&started));

    let refused = fixture.tgctl(&["session", "list"]);
    assert_eq!(refused.status.code(), Some(1));

    let accepted = fixture.tgctl(&[
        "--auth",
        "token",
        "--auth-token",
        "letmein",
        "session",
        "list",
    ]);
    assert_eq!(accepted.status.code(), Some(0), "{}", stderr(&accepted));
}
