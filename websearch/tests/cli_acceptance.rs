use std::ffi::OsString;
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};
use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;
use websearch_core::config::SECRET_ENV_VAR;
use websearch_core::storage::HISTORY_KEY;
use websearch_core::{
    History, HistoryStatus, KeyValueStore, SearchOutput, SqliteStore, TerminalOutcome,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct CliTestEnv {
    _temp_dir: TempDir,
    home: PathBuf,
    xdg_data: PathBuf,
    xdg_config: PathBuf,
    xdg_state: PathBuf,
}

impl CliTestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let base = temp_dir.path().to_path_buf();
        let home = base.join("home");
        let xdg_data = base.join("xdg-data");
        let xdg_config = base.join("xdg-config");
        let xdg_state = base.join("xdg-state");

        fs::create_dir_all(&home).expect("failed to create HOME");
        fs::create_dir_all(&xdg_data).expect("failed to create XDG_DATA_HOME");
        fs::create_dir_all(&xdg_config).expect("failed to create XDG_CONFIG_HOME");
        fs::create_dir_all(&xdg_state).expect("failed to create XDG_STATE_HOME");

        Self {
            _temp_dir: temp_dir,
            home,
            xdg_data,
            xdg_config,
            xdg_state,
        }
    }

    fn db_path(&self) -> PathBuf {
        self.xdg_data.join("websearch/storage.db")
    }

    /// Point the CLI at a mock platform
    fn write_platform_config(&self, api_url: &str) {
        let dir = self.xdg_config.join("websearch");
        fs::create_dir_all(&dir).expect("failed to create config dir");
        let config = format!(
            "[platform]\napi_url = \"{}\"\nsecret_key = \"tr_dev_test\"\n\n[monitor]\npoll_interval_ms = 50\n",
            api_url
        );
        fs::write(dir.join("config.toml"), config).expect("failed to write config");
    }

    fn history(&self) -> History {
        let storage = SqliteStore::open(&self.db_path(), 5 * 1024 * 1024)
            .expect("failed to open storage");
        History::open(Arc::new(storage), 50)
    }
}

fn command(env: &CliTestEnv, args: &[&str]) -> Command {
    let bin_path = PathBuf::from(assert_cmd::cargo::cargo_bin!("websearch"));

    let mut cmd = Command::new(bin_path);
    cmd.args(args)
        .env("HOME", &env.home)
        .env("XDG_DATA_HOME", &env.xdg_data)
        .env("XDG_CONFIG_HOME", &env.xdg_config)
        .env("XDG_STATE_HOME", &env.xdg_state)
        .env_remove(SECRET_ENV_VAR)
        .env_remove("COLORFGBG");
    cmd
}

fn run_bin(env: &CliTestEnv, args: &[&str]) -> Output {
    command(env, args)
        .output()
        .unwrap_or_else(|e| panic!("failed to execute websearch: {e}"))
}

fn assert_success(args: &[&str], output: &Output) {
    if output.status.success() {
        return;
    }

    let rendered_args = args
        .iter()
        .map(|arg| OsString::from(arg).to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    panic!(
        "websearch {rendered_args} failed\nstatus: {}\nstdout:\n{}\nstderr:\n{}",
        output.status, stdout, stderr
    );
}

fn stdout_of(env: &CliTestEnv, args: &[&str]) -> String {
    let output = run_bin(env, args);
    assert_success(args, &output);
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn history_is_empty_on_first_run() {
    let env = CliTestEnv::new();

    let stdout = stdout_of(&env, &["history"]);
    assert!(stdout.contains("No searches in history."));
}

#[test]
fn theme_preference_persists_between_runs() {
    let env = CliTestEnv::new();

    assert_eq!(stdout_of(&env, &["theme"]).trim(), "auto (default, using dark)");
    assert!(stdout_of(&env, &["theme", "dark"]).contains("Theme set to dark"));
    assert_eq!(stdout_of(&env, &["theme"]).trim(), "dark");

    let output = run_bin(&env, &["theme", "purple"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("purple"));
}

#[test]
fn auto_theme_follows_terminal_background() {
    let env = CliTestEnv::new();
    assert!(stdout_of(&env, &["theme", "auto"]).contains("Theme set to auto"));

    let output = command(&env, &["theme"])
        .env("COLORFGBG", "0;15")
        .output()
        .expect("failed to execute websearch");
    assert_success(&["theme"], &output);
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "auto (using light)");

    let output = command(&env, &["theme"])
        .env("COLORFGBG", "15;default;0")
        .output()
        .expect("failed to execute websearch");
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "auto (using dark)");
}

#[test]
fn history_from_a_newer_version_is_left_untouched() {
    let env = CliTestEnv::new();
    let newer = json!({
        "version": 3,
        "entries": [{"id": "1", "query": "kept by newer build", "runId": "run_new", "status": "archived", "timestamp": 1}],
        "maxEntries": 50
    })
    .to_string();
    {
        let storage = SqliteStore::open(&env.db_path(), 5 * 1024 * 1024)
            .expect("failed to open storage");
        storage.set(HISTORY_KEY, &newer).expect("failed to seed history");
    }

    assert!(stdout_of(&env, &["history"]).contains("No searches in history."));
    stdout_of(&env, &["clear"]);

    let storage = SqliteStore::open(&env.db_path(), 5 * 1024 * 1024)
        .expect("failed to open storage");
    assert_eq!(
        storage.get(HISTORY_KEY).expect("read history").as_deref(),
        Some(newer.as_str())
    );
}

#[test]
fn config_reports_missing_secret() {
    let env = CliTestEnv::new();

    let stdout = stdout_of(&env, &["config"]);
    assert!(stdout.contains("websearch Configuration"));
    assert!(stdout.contains("Secret key:      <not set>"));
    assert!(stdout.contains("Platform:        not configured"));
    assert!(stdout.contains(SECRET_ENV_VAR));
}

#[test]
fn search_without_secret_fails_before_recording_anything() {
    let env = CliTestEnv::new();

    let output = run_bin(&env, &["search", "rust", "async", "runtimes"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Configuration error"), "stderr:\n{stderr}");
    assert!(stderr.contains(SECRET_ENV_VAR));

    assert!(env.history().is_empty());
}

#[test]
fn search_rejects_short_query() {
    let env = CliTestEnv::new();

    let output = run_bin(&env, &["search", "ab"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("at least 3 characters"), "stderr:\n{stderr}");
}

#[test]
fn history_commands_work_on_seeded_entries() {
    let env = CliTestEnv::new();
    {
        let history = env.history();
        history.add_processing("how do lifetimes work", "run_a", None, None);
        history.add_processing("what is a borrow checker", "run_b", Some("gpt-4o"), None);
        history.update_status(
            "run_b",
            TerminalOutcome::Complete(SearchOutput {
                answer: Some("It enforces aliasing rules.".to_string()),
                conversation: Vec::new(),
            }),
        );
        history.add_processing("broken search", "run_c", None, None);
        history.update_status("run_c", TerminalOutcome::Failed("Task execution failed".into()));
    }

    let listing = stdout_of(&env, &["history"]);
    assert!(listing.contains("how do lifetimes work"));
    assert!(listing.contains("what is a borrow checker"));
    assert!(listing.contains("broken search"));

    let failed = stdout_of(&env, &["history", "--status", "failed"]);
    assert!(failed.contains("broken search"));
    assert!(!failed.contains("lifetimes"));

    let found = stdout_of(&env, &["history", "--search", "BORROW"]);
    assert!(found.contains("borrow checker"));
    assert!(!found.contains("broken search"));

    let detail = stdout_of(&env, &["show", "run_b"]);
    assert!(detail.contains("Status:    complete"));
    assert!(detail.contains("Model:     gpt-4o"));
    assert!(detail.contains("It enforces aliasing rules."));

    let raw = stdout_of(&env, &["show", "run_b", "--json"]);
    let value: serde_json::Value = serde_json::from_str(&raw).expect("show --json emits JSON");
    assert_eq!(value["runId"], "run_b");
    assert_eq!(value["status"], "complete");

    assert!(stdout_of(&env, &["delete", "run_a"]).contains("Deleted: how do lifetimes work"));
    assert!(env.history().find_by_run_id("run_a").is_none());

    assert!(stdout_of(&env, &["clear"]).contains("Cleared 2 history entries."));
    assert!(env.history().is_empty());

    let output = run_bin(&env, &["show", "run_b"]);
    assert!(!output.status.success());
}

#[tokio::test(flavor = "multi_thread")]
async fn detached_search_records_processing_entry() {
    let env = CliTestEnv::new();
    let server = MockServer::start().await;
    env.write_platform_config(&server.uri());

    Mock::given(method("POST"))
        .and(path("/api/v1/tasks/websearch-agent/trigger"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"id": "run_cli", "publicAccessToken": "pk_cli"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let stdout = stdout_of(&env, &["search", "--detach", "rust", "error", "handling"]);
    assert!(stdout.contains("Started run run_cli"));

    let entry = env.history().find_by_run_id("run_cli").expect("entry recorded");
    assert_eq!(entry.query, "rust error handling");
    assert_eq!(entry.status, HistoryStatus::Processing);
    assert!(entry.model.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn recover_finalizes_runs_that_finished_while_away() {
    let env = CliTestEnv::new();
    let server = MockServer::start().await;
    env.write_platform_config(&server.uri());

    env.history()
        .add_processing("what changed in edition 2024", "run_away", None, None);

    Mock::given(method("GET"))
        .and(path("/api/v3/runs/run_away"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "run_away",
            "status": "COMPLETED",
            "output": {"answer": "Several lint and prelude changes.", "conversation": []}
        })))
        .mount(&server)
        .await;

    let stdout = stdout_of(&env, &["recover"]);
    assert!(stdout.contains("Checked 1 run(s)"));
    assert!(stdout.contains("Finished while away:"));
    assert!(stdout.contains("run_away"));

    let detail = stdout_of(&env, &["show", "run_away"]);
    assert!(detail.contains("Status:    complete"));
    assert!(detail.contains("Several lint and prelude changes."));

    // Nothing left to check
    assert!(stdout_of(&env, &["recover"]).contains("No processing runs to check."));
}
