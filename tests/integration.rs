use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

const CONFIGURATION: &str = "homeassistant:\n  name: Home\nlogger:\n  default: debug\nrecorder:\n  purge_keep_days: 30\n";

const ONE_EDIT: &str = r#"[{"file_path": "configuration.yaml", "title": "Quieter logger", "description": "debug logging is noisy", "reasoning": "less disk churn", "impact": "low", "category": "performance", "before": "  default: debug", "after": "  default: warning"}]"#;

const TWO_EDITS: &str = r#"```json
[
  {"file_path": "configuration.yaml", "title": "Quieter logger", "impact": "low", "category": "performance", "before": "  default: debug", "after": "  default: warning"},
  {"file_path": "configuration.yaml", "title": "Shorter history", "impact": "medium", "category": "performance", "before": "  purge_keep_days: 30", "after": "  purge_keep_days: 10"}
]
```"#;

fn cfa_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("cfa");
    path
}

struct TestEnv {
    _tmp: TempDir,
    root: PathBuf,
    config_path: PathBuf,
}

impl TestEnv {
    fn configuration(&self) -> String {
        fs::read_to_string(self.root.join("ha/configuration.yaml")).unwrap()
    }

    fn backups(&self) -> Vec<PathBuf> {
        let dir = self.root.join("data/backups");
        if !dir.exists() {
            return Vec::new();
        }
        walk(&dir)
    }
}

fn walk(dir: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
            out.extend(walk(&path));
        } else {
            out.push(path);
        }
    }
    out
}

fn setup_test_env(answer: Option<&str>) -> TestEnv {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let ha = root.join("ha");
    fs::create_dir_all(ha.join(".storage")).unwrap();
    fs::write(ha.join("configuration.yaml"), CONFIGURATION).unwrap();
    fs::write(
        ha.join("automations.yaml"),
        "- alias: Porch light\n  trigger:\n    platform: sun\n    event: sunset\n",
    )
    .unwrap();
    fs::write(ha.join("secrets.yaml"), "api_password: hunter2\n").unwrap();
    fs::write(ha.join(".storage/core.yaml"), "internal: true\n").unwrap();

    let backend = match answer {
        Some(answer) => {
            let replay = root.join("replay");
            fs::create_dir_all(&replay).unwrap();
            fs::write(replay.join("default.txt"), answer).unwrap();
            format!(
                "[backend]\nprovider = \"replay\"\nreplay_dir = \"{}\"\n",
                replay.display()
            )
        }
        None => String::new(),
    };

    let config_content = format!(
        r#"[db]
path = "{root}/data/advisor.sqlite"

[documents]
root = "{root}/ha"
backup_dir = "{root}/data/backups"

[analysis]
max_tokens = 4000
concurrency = 2
chunk_timeout_secs = 10

[logging]
level = "warn"

{backend}"#,
        root = root.display(),
        backend = backend
    );

    let config_path = config_dir.join("advisor.toml");
    fs::write(&config_path, config_content).unwrap();

    TestEnv {
        _tmp: tmp,
        root,
        config_path,
    }
}

fn run_cfa(env: &TestEnv, args: &[&str]) -> (String, String, bool) {
    let binary = cfa_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(env.config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run cfa binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

/// Ids from `cfa proposals` output, one per listed proposal.
fn proposal_ids(env: &TestEnv, status: &str) -> Vec<String> {
    let (stdout, stderr, success) = run_cfa(env, &["proposals", "--status", status]);
    assert!(success, "proposals failed: {}", stderr);
    stdout
        .lines()
        .filter(|line| !line.ends_with(" proposals"))
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

fn scan(env: &TestEnv) -> String {
    let (stdout, stderr, success) = run_cfa(env, &["scan", "--progress", "off"]);
    assert!(success, "scan failed: stdout={}, stderr={}", stdout, stderr);
    stdout
}

#[test]
fn test_init_creates_database() {
    let env = setup_test_env(None);

    let (stdout, stderr, success) = run_cfa(&env, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(env.root.join("data/advisor.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let env = setup_test_env(None);

    let (_, _, first) = run_cfa(&env, &["init"]);
    assert!(first, "First init failed");
    let (_, _, second) = run_cfa(&env, &["init"]);
    assert!(second, "Second init failed (not idempotent)");
}

#[test]
fn test_documents_skips_secrets_and_storage() {
    let env = setup_test_env(None);

    let (stdout, stderr, success) = run_cfa(&env, &["documents"]);
    assert!(success, "documents failed: {}", stderr);
    assert!(stdout.contains("configuration.yaml"));
    assert!(stdout.contains("automations.yaml"));
    assert!(!stdout.contains("secrets.yaml"));
    assert!(!stdout.contains("core.yaml"));
    assert!(stdout.contains("2 documents"));
}

#[test]
fn test_scan_with_disabled_backend_records_failed_chunks() {
    let env = setup_test_env(None);
    run_cfa(&env, &["init"]);

    let stdout = scan(&env);
    assert!(stdout.contains("status:       completed"), "{}", stdout);
    assert!(stdout.contains("proposals:    0"));
    assert!(stdout.contains("0 succeeded"));
}

#[test]
fn test_scan_unknown_path_fails() {
    let env = setup_test_env(Some(ONE_EDIT));
    run_cfa(&env, &["init"]);

    let (_, _, success) = run_cfa(&env, &["scan", "--progress", "off", "missing.yaml"]);
    assert!(!success);
}

#[test]
fn test_scan_accept_apply_rollback() {
    let env = setup_test_env(Some(ONE_EDIT));
    run_cfa(&env, &["init"]);

    let stdout = scan(&env);
    assert!(stdout.contains("status:       completed"), "{}", stdout);
    assert!(stdout.contains("proposals:    1"), "{}", stdout);
    assert_eq!(env.configuration(), CONFIGURATION, "scan must not write");

    let pending = proposal_ids(&env, "pending");
    assert_eq!(pending.len(), 1);
    let id = &pending[0];

    let (stdout, _, success) = run_cfa(&env, &["accept", id]);
    assert!(success);
    assert!(stdout.contains("accepted"));

    let (stdout, stderr, success) = run_cfa(&env, &["apply", id]);
    assert!(success, "apply failed: {}", stderr);
    assert!(stdout.contains("Applied"));
    assert!(env.configuration().contains("default: warning"));
    assert!(env.configuration().contains("purge_keep_days: 30"));

    let backups = env.backups();
    assert_eq!(backups.len(), 1);
    assert_eq!(fs::read_to_string(&backups[0]).unwrap(), CONFIGURATION);

    let (stdout, _, success) = run_cfa(&env, &["show", id]);
    assert!(success);
    assert!(stdout.contains("--- Before ---"));
    assert!(stdout.contains("status:       applied"));
    assert!(stdout.contains("applied_at:"));

    let (_, stderr, success) = run_cfa(&env, &["rollback", id]);
    assert!(success, "rollback failed: {}", stderr);
    assert_eq!(env.configuration(), CONFIGURATION);
}

#[test]
fn test_apply_requires_accept() {
    let env = setup_test_env(Some(ONE_EDIT));
    run_cfa(&env, &["init"]);
    scan(&env);

    let id = proposal_ids(&env, "pending").remove(0);
    let (_, stderr, success) = run_cfa(&env, &["apply", &id]);
    assert!(!success);
    assert!(stderr.contains("not accepted"), "{}", stderr);
    assert_eq!(env.configuration(), CONFIGURATION);
    assert!(env.backups().is_empty());
}

#[test]
fn test_drifted_document_is_not_overwritten() {
    let env = setup_test_env(Some(ONE_EDIT));
    run_cfa(&env, &["init"]);
    scan(&env);

    let id = proposal_ids(&env, "pending").remove(0);
    run_cfa(&env, &["accept", &id]);

    let edited = CONFIGURATION.replace("Home", "Cabin");
    fs::write(env.root.join("ha/configuration.yaml"), &edited).unwrap();

    let (_, stderr, success) = run_cfa(&env, &["apply", &id]);
    assert!(!success);
    assert!(stderr.contains("changed"), "{}", stderr);
    assert_eq!(env.configuration(), edited);
    assert_eq!(proposal_ids(&env, "stale"), vec![id.clone()]);

    // The excerpt still occurs once, so it can be re-anchored.
    let (stdout, stderr, success) = run_cfa(&env, &["rescan", &id]);
    assert!(success, "rescan failed: {}", stderr);
    assert!(stdout.contains("pending"));
}

#[test]
fn test_bulk_accept_reports_each_failure() {
    let env = setup_test_env(Some(TWO_EDITS));
    run_cfa(&env, &["init"]);
    let stdout = scan(&env);
    assert!(stdout.contains("proposals:    2"), "{}", stdout);

    let mut ids = proposal_ids(&env, "pending");
    assert_eq!(ids.len(), 2);
    ids.push("no-such-proposal".to_string());

    let mut args = vec!["accept"];
    args.extend(ids.iter().map(String::as_str));
    let (stdout, _, success) = run_cfa(&env, &args);
    assert!(!success);
    assert!(stdout.contains("2 succeeded, 1 failed"), "{}", stdout);
    assert!(stdout.contains("no-such-proposal  not_found"));
    assert_eq!(proposal_ids(&env, "accepted").len(), 2);
}

#[test]
fn test_check_marks_changed_documents_stale() {
    let env = setup_test_env(Some(ONE_EDIT));
    run_cfa(&env, &["init"]);
    scan(&env);

    let id = proposal_ids(&env, "pending").remove(0);
    run_cfa(&env, &["accept", &id]);

    let (stdout, _, success) = run_cfa(&env, &["check"]);
    assert!(success);
    assert!(stdout.contains("0 accepted proposals marked stale"));

    fs::write(
        env.root.join("ha/configuration.yaml"),
        format!("{}http:\n  server_port: 8123\n", CONFIGURATION),
    )
    .unwrap();
    let (stdout, _, success) = run_cfa(&env, &["check"]);
    assert!(success);
    assert!(stdout.contains(&format!("stale  {}", id)));
}

#[test]
fn test_runs_and_discard() {
    let env = setup_test_env(Some(ONE_EDIT));
    run_cfa(&env, &["init"]);
    scan(&env);

    let (stdout, _, success) = run_cfa(&env, &["runs"]);
    assert!(success);
    assert!(stdout.contains("completed"));
    let run_id = stdout.split_whitespace().next().unwrap().to_string();

    let (stdout, _, success) = run_cfa(&env, &["run", &run_id]);
    assert!(success);
    assert!(stdout.contains(&run_id));

    let id = proposal_ids(&env, "pending").remove(0);
    let (stdout, _, success) = run_cfa(&env, &["discard", &id]);
    assert!(success);
    assert!(stdout.contains("Discarded"));
    assert!(proposal_ids(&env, "pending").is_empty());

    let (_, _, success) = run_cfa(&env, &["show", &id]);
    assert!(!success);
}

#[test]
fn test_missing_config_fails() {
    let env = setup_test_env(None);
    let (_, _, success) = Command::new(cfa_binary())
        .arg("--config")
        .arg(env.root.join("nope.toml"))
        .arg("runs")
        .output()
        .map(|o| (o.stdout, o.stderr, o.status.success()))
        .unwrap();
    assert!(!success);
}
