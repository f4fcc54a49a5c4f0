//! Scripted host for pipeline tests

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use redeploy::app::options::AppOptions;
use redeploy::app::state::AppState;
use redeploy::deploy::command::{CommandOutput, CommandRunner, CommandSpec};
use redeploy::deploy::cron::CrontabTable;
use redeploy::errors::DeployError;
use redeploy::storage::settings::Settings;

pub const ACCOUNT: &str = "deploy";
pub const MARKER: &str = "tpdb-process-pending-imports";

/// A fake host that answers commands the way a healthy server would.
///
/// `git reset --hard` writes a new release into the app root so that
/// rollback has something to undo.
pub struct FakeHost {
    root: PathBuf,
    remote_head: String,
    head: Mutex<String>,
    calls: Mutex<Vec<String>>,
    failing: Mutex<Vec<String>>,
    inactive: Mutex<Vec<String>>,
    dirty: Mutex<bool>,
}

impl FakeHost {
    pub fn new(root: &Path, remote_head: &str) -> Self {
        Self {
            root: root.to_path_buf(),
            remote_head: remote_head.to_string(),
            head: Mutex::new("0000aaa".to_string()),
            calls: Mutex::new(Vec::new()),
            failing: Mutex::new(Vec::new()),
            inactive: Mutex::new(Vec::new()),
            dirty: Mutex::new(false),
        }
    }

    /// Commands whose rendered argv contains `needle` exit 1
    pub fn fail_on(&self, needle: &str) {
        self.failing.lock().unwrap().push(needle.to_string());
    }

    /// `is-active` never succeeds for this service
    pub fn never_active(&self, service: &str) {
        self.inactive.lock().unwrap().push(service.to_string());
    }

    /// Tracked files carry uncommitted edits until stashed
    pub fn make_dirty(&self) {
        *self.dirty.lock().unwrap() = true;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn called(&self, needle: &str) -> bool {
        self.calls().iter().any(|c| c.contains(needle))
    }

    fn answer(&self, spec: &CommandSpec) -> CommandOutput {
        let line = spec.to_string();
        let ok = |stdout: &str| CommandOutput {
            code: Some(0),
            stdout: stdout.to_string(),
            stderr: String::new(),
        };

        if self.failing.lock().unwrap().iter().any(|n| line.contains(n)) {
            return CommandOutput {
                code: Some(1),
                stdout: String::new(),
                stderr: format!("simulated failure: {line}\n"),
            };
        }

        let args: Vec<&str> = spec.args.iter().map(String::as_str).collect();
        match (spec.program.as_str(), args.as_slice()) {
            ("id", ["-un"]) => ok(&format!("{ACCOUNT}\n")),
            ("git", ["rev-parse", "--is-inside-work-tree"]) => ok("true\n"),
            ("git", ["status", "--porcelain", ..]) => {
                if *self.dirty.lock().unwrap() {
                    ok(" M app.py\n")
                } else {
                    ok("")
                }
            }
            ("git", ["stash", "push", ..]) => {
                *self.dirty.lock().unwrap() = false;
                ok("Saved working directory and index state\n")
            }
            ("git", ["rev-parse", "HEAD"]) => ok(&format!("{}\n", self.head.lock().unwrap())),
            ("git", ["reset", "--hard", target]) => {
                let head = if target.contains('/') {
                    self.remote_head.clone()
                } else {
                    target.to_string()
                };
                std::fs::write(self.root.join("app.py"), format!("release {head}\n")).unwrap();
                std::fs::write(self.root.join("added.py"), b"new module\n").unwrap();
                *self.head.lock().unwrap() = head;
                ok("")
            }
            _ if args.contains(&"is-active") => {
                let inactive = self.inactive.lock().unwrap();
                if args.last().is_some_and(|name| inactive.iter().any(|s| s.as_str() == *name)) {
                    CommandOutput {
                        code: Some(3),
                        ..Default::default()
                    }
                } else {
                    ok("")
                }
            }
            _ if args.contains(&"status") && args.contains(&"--no-pager") => {
                ok("Active: activating (auto-restart)\n")
            }
            _ => ok(""),
        }
    }
}

#[async_trait]
impl CommandRunner for FakeHost {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, DeployError> {
        self.calls.lock().unwrap().push(spec.to_string());
        Ok(self.answer(spec))
    }
}

/// Crontab held in memory
#[derive(Default)]
pub struct MemoryCrontab {
    contents: Mutex<String>,
}

impl MemoryCrontab {
    pub fn contents(&self) -> String {
        self.contents.lock().unwrap().clone()
    }
}

#[async_trait]
impl CrontabTable for MemoryCrontab {
    async fn read(&self) -> Result<String, DeployError> {
        Ok(self.contents())
    }

    async fn write(&self, contents: &str) -> Result<(), DeployError> {
        *self.contents.lock().unwrap() = contents.to_string();
        Ok(())
    }
}

/// A deployable app checkout in a temp dir, wired to the fakes
pub struct Fixture {
    pub tmp: TempDir,
    pub host: Arc<FakeHost>,
    pub crontab: Arc<MemoryCrontab>,
    pub settings: Settings,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_remote_head("abc123")
    }

    pub fn with_remote_head(remote_head: &str) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("app");
        std::fs::create_dir_all(root.join("static/css")).unwrap();
        std::fs::write(root.join("requirements.txt"), b"X==1.0\n").unwrap();
        std::fs::write(root.join("app.py"), b"release 0000aaa\n").unwrap();
        std::fs::write(root.join("static/css/site.css"), b"body { margin: 0 }\n").unwrap();

        let mut settings = Settings::default();
        settings.state_dir = tmp.path().join("state").to_string_lossy().into_owned();
        settings.log_dir = tmp.path().join("log").to_string_lossy().into_owned();
        settings.service_account = Some(ACCOUNT.to_string());
        settings.app.root = root.to_string_lossy().into_owned();
        settings.backup.free_space_headroom_mb = 0;
        settings.services.poll_interval_ms = 10;
        settings.services.app.start_timeout_secs = 1;
        settings.services.proxy.start_timeout_secs = 1;
        settings.health.endpoint = format!("unix:{}", tmp.path().join("missing.sock").display());
        settings.health.timeout_secs = 1;

        Self {
            host: Arc::new(FakeHost::new(&root, remote_head)),
            crontab: Arc::new(MemoryCrontab::default()),
            settings,
            tmp,
        }
    }

    pub fn root(&self) -> PathBuf {
        PathBuf::from(&self.settings.app.root)
    }

    pub fn state_dir(&self) -> PathBuf {
        PathBuf::from(&self.settings.state_dir)
    }

    pub fn app_state(&self) -> AppState {
        let options = AppOptions::from_settings(&self.settings).unwrap();
        AppState::new(options, self.host.clone(), self.crontab.clone())
    }
}

/// Every regular file under `dir`, keyed by relative path
pub fn read_tree(dir: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    let mut files = BTreeMap::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                pending.push(path);
            } else {
                let rel = path.strip_prefix(dir).unwrap().to_path_buf();
                files.insert(rel, std::fs::read(&path).unwrap());
            }
        }
    }
    files
}
