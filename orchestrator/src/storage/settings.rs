//! Settings file management

use serde::{Deserialize, Serialize};

use crate::logs::LogLevel;

/// Orchestrator settings, read from a JSON file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Directory for the lock file, run log and persisted state
    #[serde(default = "default_state_dir")]
    pub state_dir: String,

    /// Directory for the text run log
    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    /// Login name the run must execute as. Unchecked when empty.
    #[serde(default)]
    pub service_account: Option<String>,

    /// Upper bound for any single external command
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Application under deployment
    #[serde(default)]
    pub app: AppSettings,

    /// Snapshot configuration
    #[serde(default)]
    pub backup: BackupSettings,

    /// Managed services
    #[serde(default)]
    pub services: ServicesSettings,

    /// Health verification
    #[serde(default)]
    pub health: HealthSettings,

    /// Recurring background job
    #[serde(default)]
    pub periodic_task: PeriodicTaskSettings,

    /// Rollback behaviour
    #[serde(default)]
    pub rollback: RollbackSettings,
}

fn default_true() -> bool {
    true
}

fn default_state_dir() -> String {
    "/var/lib/redeploy".to_string()
}

fn default_log_dir() -> String {
    "/var/log/redeploy".to_string()
}

fn default_command_timeout() -> u64 {
    900
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            state_dir: default_state_dir(),
            log_dir: default_log_dir(),
            service_account: None,
            command_timeout_secs: default_command_timeout(),
            app: AppSettings::default(),
            backup: BackupSettings::default(),
            services: ServicesSettings::default(),
            health: HealthSettings::default(),
            periodic_task: PeriodicTaskSettings::default(),
            rollback: RollbackSettings::default(),
        }
    }
}

/// Application checkout and lifecycle commands.
///
/// Command argv entries may use `{root}` and `{manifest}` placeholders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSettings {
    /// Live deployment directory (a git checkout)
    #[serde(default = "default_app_root")]
    pub root: String,

    /// Remote name
    #[serde(default = "default_remote")]
    pub remote: String,

    /// Tracked branch
    #[serde(default = "default_branch")]
    pub branch: String,

    /// Dependency manifest, relative to root
    #[serde(default = "default_manifest")]
    pub manifest: String,

    /// Environment variable selecting the configuration profile
    #[serde(default = "default_profile_var")]
    pub profile_var: String,

    /// Configuration profile value
    #[serde(default = "default_profile")]
    pub profile: String,

    /// Upgrades the package manager itself
    #[serde(default = "default_upgrade_installer")]
    pub upgrade_installer: Vec<String>,

    /// Installs dependencies from the manifest
    #[serde(default = "default_install")]
    pub install: Vec<String>,

    /// Configuration self-check (fatal)
    #[serde(default = "default_config_check")]
    pub config_check: Vec<String>,

    /// Security lint (warning only)
    #[serde(default = "default_security_check")]
    pub security_check: Vec<String>,

    /// Applies schema migrations
    #[serde(default = "default_migrate")]
    pub migrate: Vec<String>,

    /// Rebuilds derived assets
    #[serde(default = "default_build_assets")]
    pub build_assets: Vec<String>,
}

fn default_app_root() -> String {
    "/srv/tpdb".to_string()
}

fn default_remote() -> String {
    "origin".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_manifest() -> String {
    "requirements.txt".to_string()
}

fn default_profile_var() -> String {
    "DJANGO_SETTINGS_MODULE".to_string()
}

fn default_profile() -> String {
    "tpdb.settings_production".to_string()
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

fn default_upgrade_installer() -> Vec<String> {
    argv(&["{root}/venv/bin/pip", "install", "--upgrade", "pip"])
}

fn default_install() -> Vec<String> {
    argv(&["{root}/venv/bin/pip", "install", "-r", "{manifest}"])
}

fn default_config_check() -> Vec<String> {
    argv(&["{root}/venv/bin/python", "manage.py", "check"])
}

fn default_security_check() -> Vec<String> {
    argv(&["{root}/venv/bin/python", "manage.py", "check", "--deploy"])
}

fn default_migrate() -> Vec<String> {
    argv(&["{root}/venv/bin/python", "manage.py", "migrate", "--noinput"])
}

fn default_build_assets() -> Vec<String> {
    argv(&["{root}/venv/bin/python", "manage.py", "collectstatic", "--noinput"])
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            root: default_app_root(),
            remote: default_remote(),
            branch: default_branch(),
            manifest: default_manifest(),
            profile_var: default_profile_var(),
            profile: default_profile(),
            upgrade_installer: default_upgrade_installer(),
            install: default_install(),
            config_check: default_config_check(),
            security_check: default_security_check(),
            migrate: default_migrate(),
            build_assets: default_build_assets(),
        }
    }
}

/// Snapshot settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSettings {
    /// Snapshot directory. Defaults to `<state_dir>/backups`.
    #[serde(default)]
    pub dir: Option<String>,

    /// Numbered historical snapshots kept besides latest/previous
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Extra free space required beyond the live tree size
    #[serde(default = "default_headroom")]
    pub free_space_headroom_mb: u64,
}

fn default_history_limit() -> usize {
    5
}

fn default_headroom() -> u64 {
    64
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            dir: None,
            history_limit: default_history_limit(),
            free_space_headroom_mb: default_headroom(),
        }
    }
}

/// Settings of one managed service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSettings {
    /// Unit name
    pub name: String,

    /// Bounded wait for the service to report active
    pub start_timeout_secs: u64,
}

/// Managed services
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicesSettings {
    /// Prepended to every service command, e.g. `["sudo", "-n"]`
    #[serde(default = "default_privilege")]
    pub privilege: Vec<String>,

    /// Service manager program
    #[serde(default = "default_manager")]
    pub manager: String,

    /// Interval between `is-active` polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Primary application service
    #[serde(default = "default_app_service")]
    pub app: ServiceSettings,

    /// Front-end proxy service
    #[serde(default = "default_proxy_service")]
    pub proxy: ServiceSettings,
}

fn default_privilege() -> Vec<String> {
    argv(&["sudo", "-n"])
}

fn default_manager() -> String {
    "systemctl".to_string()
}

fn default_poll_interval() -> u64 {
    500
}

fn default_app_service() -> ServiceSettings {
    ServiceSettings {
        name: "gunicorn".to_string(),
        start_timeout_secs: 5,
    }
}

fn default_proxy_service() -> ServiceSettings {
    ServiceSettings {
        name: "nginx".to_string(),
        start_timeout_secs: 3,
    }
}

impl Default for ServicesSettings {
    fn default() -> Self {
        Self {
            privilege: default_privilege(),
            manager: default_manager(),
            poll_interval_ms: default_poll_interval(),
            app: default_app_service(),
            proxy: default_proxy_service(),
        }
    }
}

/// Health verification settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSettings {
    /// `unix:/path/to.sock` or `http://host:port`
    #[serde(default = "default_health_endpoint")]
    pub endpoint: String,

    /// Request path
    #[serde(default = "default_health_path")]
    pub path: String,

    /// Request timeout
    #[serde(default = "default_health_timeout")]
    pub timeout_secs: u64,

    /// Treat an unhealthy result as fatal
    #[serde(default)]
    pub fatal: bool,
}

fn default_health_endpoint() -> String {
    "unix:/run/gunicorn.sock".to_string()
}

fn default_health_path() -> String {
    "/".to_string()
}

fn default_health_timeout() -> u64 {
    5
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            endpoint: default_health_endpoint(),
            path: default_health_path(),
            timeout_secs: default_health_timeout(),
            fatal: false,
        }
    }
}

/// Recurring background job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodicTaskSettings {
    /// Register the job on each run
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Unique marker identifying the entry
    #[serde(default = "default_marker")]
    pub marker: String,

    /// Five-field cron schedule
    #[serde(default = "default_schedule")]
    pub schedule: String,

    /// Shell command line
    #[serde(default = "default_task_command")]
    pub command: String,
}

fn default_marker() -> String {
    "tpdb-process-pending-imports".to_string()
}

fn default_schedule() -> String {
    "*/5 * * * *".to_string()
}

fn default_task_command() -> String {
    "cd {root} && DJANGO_SETTINGS_MODULE=tpdb.settings_production venv/bin/python manage.py process_pending_imports --max-files=1 >> /var/log/tpdb/imports.log 2>&1".to_string()
}

impl Default for PeriodicTaskSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            marker: default_marker(),
            schedule: default_schedule(),
            command: default_task_command(),
        }
    }
}

/// Rollback behaviour
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RollbackSettings {
    /// Also restart the proxy service after restoring
    #[serde(default)]
    pub restart_proxy: bool,
}
