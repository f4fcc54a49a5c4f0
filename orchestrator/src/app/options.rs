//! Application configuration options

use std::path::PathBuf;
use std::time::Duration;

use crate::deploy::command::expand_placeholders;
use crate::deploy::health::Endpoint;
use crate::deploy::update::{LifecycleCommands, UpdateOptions};
use crate::errors::DeployError;
use crate::models::service::{ServiceDescriptor, ServiceRole};
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Orchestrator state (lock, run history, persisted state)
    pub layout: StorageLayout,

    /// Text log the run writes to
    pub log_file: Option<PathBuf>,

    /// Required login name
    pub service_account: Option<String>,

    /// Upper bound for any single external command
    pub command_timeout: Duration,

    pub update: UpdateOptions,

    pub backup: BackupOptions,

    pub services: ServicesOptions,

    pub health: HealthOptions,

    /// `None` when registration is disabled
    pub periodic_task: Option<PeriodicTaskOptions>,

    /// Restart the proxy too when rolling back
    pub rollback_restart_proxy: bool,
}

/// Snapshot options
#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub dir: PathBuf,
    pub history_limit: usize,
    pub headroom_bytes: u64,
}

/// Managed service options
#[derive(Debug, Clone)]
pub struct ServicesOptions {
    pub poll_interval: Duration,
    pub app: ServiceDescriptor,
    pub proxy: ServiceDescriptor,
}

/// Health verification options
#[derive(Debug, Clone)]
pub struct HealthOptions {
    pub endpoint: Endpoint,
    pub path: String,
    pub timeout: Duration,
    pub fatal: bool,
}

/// Recurring background job
#[derive(Debug, Clone)]
pub struct PeriodicTaskOptions {
    pub marker: String,
    pub schedule: String,
    pub command: String,
}

impl AppOptions {
    /// Convert a settings file into runtime options
    pub fn from_settings(settings: &Settings) -> Result<Self, DeployError> {
        let layout = StorageLayout::new(&settings.state_dir);
        let root = PathBuf::from(&settings.app.root);
        let root_str = settings.app.root.as_str();

        let app = &settings.app;
        let update = UpdateOptions {
            root: root.clone(),
            remote: app.remote.clone(),
            branch: app.branch.clone(),
            manifest: app.manifest.clone(),
            profile: (app.profile_var.clone(), app.profile.clone()),
            commands: LifecycleCommands {
                upgrade_installer: app.upgrade_installer.clone(),
                install: app.install.clone(),
                config_check: app.config_check.clone(),
                security_check: app.security_check.clone(),
                migrate: app.migrate.clone(),
                build_assets: app.build_assets.clone(),
            },
        };

        let backup = BackupOptions {
            dir: settings
                .backup
                .dir
                .as_ref()
                .map(PathBuf::from)
                .unwrap_or_else(|| layout.backups_dir().path().to_path_buf()),
            history_limit: settings.backup.history_limit,
            headroom_bytes: settings.backup.free_space_headroom_mb.saturating_mul(1024 * 1024),
        };
        // Snapshots would copy themselves and a restore would replace them
        if backup.dir.starts_with(&root) {
            return Err(DeployError::ConfigError(format!(
                "backup directory {} is inside the deployment root {}",
                backup.dir.display(),
                root.display()
            )));
        }

        let svc = &settings.services;
        let descriptor = |name: &str, role, timeout_secs| {
            ServiceDescriptor::managed(
                name,
                role,
                &svc.privilege,
                &svc.manager,
                Duration::from_secs(timeout_secs),
            )
        };
        let services = ServicesOptions {
            poll_interval: Duration::from_millis(svc.poll_interval_ms.max(1)),
            app: descriptor(&svc.app.name, ServiceRole::App, svc.app.start_timeout_secs),
            proxy: descriptor(&svc.proxy.name, ServiceRole::Proxy, svc.proxy.start_timeout_secs),
        };

        let health = HealthOptions {
            endpoint: settings.health.endpoint.parse()?,
            path: settings.health.path.clone(),
            timeout: Duration::from_secs(settings.health.timeout_secs),
            fatal: settings.health.fatal,
        };

        let task = &settings.periodic_task;
        let periodic_task = task.enabled.then(|| PeriodicTaskOptions {
            marker: task.marker.clone(),
            schedule: task.schedule.clone(),
            command: expand_placeholders(std::slice::from_ref(&task.command), &[("root", root_str)])
                .concat(),
        });

        Ok(Self {
            log_file: Some(PathBuf::from(&settings.log_dir).join("deploy.log")),
            layout,
            service_account: settings
                .service_account
                .clone()
                .filter(|account| !account.trim().is_empty()),
            command_timeout: Duration::from_secs(settings.command_timeout_secs),
            update,
            backup,
            services,
            health,
            periodic_task,
            rollback_restart_proxy: settings.rollback.restart_proxy,
        })
    }
}
