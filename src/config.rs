use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub azure_devops: AzureDevOpsConfig,
    pub github: GitHubConfig,
    pub monitor: MonitorConfig,
    pub completion: CompletionConfig,
    pub dispatch: DispatchConfig,
    pub customers: CustomersConfig,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct AzureDevOpsConfig {
    pub organization: Option<String>,
    pub project: Option<String>,
    pub pat: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct GitHubConfig {
    pub token: Option<String>,
    /// `owner/name`
    pub repository: Option<String>,
    pub workflow_file: Option<String>,
    pub default_branch: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct MonitorConfig {
    pub target_column: Option<String>,
    pub work_item_type: Option<String>,
    pub title_marker: Option<String>,
    pub excluded_states: Option<Vec<String>>,
    pub polling_interval_secs: Option<u64>,
    /// 0 means unbounded.
    pub max_runtime_secs: Option<u64>,
    pub state_file: Option<PathBuf>,
    pub activity_log: Option<PathBuf>,
    pub prune_departed: Option<bool>,
    pub seed_existing: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct CompletionConfig {
    pub wait_for_completion: Option<bool>,
    pub timeout_secs: Option<u64>,
    pub max_consecutive_errors: Option<u32>,
    pub runs_page_size: Option<u8>,
    pub match_buffer_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct DispatchConfig {
    pub browser: Option<String>,
    pub pass_phrase: Option<String>,
    pub verify_branch: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct CustomersConfig {
    pub markers_manifest: Option<PathBuf>,
    pub config_dir: Option<PathBuf>,
}

/// Validated configuration the rest of the program runs on.
#[derive(Debug, Clone)]
pub struct Settings {
    pub azure: AzureSettings,
    pub github: GitHubSettings,
    pub monitor: MonitorSettings,
    pub eligibility: Eligibility,
    pub completion: CompletionSettings,
    pub dispatch: DispatchSettings,
    pub customers: CustomerSources,
}

#[derive(Debug, Clone)]
pub struct AzureSettings {
    pub organization: String,
    pub project: String,
    pub pat: String,
}

#[derive(Debug, Clone)]
pub struct GitHubSettings {
    pub token: String,
    pub repository: String,
    pub workflow_file: String,
    pub default_branch: String,
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub polling_interval: Duration,
    pub max_runtime: Option<Duration>,
    pub state_file: PathBuf,
    pub activity_log: PathBuf,
    pub prune_departed: bool,
    pub seed_existing: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Eligibility {
    pub target_column: String,
    pub work_item_type: String,
    pub title_marker: String,
    pub excluded_states: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionSettings {
    pub wait_for_completion: bool,
    pub timeout: Duration,
    pub max_consecutive_errors: u32,
    pub runs_page_size: u8,
    pub match_buffer: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchSettings {
    pub browser: String,
    pub pass_phrase: Option<String>,
    pub verify_branch: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CustomerSources {
    pub markers_manifest: PathBuf,
    pub config_dir: PathBuf,
}

impl Default for Eligibility {
    fn default() -> Self {
        Self {
            target_column: "Testing".into(),
            work_item_type: "Product Backlog Item".into(),
            title_marker: "Automated Test".into(),
            excluded_states: vec!["Closed".into(), "Removed".into(), "Done".into()],
        }
    }
}

impl Default for CompletionSettings {
    fn default() -> Self {
        Self {
            wait_for_completion: true,
            timeout: Duration::from_secs(1800),
            max_consecutive_errors: 3,
            runs_page_size: 10,
            match_buffer: Duration::from_secs(120),
        }
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            browser: "chrome".into(),
            pass_phrase: None,
            verify_branch: true,
        }
    }
}

const DEFAULT_POLLING_INTERVAL_SECS: u64 = 30;

pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ado-trigger")
}

pub fn default_config_path() -> PathBuf {
    data_dir().join("config.toml")
}

/// Read the TOML file at `path` (or the default location) and overlay the process environment.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    let mut config = if path.exists() {
        let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?
    } else {
        AppConfig::default()
    };
    config.apply_env(|key| std::env::var(key).ok())?;
    Ok(config)
}

fn set_string(slot: &mut Option<String>, value: Option<String>) {
    if let Some(v) = value.filter(|v| !v.trim().is_empty()) {
        *slot = Some(v);
    }
}

fn parse_env<T: std::str::FromStr>(
    key: &'static str,
    value: Option<String>,
) -> Result<Option<T>, ConfigError> {
    match value {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid {
                key,
                message: format!("not a number: {raw:?}"),
            }),
    }
}

impl AppConfig {
    /// Environment variables take precedence over file values.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        set_string(&mut self.azure_devops.organization, lookup("AZURE_DEVOPS_ORG"));
        set_string(&mut self.azure_devops.project, lookup("AZURE_DEVOPS_PROJECT"));
        set_string(&mut self.azure_devops.pat, lookup("AZURE_DEVOPS_PAT"));

        set_string(&mut self.github.token, lookup("GITHUB_TOKEN"));
        set_string(&mut self.github.repository, lookup("GITHUB_REPO"));
        set_string(&mut self.github.workflow_file, lookup("GITHUB_WORKFLOW_FILE"));
        set_string(&mut self.github.default_branch, lookup("GITHUB_DEFAULT_BRANCH"));

        set_string(&mut self.monitor.target_column, lookup("TARGET_COLUMN"));
        set_string(&mut self.monitor.work_item_type, lookup("WORK_ITEM_TYPE"));
        set_string(&mut self.monitor.title_marker, lookup("TITLE_MARKER"));
        if let Some(v) = parse_env("POLLING_INTERVAL", lookup("POLLING_INTERVAL"))? {
            self.monitor.polling_interval_secs = Some(v);
        }
        if let Some(v) = parse_env("MAX_RUNTIME_SECONDS", lookup("MAX_RUNTIME_SECONDS"))? {
            self.monitor.max_runtime_secs = Some(v);
        }
        if let Some(v) = lookup("PROCESSED_ITEMS_FILE").filter(|v| !v.is_empty()) {
            self.monitor.state_file = Some(PathBuf::from(v));
        }

        if let Some(v) = parse_env(
            "COMPLETION_TIMEOUT_SECONDS",
            lookup("COMPLETION_TIMEOUT_SECONDS"),
        )? {
            self.completion.timeout_secs = Some(v);
        }

        set_string(&mut self.dispatch.pass_phrase, lookup("PASS_PHRASE"));
        set_string(&mut self.dispatch.browser, lookup("DEFAULT_BROWSER"));

        if let Some(v) = lookup("MARKERS_MANIFEST").filter(|v| !v.is_empty()) {
            self.customers.markers_manifest = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("CUSTOMER_CONFIG_DIR").filter(|v| !v.is_empty()) {
            self.customers.config_dir = Some(PathBuf::from(v));
        }
        Ok(())
    }

    pub fn resolve(self) -> Result<Settings, ConfigError> {
        let mut missing = Vec::new();
        let mut require = |value: Option<String>, key: &'static str| -> String {
            match value {
                Some(v) => v,
                None => {
                    missing.push(key);
                    String::new()
                }
            }
        };

        let azure = AzureSettings {
            organization: require(self.azure_devops.organization, "AZURE_DEVOPS_ORG"),
            project: require(self.azure_devops.project, "AZURE_DEVOPS_PROJECT"),
            pat: require(self.azure_devops.pat, "AZURE_DEVOPS_PAT"),
        };
        let github = GitHubSettings {
            token: require(self.github.token, "GITHUB_TOKEN"),
            repository: require(self.github.repository, "GITHUB_REPO"),
            workflow_file: require(self.github.workflow_file, "GITHUB_WORKFLOW_FILE"),
            default_branch: self.github.default_branch.unwrap_or_else(|| "main".into()),
        };

        if !missing.is_empty() {
            return Err(ConfigError::Missing { keys: missing });
        }

        let mut parts = github.repository.split('/');
        let well_formed = matches!(
            (parts.next(), parts.next(), parts.next()),
            (Some(owner), Some(name), None) if !owner.is_empty() && !name.is_empty()
        );
        if !well_formed {
            return Err(ConfigError::Invalid {
                key: "GITHUB_REPO",
                message: format!("expected owner/name, got {:?}", github.repository),
            });
        }

        let polling_secs = self
            .monitor
            .polling_interval_secs
            .unwrap_or(DEFAULT_POLLING_INTERVAL_SECS);
        if polling_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "POLLING_INTERVAL",
                message: "must be greater than zero".into(),
            });
        }

        let defaults = Eligibility::default();
        let eligibility = Eligibility {
            target_column: self.monitor.target_column.unwrap_or(defaults.target_column),
            work_item_type: self.monitor.work_item_type.unwrap_or(defaults.work_item_type),
            title_marker: self.monitor.title_marker.unwrap_or(defaults.title_marker),
            excluded_states: self
                .monitor
                .excluded_states
                .unwrap_or(defaults.excluded_states),
        };

        let monitor = MonitorSettings {
            polling_interval: Duration::from_secs(polling_secs),
            max_runtime: self
                .monitor
                .max_runtime_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            state_file: self
                .monitor
                .state_file
                .unwrap_or_else(|| data_dir().join("processed_items.json")),
            activity_log: self
                .monitor
                .activity_log
                .unwrap_or_else(|| data_dir().join("activity.jsonl")),
            prune_departed: self.monitor.prune_departed.unwrap_or(true),
            seed_existing: self.monitor.seed_existing.unwrap_or(false),
        };

        let defaults = CompletionSettings::default();
        let completion = CompletionSettings {
            wait_for_completion: self
                .completion
                .wait_for_completion
                .unwrap_or(defaults.wait_for_completion),
            timeout: self
                .completion
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            max_consecutive_errors: self
                .completion
                .max_consecutive_errors
                .unwrap_or(defaults.max_consecutive_errors),
            runs_page_size: self
                .completion
                .runs_page_size
                .unwrap_or(defaults.runs_page_size),
            match_buffer: self
                .completion
                .match_buffer_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.match_buffer),
        };

        let defaults = DispatchSettings::default();
        let dispatch = DispatchSettings {
            browser: self.dispatch.browser.unwrap_or(defaults.browser),
            pass_phrase: self.dispatch.pass_phrase.filter(|p| !p.is_empty()),
            verify_branch: self.dispatch.verify_branch.unwrap_or(defaults.verify_branch),
        };

        let customers = CustomerSources {
            markers_manifest: self
                .customers
                .markers_manifest
                .unwrap_or_else(|| PathBuf::from("pytest.ini")),
            config_dir: self
                .customers
                .config_dir
                .unwrap_or_else(|| PathBuf::from("config/customers")),
        };

        Ok(Settings {
            azure,
            github,
            monitor,
            eligibility,
            completion,
            dispatch,
            customers,
        })
    }
}

/// Settings with every required value filled in and all files under `dir`.
#[cfg(test)]
pub fn test_settings(dir: &Path) -> Settings {
    let mut config = AppConfig::default();
    config.azure_devops.organization = Some("contoso".into());
    config.azure_devops.project = Some("Shop".into());
    config.azure_devops.pat = Some("pat".into());
    config.github.token = Some("token".into());
    config.github.repository = Some("contoso/shop-tests".into());
    config.github.workflow_file = Some("run-tests.yml".into());
    config.monitor.state_file = Some(dir.join("processed_items.json"));
    config.monitor.activity_log = Some(dir.join("activity.jsonl"));
    config.customers.markers_manifest = Some(dir.join("pytest.ini"));
    config.customers.config_dir = Some(dir.join("customers"));
    config
        .resolve()
        .unwrap_or_else(|e| panic!("test settings: {e}"))
}
