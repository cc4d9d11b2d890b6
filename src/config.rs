use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use reqwest::header::{HeaderName, HeaderValue};
use sha1::{Digest, Sha1};
use url::Url;

use crate::backup::BOOTSTRAP_FILE_ENV;
use crate::util::default_instance_id;

const FEATURES_PATH: &str = "client/features";
const DEFAULT_ENVIRONMENT: &str = "default";
const DEFAULT_FETCH_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_MAX_BACKOFF_INTERVAL: Duration = Duration::from_secs(300);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("an app name is required")]
    MissingAppName,

    #[error("an API URL is required")]
    MissingApiUrl,

    #[error("Unleash API is not a valid URL: {0}")]
    InvalidApiUrl(String),

    #[error("invalid header {0}")]
    InvalidHeader(String),
}

/// Settings of a synchronization controller. Create one with [SyncConfig::builder].
#[derive(Clone, Debug)]
pub struct SyncConfig {
    api_url: Url,
    fetch_url: Url,
    app_name: String,
    instance_id: String,
    environment: String,
    api_key: Option<String>,
    custom_headers: HashMap<String, String>,
    project_name: Option<String>,
    name_prefix: Option<String>,
    fetch_interval: Duration,
    max_backoff_interval: Duration,
    connect_timeout: Duration,
    read_timeout: Duration,
    synchronous_fetch_on_init: bool,
    disable_polling: bool,
    backup_file: PathBuf,
    bootstrap_file: Option<PathBuf>,
    fail_on_multiple_instantiations: bool,
}

impl SyncConfig {
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::default()
    }

    pub fn api_url(&self) -> &Url {
        &self.api_url
    }

    /// The URL features are fetched from, with the project and name prefix filters applied.
    pub fn fetch_url(&self) -> &Url {
        &self.fetch_url
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }

    pub fn custom_headers(&self) -> &HashMap<String, String> {
        &self.custom_headers
    }

    pub fn fetch_interval(&self) -> Duration {
        self.fetch_interval
    }

    pub fn max_backoff_interval(&self) -> Duration {
        self.max_backoff_interval
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    pub fn synchronous_fetch_on_init(&self) -> bool {
        self.synchronous_fetch_on_init
    }

    pub fn disable_polling(&self) -> bool {
        self.disable_polling
    }

    pub fn backup_file(&self) -> &PathBuf {
        &self.backup_file
    }

    pub fn bootstrap_file(&self) -> Option<&PathBuf> {
        self.bootstrap_file.as_ref()
    }

    pub fn fail_on_multiple_instantiations(&self) -> bool {
        self.fail_on_multiple_instantiations
    }

    /// Identifies clients sharing credentials, app name and instance id. Two live controllers with
    /// the same identifier are almost always a mistake.
    pub fn client_identifier(&self) -> String {
        let mut hasher = Sha1::new();
        hasher.update(self.api_key.as_deref().unwrap_or_default());
        hasher.update(&self.app_name);
        hasher.update(&self.instance_id);
        base16ct::lower::encode_string(&hasher.finalize())
    }
}

/// Contains methods for configuring a [SyncConfig].
#[derive(Clone, Debug)]
pub struct SyncConfigBuilder {
    api_url: Option<String>,
    app_name: Option<String>,
    instance_id: Option<String>,
    environment: String,
    api_key: Option<String>,
    custom_headers: HashMap<String, String>,
    project_name: Option<String>,
    name_prefix: Option<String>,
    fetch_interval: Duration,
    max_backoff_interval: Duration,
    connect_timeout: Duration,
    read_timeout: Duration,
    synchronous_fetch_on_init: bool,
    disable_polling: bool,
    backup_file: Option<PathBuf>,
    bootstrap_file: Option<PathBuf>,
    fail_on_multiple_instantiations: bool,
}

impl Default for SyncConfigBuilder {
    fn default() -> Self {
        SyncConfigBuilder {
            api_url: None,
            app_name: None,
            instance_id: None,
            environment: DEFAULT_ENVIRONMENT.to_string(),
            api_key: None,
            custom_headers: HashMap::new(),
            project_name: None,
            name_prefix: None,
            fetch_interval: DEFAULT_FETCH_INTERVAL,
            max_backoff_interval: DEFAULT_MAX_BACKOFF_INTERVAL,
            connect_timeout: DEFAULT_TIMEOUT,
            read_timeout: DEFAULT_TIMEOUT,
            synchronous_fetch_on_init: false,
            disable_polling: false,
            backup_file: None,
            bootstrap_file: std::env::var_os(BOOTSTRAP_FILE_ENV).map(PathBuf::from),
            fail_on_multiple_instantiations: false,
        }
    }
}

impl SyncConfigBuilder {
    pub fn api_url(&mut self, api_url: impl Into<String>) -> &mut Self {
        self.api_url = Some(api_url.into());
        self
    }

    pub fn app_name(&mut self, app_name: impl Into<String>) -> &mut Self {
        self.app_name = Some(app_name.into());
        self
    }

    pub fn instance_id(&mut self, instance_id: impl Into<String>) -> &mut Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    pub fn environment(&mut self, environment: impl Into<String>) -> &mut Self {
        self.environment = environment.into();
        self
    }

    /// Sent as the `Authorization` header.
    pub fn api_key(&mut self, api_key: impl Into<String>) -> &mut Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn custom_header(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.custom_headers.insert(name.into(), value.into());
        self
    }

    pub fn project_name(&mut self, project_name: impl Into<String>) -> &mut Self {
        self.project_name = Some(project_name.into());
        self
    }

    pub fn name_prefix(&mut self, name_prefix: impl Into<String>) -> &mut Self {
        self.name_prefix = Some(name_prefix.into());
        self
    }

    pub fn fetch_interval(&mut self, fetch_interval: Duration) -> &mut Self {
        self.fetch_interval = fetch_interval;
        self
    }

    /// The longest the client may go without trying to refresh, however badly the server behaves.
    pub fn max_backoff_interval(&mut self, max_backoff_interval: Duration) -> &mut Self {
        self.max_backoff_interval = max_backoff_interval;
        self
    }

    pub fn connect_timeout(&mut self, connect_timeout: Duration) -> &mut Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn read_timeout(&mut self, read_timeout: Duration) -> &mut Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn synchronous_fetch_on_init(&mut self, synchronous_fetch_on_init: bool) -> &mut Self {
        self.synchronous_fetch_on_init = synchronous_fetch_on_init;
        self
    }

    pub fn disable_polling(&mut self, disable_polling: bool) -> &mut Self {
        self.disable_polling = disable_polling;
        self
    }

    pub fn backup_file(&mut self, backup_file: impl Into<PathBuf>) -> &mut Self {
        self.backup_file = Some(backup_file.into());
        self
    }

    pub fn bootstrap_file(&mut self, bootstrap_file: impl Into<PathBuf>) -> &mut Self {
        self.bootstrap_file = Some(bootstrap_file.into());
        self
    }

    pub fn fail_on_multiple_instantiations(&mut self, fail: bool) -> &mut Self {
        self.fail_on_multiple_instantiations = fail;
        self
    }

    pub fn build(&self) -> Result<SyncConfig, ConfigError> {
        let app_name = self.app_name.clone().ok_or(ConfigError::MissingAppName)?;
        let api_url = parse_api_url(self.api_url.as_deref().ok_or(ConfigError::MissingApiUrl)?)?;
        let fetch_url = features_url(
            &api_url,
            self.project_name.as_deref(),
            self.name_prefix.as_deref(),
        )?;

        for (name, value) in &self.custom_headers {
            HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| ConfigError::InvalidHeader(name.clone()))?;
            HeaderValue::from_str(value).map_err(|_| ConfigError::InvalidHeader(name.clone()))?;
        }
        if let Some(api_key) = &self.api_key {
            HeaderValue::from_str(api_key)
                .map_err(|_| ConfigError::InvalidHeader("Authorization".to_string()))?;
        }

        let backup_file = self.backup_file.clone().unwrap_or_else(|| {
            std::env::temp_dir().join(format!("unleash-{}-repo.json", app_name))
        });

        Ok(SyncConfig {
            api_url,
            fetch_url,
            instance_id: self.instance_id.clone().unwrap_or_else(default_instance_id),
            app_name,
            environment: self.environment.clone(),
            api_key: self.api_key.clone(),
            custom_headers: self.custom_headers.clone(),
            project_name: self.project_name.clone(),
            name_prefix: self.name_prefix.clone(),
            fetch_interval: self.fetch_interval,
            max_backoff_interval: self.max_backoff_interval,
            connect_timeout: self.connect_timeout,
            read_timeout: self.read_timeout,
            synchronous_fetch_on_init: self.synchronous_fetch_on_init,
            disable_polling: self.disable_polling,
            backup_file,
            bootstrap_file: self.bootstrap_file.clone(),
            fail_on_multiple_instantiations: self.fail_on_multiple_instantiations,
        })
    }
}

// Relative joins replace the last path segment unless the base ends in a slash.
fn parse_api_url(api_url: &str) -> Result<Url, ConfigError> {
    let mut url = Url::parse(api_url).map_err(|_| ConfigError::InvalidApiUrl(api_url.to_string()))?;
    if url.cannot_be_a_base() {
        return Err(ConfigError::InvalidApiUrl(api_url.to_string()));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn features_url(
    api_url: &Url,
    project_name: Option<&str>,
    name_prefix: Option<&str>,
) -> Result<Url, ConfigError> {
    let mut url = api_url
        .join(FEATURES_PATH)
        .map_err(|_| ConfigError::InvalidApiUrl(api_url.to_string()))?;
    let params: Vec<(&str, &str)> = [("project", project_name), ("namePrefix", name_prefix)]
        .into_iter()
        .filter_map(|(key, value)| value.map(|value| (key, value)))
        .collect();
    if !params.is_empty() {
        url.query_pairs_mut().extend_pairs(params);
    }
    Ok(url)
}
