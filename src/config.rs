use crate::cli::{Cli, OutputFormat};
use crate::location::LocationPolicy;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Trait for abstracting environment variable access
pub trait EnvProvider {
    fn get(&self, key: &str) -> Option<String>;
}

/// System environment variable provider for production use
pub struct SystemEnvProvider;

impl EnvProvider for SystemEnvProvider {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParsing(#[from] toml::de::Error),

    #[error("JSON parsing error: {0}")]
    JsonParsing(#[from] serde_json::Error),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Environment variable error: {0}")]
    Environment(String),

    #[error("Unsupported configuration file format: {0}")]
    UnsupportedFormat(String),

    #[error("Unknown profile: {0}")]
    UnknownProfile(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub cache: CacheConfig,
    pub network: NetworkConfig,
    pub resources: ResourceConfig,
    pub output: OutputConfig,
    pub profiles: BTreeMap<String, ValidationProfile>,
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Root for fetched remote artifacts and their imports
    pub directory: PathBuf,
    /// Recompile stylesheets on every use
    pub disable_transform_cache: bool,
    /// Maximum number of compiled stylesheets kept in memory
    pub max_transforms: u64,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// HTTP request timeout in seconds
    pub timeout_seconds: u64,
    /// Number of retry attempts for failed downloads
    pub retry_attempts: u32,
    /// Retry delay in milliseconds
    pub retry_delay_ms: u64,
}

/// Where bundled artifacts live
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResourceConfig {
    /// Base directory for relative artifact paths in profiles
    pub root: PathBuf,
}

/// Output configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OutputConfig {
    pub format: OutputFormatConfig,
    pub verbose: bool,
    pub quiet: bool,
    /// Language used to select localized rule diagnostics
    pub locale: String,
}

/// Output format configuration (serializable version of CLI OutputFormat)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormatConfig {
    #[default]
    Human,
    Json,
    Xml,
}

impl From<OutputFormat> for OutputFormatConfig {
    fn from(format: OutputFormat) -> Self {
        match format {
            OutputFormat::Human => OutputFormatConfig::Human,
            OutputFormat::Json => OutputFormatConfig::Json,
            OutputFormat::Xml => OutputFormatConfig::Xml,
        }
    }
}

impl From<OutputFormatConfig> for OutputFormat {
    fn from(format: OutputFormatConfig) -> Self {
        match format {
            OutputFormatConfig::Human => OutputFormat::Human,
            OutputFormatConfig::Json => OutputFormat::Json,
            OutputFormatConfig::Xml => OutputFormat::Xml,
        }
    }
}

/// Whether a request may bring its own artifacts of one kind
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExternalArtifactSupport {
    #[default]
    None,
    Optional,
    Required,
}

/// Schema or rule-set artifacts configured for one validation type
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ArtifactDeclaration {
    /// Bundled file or directory
    pub local_path: Option<PathBuf>,
    /// Remote URLs, fetched once and cached
    pub remote: Vec<String>,
    pub external: ExternalArtifactSupport,
    /// Stylesheet applied to every resolved artifact before use
    pub preprocessor: Option<PathBuf>,
    /// Extension given to preprocessed artifacts
    pub preprocessor_output_extension: Option<String>,
}

/// A named validation setup, immutable once loaded
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ValidationProfile {
    pub name: String,
    /// Supported validation types; the first is the default
    pub validation_types: Vec<String>,
    pub schema: BTreeMap<String, ArtifactDeclaration>,
    pub schematron: BTreeMap<String, ArtifactDeclaration>,
    /// Types whose rule phase is skipped when schema validation fails
    pub stop_on_schema_errors: BTreeSet<String>,
    pub include_test: bool,
    pub include_assertion_id: bool,
    pub reports_ordered: bool,
    pub location_as_path: bool,
    pub show_location_paths: bool,
    pub add_input_to_report: bool,
    /// Remote import URL to local file
    pub remote_import_mappings: BTreeMap<String, PathBuf>,
    pub accepted_schema_extensions: Vec<String>,
    pub accepted_schematron_extensions: Vec<String>,
}

impl Default for ValidationProfile {
    fn default() -> Self {
        Self {
            name: String::new(),
            validation_types: Vec::new(),
            schema: BTreeMap::new(),
            schematron: BTreeMap::new(),
            stop_on_schema_errors: BTreeSet::new(),
            include_test: true,
            include_assertion_id: true,
            reports_ordered: false,
            location_as_path: false,
            show_location_paths: false,
            add_input_to_report: false,
            remote_import_mappings: BTreeMap::new(),
            accepted_schema_extensions: vec!["xsd".to_string()],
            accepted_schematron_extensions: vec![
                "sch".to_string(),
                "xsl".to_string(),
                "xslt".to_string(),
            ],
        }
    }
}

impl ValidationProfile {
    /// Profile with no bundled artifacts that accepts user-supplied ones for `validation_type`
    pub fn ad_hoc(validation_type: &str) -> Self {
        let external = ArtifactDeclaration {
            external: ExternalArtifactSupport::Optional,
            ..ArtifactDeclaration::default()
        };
        Self {
            name: "ad-hoc".to_string(),
            validation_types: vec![validation_type.to_string()],
            schema: BTreeMap::from([(validation_type.to_string(), external.clone())]),
            schematron: BTreeMap::from([(validation_type.to_string(), external)]),
            ..Self::default()
        }
    }

    pub fn supports(&self, validation_type: &str) -> bool {
        self.validation_types.iter().any(|t| t == validation_type)
    }

    pub fn default_type(&self) -> Option<&str> {
        self.validation_types.first().map(String::as_str)
    }

    pub fn schema_declaration(&self, validation_type: &str) -> Option<&ArtifactDeclaration> {
        self.schema.get(validation_type)
    }

    pub fn rule_declaration(&self, validation_type: &str) -> Option<&ArtifactDeclaration> {
        self.schematron.get(validation_type)
    }

    pub fn stops_on_schema_errors(&self, validation_type: &str) -> bool {
        self.stop_on_schema_errors.contains(validation_type)
    }

    pub fn location_policy(&self) -> LocationPolicy {
        LocationPolicy {
            as_path: self.location_as_path,
            show_paths: self.show_location_paths,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("xml-conformance"),
            disable_transform_cache: false,
            max_transforms: 256,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            retry_attempts: 3,
            retry_delay_ms: 1000,
        }
    }
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: OutputFormatConfig::Human,
            verbose: false,
            quiet: false,
            locale: "en".to_string(),
        }
    }
}

/// Configuration manager for loading and merging configurations
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration with precedence: file -> environment -> CLI
    pub async fn load_config(cli: &Cli) -> Result<Config> {
        Self::load_config_with(cli, &SystemEnvProvider).await
    }

    pub async fn load_config_with(cli: &Cli, env: &impl EnvProvider) -> Result<Config> {
        let mut config = Config::default();

        if let Some(config_path) = &cli.config {
            let file_config = Self::load_from_file(config_path).await?;
            config = Self::merge_configs(config, file_config);
        } else if let Some(found_config) = Self::find_config_file().await? {
            config = Self::merge_configs(config, found_config);
        }

        config = Self::apply_environment_overrides_with(env, config)?;
        config = Self::merge_with_cli(config, cli);
        Self::validate_config(&config)?;

        Ok(Self::resolve_resource_paths(config))
    }

    /// Load configuration from a file (TOML or JSON)
    pub async fn load_from_file(path: &Path) -> Result<Config> {
        let content = tokio::fs::read_to_string(path).await?;

        let mut config: Config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => toml::from_str(&content)?,
            Some("json") => serde_json::from_str(&content)?,
            Some(ext) => return Err(ConfigError::UnsupportedFormat(ext.to_string())),
            None => match toml::from_str::<Config>(&content) {
                Ok(config) => config,
                Err(_) => serde_json::from_str(&content)?,
            },
        };

        for (key, profile) in config.profiles.iter_mut() {
            if profile.name.is_empty() {
                profile.name = key.clone();
            }
        }
        Ok(config)
    }

    /// Find configuration file in standard locations
    pub async fn find_config_file() -> Result<Option<Config>> {
        let config_names = [
            "xml-conformance.toml",
            "xml-conformance.json",
            ".xml-conformance.toml",
            ".xml-conformance.json",
        ];

        for name in &config_names {
            let path = PathBuf::from(name);
            if path.exists() {
                return Ok(Some(Self::load_from_file(&path).await?));
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let app_config_dir = config_dir.join("xml-conformance");
            for name in &config_names {
                let path = app_config_dir.join(name);
                if path.exists() {
                    return Ok(Some(Self::load_from_file(&path).await?));
                }
            }
        }

        Ok(None)
    }

    /// Apply environment variable overrides using the system environment
    /// Apply environment variable overrides with a custom environment provider
    pub fn apply_environment_overrides_with(
        env: &impl EnvProvider,
        mut config: Config,
    ) -> Result<Config> {
        if let Some(cache_dir) = env.get("XML_CONFORMANCE_CACHE_DIR") {
            config.cache.directory = PathBuf::from(cache_dir);
        }

        if let Some(disable) = env.get("XML_CONFORMANCE_DISABLE_TRANSFORM_CACHE") {
            config.cache.disable_transform_cache = disable.parse().map_err(|_| {
                ConfigError::Environment(format!(
                    "Invalid XML_CONFORMANCE_DISABLE_TRANSFORM_CACHE value: {}",
                    disable
                ))
            })?;
        }

        if let Some(root) = env.get("XML_CONFORMANCE_RESOURCE_ROOT") {
            config.resources.root = PathBuf::from(root);
        }

        if let Some(timeout) = env.get("XML_CONFORMANCE_TIMEOUT") {
            config.network.timeout_seconds = timeout.parse().map_err(|_| {
                ConfigError::Environment(format!(
                    "Invalid XML_CONFORMANCE_TIMEOUT value: {}",
                    timeout
                ))
            })?;
        }

        if let Some(retry_attempts) = env.get("XML_CONFORMANCE_RETRY_ATTEMPTS") {
            config.network.retry_attempts = retry_attempts.parse().map_err(|_| {
                ConfigError::Environment(format!(
                    "Invalid XML_CONFORMANCE_RETRY_ATTEMPTS value: {}",
                    retry_attempts
                ))
            })?;
        }

        if let Some(locale) = env.get("XML_CONFORMANCE_LOCALE") {
            config.output.locale = locale;
        }

        if let Some(format) = env.get("XML_CONFORMANCE_FORMAT") {
            config.output.format = match format.to_lowercase().as_str() {
                "human" => OutputFormatConfig::Human,
                "json" => OutputFormatConfig::Json,
                "xml" => OutputFormatConfig::Xml,
                _ => {
                    return Err(ConfigError::Environment(format!(
                        "Invalid XML_CONFORMANCE_FORMAT value: {}",
                        format
                    )));
                }
            };
        }

        Ok(config)
    }

    /// Merge CLI arguments with configuration (CLI takes precedence)
    pub fn merge_with_cli(mut config: Config, cli: &Cli) -> Config {
        if let Some(cache_dir) = &cli.cache_dir {
            config.cache.directory = cache_dir.clone();
        }
        if cli.disable_transform_cache {
            config.cache.disable_transform_cache = true;
        }

        if let Some(timeout) = cli.timeout {
            config.network.timeout_seconds = timeout;
        }

        if let Some(format) = cli.format {
            config.output.format = format.into();
        }
        if let Some(locale) = &cli.locale {
            config.output.locale = locale.clone();
        }
        if cli.verbose || cli.quiet {
            config.output.verbose = cli.verbose;
            config.output.quiet = cli.quiet;
        }

        config
    }

    /// Merge two configurations (second takes precedence; profiles are merged by name)
    pub fn merge_configs(mut base: Config, override_config: Config) -> Config {
        base.cache = override_config.cache;
        base.network = override_config.network;
        base.resources = override_config.resources;
        base.output = override_config.output;
        base.profiles.extend(override_config.profiles);
        base
    }

    /// Validate configuration values
    pub fn validate_config(config: &Config) -> Result<()> {
        if config.cache.max_transforms == 0 {
            return Err(ConfigError::Validation(
                "Transform cache size must be greater than 0".to_string(),
            ));
        }

        if config.network.timeout_seconds == 0 {
            return Err(ConfigError::Validation(
                "Timeout must be greater than 0".to_string(),
            ));
        }

        if config.network.retry_attempts > 10 {
            return Err(ConfigError::Validation(
                "Retry attempts cannot exceed 10".to_string(),
            ));
        }

        if config.output.verbose && config.output.quiet {
            return Err(ConfigError::Validation(
                "Cannot enable both verbose and quiet modes".to_string(),
            ));
        }

        if config.output.locale.trim().is_empty() {
            return Err(ConfigError::Validation("Locale must not be empty".to_string()));
        }

        for (name, profile) in &config.profiles {
            Self::validate_profile(name, profile)?;
        }

        Ok(())
    }

    fn validate_profile(name: &str, profile: &ValidationProfile) -> Result<()> {
        if profile.validation_types.is_empty() {
            return Err(ConfigError::Validation(format!(
                "Profile {} declares no validation types",
                name
            )));
        }

        let declared = profile
            .schema
            .keys()
            .chain(profile.schematron.keys())
            .chain(profile.stop_on_schema_errors.iter());
        for validation_type in declared {
            if !profile.supports(validation_type) {
                return Err(ConfigError::Validation(format!(
                    "Profile {} configures unknown validation type {}",
                    name, validation_type
                )));
            }
        }

        for declaration in profile.schema.values().chain(profile.schematron.values()) {
            for remote in &declaration.remote {
                url::Url::parse(remote).map_err(|e| {
                    ConfigError::Validation(format!(
                        "Profile {} has an invalid remote artifact URL {}: {}",
                        name, remote, e
                    ))
                })?;
            }
        }

        let extensions = profile
            .accepted_schema_extensions
            .iter()
            .chain(&profile.accepted_schematron_extensions);
        for ext in extensions {
            if ext.is_empty() || ext.contains('/') || ext.contains('\\') || ext.contains('.') {
                return Err(ConfigError::Validation(format!(
                    "Invalid file extension: {}",
                    ext
                )));
            }
        }

        Ok(())
    }

    /// Anchor relative artifact paths at the resource root
    pub fn resolve_resource_paths(mut config: Config) -> Config {
        let root = config.resources.root.clone();
        let anchor = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = root.join(&*path);
            }
        };
        for profile in config.profiles.values_mut() {
            for declaration in profile
                .schema
                .values_mut()
                .chain(profile.schematron.values_mut())
            {
                if let Some(path) = declaration.local_path.as_mut() {
                    anchor(path);
                }
                if let Some(path) = declaration.preprocessor.as_mut() {
                    anchor(path);
                }
            }
            for path in profile.remote_import_mappings.values_mut() {
                anchor(path);
            }
        }
        config
    }

    /// Pick a profile by name, or the only configured one
    pub fn select_profile(config: &Config, name: Option<&str>) -> Result<Arc<ValidationProfile>> {
        match name {
            Some(name) => config
                .profiles
                .get(name)
                .cloned()
                .map(Arc::new)
                .ok_or_else(|| ConfigError::UnknownProfile(name.to_string())),
            None if config.profiles.len() == 1 => Ok(Arc::new(
                config.profiles.values().next().cloned().unwrap_or_default(),
            )),
            None if config.profiles.is_empty() => Err(ConfigError::UnknownProfile(
                "no profiles are configured".to_string(),
            )),
            None => Err(ConfigError::Validation(format!(
                "Several profiles are configured ({}); select one with --profile",
                config.profiles.keys().cloned().collect::<Vec<_>>().join(", ")
            ))),
        }
    }
}
