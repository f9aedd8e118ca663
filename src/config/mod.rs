use crate::types::{GroupingTag, AE};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

pub mod reload;

/// Environment variables with this prefix override values from the configuration files,
/// e.g. `DICOM_GATEWAY_TELEMETRY__LEVEL=debug`.
const ENV_PREFIX: &str = "DICOM_GATEWAY";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
	pub telemetry: TelemetryConfig,
	pub server: ServerConfig,
	pub storage: StorageConfig,
	pub s3: S3Config,
	pub messaging: MessagingConfig,
	pub delivery: DeliveryConfig,
	#[serde(default)]
	pub endpoints: Vec<EndpointConfig>,
	#[serde(default)]
	pub sources: Vec<SourceConfig>,
}

impl AppConfig {
	pub fn new() -> Result<Self, config::ConfigError> {
		use config::Config;
		let s = Config::builder()
			.add_source(config::File::from_str(
				include_str!("defaults.toml"),
				config::FileFormat::Toml,
			))
			.add_source(config::File::with_name("config.toml").required(false))
			.add_source(
				config::Environment::with_prefix(ENV_PREFIX)
					.prefix_separator("_")
					.separator("__"),
			)
			.build()?;

		s.try_deserialize()
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
	/// Configurable logging level. RUST_LOG takes precedence if set.
	#[serde(with = "level")]
	pub level: tracing::Level,
	/// Sentry DSN. Sentry stays disabled if unset.
	pub sentry: Option<String>,
}

mod level {
	use serde::{Deserialize, Deserializer};

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<tracing::Level, D::Error> {
		let value = String::deserialize(deserializer)?;
		value.parse().map_err(serde::de::Error::custom)
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
	pub http: HttpServerConfig,
	#[serde(default)]
	pub dimse: Vec<DimseServerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpServerConfig {
	pub interface: IpAddr,
	pub port: u16,
	pub graceful_shutdown: bool,
	/// Request timeout in seconds.
	pub request_timeout: u64,
}

/// A STORE-SCP listener. The AE title is the called AE title admissions are routed to.
#[derive(Debug, Clone, Deserialize)]
pub struct DimseServerConfig {
	pub aet: AE,
	pub interface: IpAddr,
	pub port: u16,
	/// Only accept uncompressed transfer syntaxes.
	#[serde(default)]
	pub uncompressed: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
	/// Root directory for received instances awaiting delivery.
	pub temporary: PathBuf,
	/// Path of the SQLite database holding in-flight payloads.
	pub database: PathBuf,
	/// Maximum usage of the temporary volume, in percent, before new instances are rejected.
	pub watermark: u8,
	/// Space in GB that must always stay free on the temporary volume.
	pub reserved_space_gb: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
	pub endpoint: String,
	pub bucket: String,
	pub region: Option<String>,
	#[serde(default)]
	pub endpoint_style: S3EndpointStyle,
	pub credentials: Option<S3CredentialsConfig>,
}

#[derive(Debug, Default, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum S3EndpointStyle {
	#[default]
	Path,
	VHost,
}

/// Names of the environment variables that hold the S3 credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct S3CredentialsConfig {
	pub access_key_env: String,
	pub secret_key_env: String,
}

impl S3CredentialsConfig {
	pub fn resolve(&self) -> Result<aws_credential_types::Credentials, std::env::VarError> {
		let access_key = std::env::var(&self.access_key_env)?;
		let secret_key = std::env::var(&self.secret_key_env)?;
		Ok(aws_credential_types::Credentials::new(
			access_key,
			secret_key,
			None,
			None,
			"dicom-gateway",
		))
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessagingConfig {
	/// Base URL of the broker's HTTP publishing interface.
	pub endpoint: url::Url,
	/// Topic that receives workflow requests.
	pub workflow_request_topic: String,
	/// Request timeout in milliseconds.
	pub timeout: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
	/// Number of payloads uploaded and published concurrently.
	pub concurrency: usize,
	/// What happens to a payload that ran out of retries.
	#[serde(default)]
	pub abandoned: AbandonPolicy,
	pub retries: RetryConfig,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AbandonPolicy {
	/// Keep the payload in the database, marked as abandoned, for manual inspection.
	#[default]
	Retain,
	/// Remove the payload from the database.
	Purge,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
	/// Delays between retries in milliseconds.
	pub delays: Vec<u64>,
	/// Defaults to the number of delays.
	pub max_retries: Option<u32>,
}

impl RetryConfig {
	pub fn delays(&self) -> Vec<Duration> {
		self.delays.iter().copied().map(Duration::from_millis).collect()
	}
}

const fn default_timeout() -> u32 {
	crate::pipeline::DEFAULT_TIMEOUT
}

const fn default_reject_unknown_sources() -> bool {
	true
}

/// A receiving application entity of the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
	/// Unique name of the endpoint.
	pub name: String,
	/// The called AE title that routes instances to this endpoint.
	pub aet: AE,
	/// Attribute whose value groups instances into one payload.
	#[serde(default)]
	pub grouping: GroupingTag,
	/// Workflows that should be triggered for payloads received by this endpoint.
	#[serde(default)]
	pub workflows: Vec<String>,
	/// Instances of these SOP classes are accepted but silently dropped.
	#[serde(default)]
	pub ignored_sop_classes: Vec<String>,
	/// Seconds without new instances after which a payload is considered complete.
	#[serde(default = "default_timeout")]
	pub timeout: u32,
	/// Only accept instances from configured sources.
	#[serde(default = "default_reject_unknown_sources")]
	pub reject_unknown_sources: bool,
}

impl EndpointConfig {
	pub fn new(name: impl Into<String>, aet: impl Into<AE>) -> Self {
		Self {
			name: name.into(),
			aet: aet.into(),
			grouping: GroupingTag::default(),
			workflows: Vec::new(),
			ignored_sop_classes: Vec::new(),
			timeout: default_timeout(),
			reject_unknown_sources: default_reject_unknown_sources(),
		}
	}
}

/// A calling application entity that is allowed to send instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
	pub name: String,
	pub aet: AE,
	/// If set, the peer address of the association must match as well.
	pub host: Option<String>,
}
