//! Configuration loading with environment variable substitution.

use std::env;
use std::path::Path;
use tracing::debug;

use crate::types::ProxycallConfig;
use crate::ConfigError;

/// Configuration loader: TOML file, `${VAR}` substitution, environment
/// overrides, then validation.
#[derive(Default)]
pub struct ConfigLoader {
	file_path: Option<String>,
	env_prefix: String,
}

impl ConfigLoader {
	pub fn new() -> Self {
		Self {
			file_path: None,
			env_prefix: "PROXYCALL_".to_string(),
		}
	}

	pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
		self.file_path = Some(path.as_ref().to_string_lossy().to_string());
		self
	}

	pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
		self.env_prefix = prefix.into();
		self
	}

	pub async fn load(&self) -> Result<ProxycallConfig, ConfigError> {
		let mut config = if let Some(file_path) = &self.file_path {
			self.load_from_file(file_path).await?
		} else {
			return Err(ConfigError::FileNotFound(
				"No configuration file specified".to_string(),
			));
		};

		self.apply_env_overrides(&mut config)?;
		validate_config(&config)?;
		Ok(config)
	}

	async fn load_from_file(&self, file_path: &str) -> Result<ProxycallConfig, ConfigError> {
		let content = tokio::fs::read_to_string(file_path).await?;
		let substituted = substitute_env_vars(&content)?;
		toml::from_str(&substituted).map_err(|e| ConfigError::ParseError(e.to_string()))
	}

	fn apply_env_overrides(&self, config: &mut ProxycallConfig) -> Result<(), ConfigError> {
		if let Ok(log_level) = env::var(format!("{}LOG_LEVEL", self.env_prefix)) {
			debug!("overriding log level from environment");
			config.service.log_level = log_level;
		}

		if let Ok(http_port) = env::var(format!("{}HTTP_PORT", self.env_prefix)) {
			config.service.http_port = http_port
				.parse()
				.map_err(|e| ConfigError::ValidationError(format!("Invalid HTTP port: {}", e)))?;
		}

		if let Ok(secret) = env::var(format!("{}WEBHOOK_SECRET", self.env_prefix)) {
			debug!("overriding webhook secret from environment");
			config.telephony.webhook_secret = secret;
		}

		Ok(())
	}
}

/// Replaces every `${VAR_NAME}` with the variable's value; an unset
/// variable is a hard error rather than an empty string.
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
	let mut result = content.to_string();
	let re = regex::Regex::new(r"\$\{([^}]+)\}").unwrap();

	for cap in re.captures_iter(content) {
		let full_match = &cap[0];
		let var_name = &cap[1];

		let env_value =
			env::var(var_name).map_err(|_| ConfigError::EnvVarNotFound(var_name.to_string()))?;
		result = result.replace(full_match, &env_value);
	}

	Ok(result)
}

fn validate_config(config: &ProxycallConfig) -> Result<(), ConfigError> {
	if config.service.http_port == 0 {
		return Err(ConfigError::ValidationError(
			"service.http_port must be non-zero".to_string(),
		));
	}

	if config.pool.reservation_ttl_secs == 0 {
		return Err(ConfigError::ValidationError(
			"pool.reservation_ttl_secs must be non-zero".to_string(),
		));
	}

	// The sweep must outlive any reservation, so a swept order's release is
	// the only thing returning its row to the pool.
	if config.orders.max_order_age_secs <= config.pool.reservation_ttl_secs {
		return Err(ConfigError::ValidationError(format!(
			"orders.max_order_age_secs ({}) must exceed pool.reservation_ttl_secs ({})",
			config.orders.max_order_age_secs, config.pool.reservation_ttl_secs
		)));
	}

	if !(4..=8).contains(&config.orders.otp_length) {
		return Err(ConfigError::ValidationError(format!(
			"orders.otp_length must be between 4 and 8, got {}",
			config.orders.otp_length
		)));
	}

	if config.confirmation.max_attempts == 0 {
		return Err(ConfigError::ValidationError(
			"confirmation.max_attempts must be non-zero".to_string(),
		));
	}

	if config.store.min_request_interval_ms > 10_000 {
		return Err(ConfigError::ValidationError(
			"store.min_request_interval_ms above 10s makes the store unusable".to_string(),
		));
	}

	if config.store.call_timeout_secs == 0 {
		return Err(ConfigError::ValidationError(
			"store.call_timeout_secs must be non-zero".to_string(),
		));
	}

	if config.telephony.webhook_secret.is_empty() {
		return Err(ConfigError::ValidationError(
			"telephony.webhook_secret must be set".to_string(),
		));
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;

	fn write_config(contents: &str) -> tempfile::NamedTempFile {
		let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
		file.write_all(contents.as_bytes()).unwrap();
		file
	}

	const MINIMAL: &str = r#"
[service]
name = "proxycall-test"
http_port = 8099

[telephony]
base_url = "https://provider.example.com"
account_id = "acct"
auth_token = "token"
webhook_secret = "s3cret"
"#;

	#[tokio::test]
	async fn test_load_with_defaults() {
		let file = write_config(MINIMAL);
		let config = ConfigLoader::new().with_file(file.path()).load().await.unwrap();

		assert_eq!(config.service.name, "proxycall-test");
		assert_eq!(config.service.http_port, 8099);
		// Unspecified sections take defaults.
		assert_eq!(config.pool.max_reserve_attempts, 5);
		assert_eq!(config.pool.reservation_ttl_secs, 120);
		assert_eq!(config.orders.otp_length, 6);
		assert_eq!(config.confirmation.max_attempts, 3);
	}

	#[tokio::test]
	async fn test_env_substitution() {
		std::env::set_var("PROXYCALL_TEST_TOKEN_VALUE", "from-env");
		let file = write_config(
			r#"
[telephony]
base_url = "https://provider.example.com"
account_id = "acct"
auth_token = "${PROXYCALL_TEST_TOKEN_VALUE}"
webhook_secret = "s3cret"
"#,
		);

		let config = ConfigLoader::new().with_file(file.path()).load().await.unwrap();
		assert_eq!(config.telephony.auth_token, "from-env");
	}

	#[tokio::test]
	async fn test_unset_env_var_is_an_error() {
		let file = write_config(
			r#"
[telephony]
auth_token = "${PROXYCALL_TEST_DEFINITELY_UNSET}"
webhook_secret = "s3cret"
"#,
		);

		let err = ConfigLoader::new().with_file(file.path()).load().await.unwrap_err();
		assert!(matches!(err, ConfigError::EnvVarNotFound(_)));
	}

	#[tokio::test]
	async fn test_order_age_must_exceed_reservation_ttl() {
		let file = write_config(
			r#"
[telephony]
webhook_secret = "s3cret"

[pool]
reservation_ttl_secs = 600

[orders]
max_order_age_secs = 300
"#,
		);

		let err = ConfigLoader::new().with_file(file.path()).load().await.unwrap_err();
		assert!(matches!(err, ConfigError::ValidationError(_)));
	}

	#[tokio::test]
	async fn test_otp_length_bounds() {
		let file = write_config(
			r#"
[telephony]
webhook_secret = "s3cret"

[orders]
otp_length = 12
"#,
		);

		let err = ConfigLoader::new().with_file(file.path()).load().await.unwrap_err();
		assert!(matches!(err, ConfigError::ValidationError(_)));
	}

	#[tokio::test]
	async fn test_missing_webhook_secret_is_rejected() {
		let file = write_config("[service]\nhttp_port = 8080\n");
		let err = ConfigLoader::new().with_file(file.path()).load().await.unwrap_err();
		assert!(matches!(err, ConfigError::ValidationError(_)));
	}

	#[tokio::test]
	async fn test_env_override_of_port() {
		std::env::set_var("PROXYCALL_TEST_OVERRIDE_HTTP_PORT", "9999");
		let file = write_config(MINIMAL);
		let config = ConfigLoader::new()
			.with_env_prefix("PROXYCALL_TEST_OVERRIDE_")
			.with_file(file.path())
			.load()
			.await
			.unwrap();
		assert_eq!(config.service.http_port, 9999);
	}
}
