//! Config for the rotation engine and failure monitor.
use std::{
	collections::HashMap,
	path::{Path, PathBuf},
	sync::Arc,
	time::Duration,
};

use ldap3::LdapConnSettings;
use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::Error;

/// Characters that count towards the special character class.
pub const SPECIAL_CHARS: &str = "!@#$%^&*()_+-=[]{}|;:,.<>?";

/// Shortest generated credential a configuration may ask for.
pub const MIN_PASSWORD_LENGTH: usize = 8;

/// Top level configuration.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct Config {
	/// The URL of the supplier directory server. Supports the ldap and ldaps
	/// schemes. Consumer sessions reuse its scheme with the consumer host.
	pub url: Url,
	/// Connection settings, shared by supplier and consumer sessions.
	#[serde(default)]
	pub connection: ConnectionConfig,
	/// Administrative identity used to bind to every server
	pub bind_dn: String,
	/// Password for [`Config::bind_dn`]
	pub bind_password: String,
	/// Where and how to look for replication agreements
	#[serde(default)]
	pub searches: Searches,
	/// Names of agreement attributes to read and write
	#[serde(default)]
	pub attributes: AttributeConfig,
	/// Location of the account the supplier binds as on each consumer
	#[serde(default)]
	pub consumer: ConsumerConfig,
	/// Where new credential values come from
	#[serde(default)]
	pub password: PasswordConfig,
	/// Authentication failure monitoring
	#[serde(default)]
	pub monitor: MonitorConfig,
}

impl Config {
	/// Read and validate a YAML configuration file.
	pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
		let raw = std::fs::read_to_string(path)?;
		Self::from_yaml_str(&raw)
	}

	/// Parse and validate a YAML configuration document.
	pub fn from_yaml_str(raw: &str) -> Result<Self, Error> {
		let config: Config = serde_yaml::from_str(raw)?;
		config.validate()?;
		Ok(config)
	}

	/// Check that the settings required for a rotation are present and sane.
	pub fn validate(&self) -> Result<(), Error> {
		if self.url.host_str().is_none() {
			return Err(Error::Invalid("directory url has no host".to_owned()));
		}
		if self.bind_dn.is_empty() {
			return Err(Error::Invalid("bind_dn is required".to_owned()));
		}
		if self.bind_password.is_empty() {
			return Err(Error::Invalid("bind_password is required".to_owned()));
		}
		if self.password.length < MIN_PASSWORD_LENGTH {
			return Err(Error::Invalid(format!(
				"password length must be at least {MIN_PASSWORD_LENGTH} characters"
			)));
		}
		if self.monitor.enabled && self.monitor.poll_interval == 0 {
			return Err(Error::Invalid("monitor poll_interval must be non-zero".to_owned()));
		}
		if self.monitor.event_buffer == 0 {
			return Err(Error::Invalid("monitor event_buffer must be non-zero".to_owned()));
		}
		Ok(())
	}

	/// Host name of the supplier server, as written in the configured url.
	#[must_use]
	pub fn supplier_host(&self) -> &str {
		self.url.host_str().unwrap_or_default()
	}

	/// The url used to reach a consumer: the supplier url with host (and port,
	/// if the agreement records one) swapped out.
	pub fn consumer_url(&self, host: &str, port: Option<u16>) -> Result<Url, Error> {
		let mut url = self.url.clone();
		url.set_host(Some(host))
			.map_err(|err| Error::Invalid(format!("consumer host {host}: {err}")))?;
		if let Some(port) = port {
			url.set_port(Some(port))
				.map_err(|()| Error::Invalid(format!("cannot set port on {url}")))?;
		}
		Ok(url)
	}
}

/// Configuration for how to connect to the LDAP server
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
	/// Timeout to establish a connection in seconds.
	pub timeout: u64,

	/// LDAP operation timeout. For search per reply.
	pub operation_timeout: Duration,

	/// TLS config
	pub tls: TLSConfig,
}

impl Default for ConnectionConfig {
	fn default() -> Self {
		Self { timeout: 30, operation_timeout: Duration::from_secs(30), tls: TLSConfig::default() }
	}
}

/// TLS Configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TLSConfig {
	/// Use StartTLS extended operation for establishing a secure connection,
	/// rather than TLS on a dedicated port.
	pub starttls: bool,

	/// Disable verification of TLS certificates
	pub no_tls_verify: bool,

	/// TLS root certificates path
	pub root_certificates_path: Option<PathBuf>,

	/// Path of the TLS client key to use for the connection
	pub client_key_path: Option<PathBuf>,

	/// Path of the TLS client certificate to use for the connection
	pub client_certificate_path: Option<PathBuf>,
}

/// Names of the replication agreement attributes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttributeConfig {
	/// Common name of the agreement
	pub name: String,
	/// Host name of the consumer
	pub consumer_host: String,
	/// Port of the consumer, optional on the entry
	pub consumer_port: String,
	/// Identity the supplier binds as on the consumer
	pub bind_identity: String,
	/// Tri-state enabled flag
	pub enabled: String,
	/// Credential the supplier sends when binding
	pub credentials: String,
}

impl Default for AttributeConfig {
	fn default() -> Self {
		Self {
			name: "cn".to_owned(),
			consumer_host: "nsDS5ReplicaHost".to_owned(),
			consumer_port: "nsDS5ReplicaPort".to_owned(),
			bind_identity: "nsDS5ReplicaBindDN".to_owned(),
			enabled: "nsds5ReplicaEnabled".to_owned(),
			credentials: "nsDS5ReplicaCredentials".to_owned(),
		}
	}
}

impl AttributeConfig {
	/// Returns the list of attributes the server should return for an
	/// agreement. The credential itself is never read.
	#[must_use]
	pub fn get_attr_filter(&self) -> Vec<String> {
		vec![
			self.name.clone(),
			self.consumer_host.clone(),
			self.consumer_port.clone(),
			self.bind_identity.clone(),
			self.enabled.clone(),
		]
	}
}

/// Configurable filters and bases to use for LDAP searches
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Searches {
	/// If set, enables the [simple paged search control] and sets the page size
	/// to the given value
	///
	/// [simple paged search control]: https://www.rfc-editor.org/rfc/rfc2696.html
	pub page_size: Option<i32>,
	/// The search filter selecting replication agreements
	pub agreement_filter: String,
	/// The subtree that holds replication agreements
	pub agreement_base: String,
}

impl Default for Searches {
	fn default() -> Self {
		Self {
			page_size: None,
			agreement_filter: "(objectClass=nsds5ReplicationAgreement)".to_owned(),
			agreement_base: "cn=config".to_owned(),
		}
	}
}

/// The account on each consumer the supplier authenticates as.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
	/// DN of the replication manager account
	pub replication_manager_dn: String,
	/// Attribute holding the account password
	pub password_attribute: String,
}

impl Default for ConsumerConfig {
	fn default() -> Self {
		Self {
			replication_manager_dn: "cn=replication manager,cn=config".to_owned(),
			password_attribute: "userPassword".to_owned(),
		}
	}
}

/// Credential sources and generation policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PasswordConfig {
	/// Minimum length of generated credentials
	pub length: usize,
	/// Require and draw from a-z
	pub include_lowercase: bool,
	/// Require and draw from A-Z
	pub include_uppercase: bool,
	/// Require and draw from 0-9
	pub include_numbers: bool,
	/// Require and draw from [`SPECIAL_CHARS`]
	pub include_special: bool,
	/// Characters never used in generated credentials
	pub exclude_chars: String,
	/// Explicit credentials keyed by agreement name
	pub predefined_passwords: HashMap<String, String>,
	/// Credential used for agreements without an explicit one
	pub default_password: Option<String>,
	/// Generate credentials when no explicit or default value applies. Unset
	/// means enabled only if no explicit and no default values are configured.
	pub generate_random: Option<bool>,
}

impl Default for PasswordConfig {
	fn default() -> Self {
		Self {
			length: 16,
			include_lowercase: true,
			include_uppercase: true,
			include_numbers: true,
			include_special: true,
			exclude_chars: "0O1lI".to_owned(),
			predefined_passwords: HashMap::new(),
			default_password: None,
			generate_random: None,
		}
	}
}

impl PasswordConfig {
	/// Whether the resolver may fall back to generating a value.
	#[must_use]
	pub fn generation_enabled(&self) -> bool {
		self.generate_random.unwrap_or_else(|| {
			self.default_password.as_deref().map_or(true, str::is_empty)
				&& self.predefined_passwords.is_empty()
		})
	}

	/// Human readable description of what generated credentials look like.
	#[must_use]
	pub fn describe(&self) -> String {
		let mut policy = String::from("Password Policy:\n");
		policy.push_str(&format!("- Length: at least {} characters\n", self.length));
		if self.include_lowercase {
			policy.push_str("- Includes lowercase letters (a-z)\n");
		}
		if self.include_uppercase {
			policy.push_str("- Includes uppercase letters (A-Z)\n");
		}
		if self.include_numbers {
			policy.push_str("- Includes numbers (0-9)\n");
		}
		if self.include_special {
			policy.push_str(&format!("- Includes special characters ({SPECIAL_CHARS})\n"));
		}
		if !self.exclude_chars.is_empty() {
			policy.push_str(&format!("- Excludes confusing characters: {}\n", self.exclude_chars));
		}
		if !self.generation_enabled() {
			policy.push_str("- Generation disabled, explicit or default values only\n");
		}
		policy
	}
}

/// Log watching knobs.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
	/// Whether monitoring should run at all
	pub enabled: bool,
	/// Directory server logs to watch
	pub log_paths: Vec<PathBuf>,
	/// Seconds between two scans of the same log
	pub poll_interval: u64,
	/// Start sources without a saved offset at their current end instead of
	/// the beginning, so failures logged before the first start are not
	/// reported
	pub start_at_end: bool,
	/// Detected events buffered before watchers wait for the receiver
	pub event_buffer: usize,
}

impl Default for MonitorConfig {
	fn default() -> Self {
		Self {
			enabled: false,
			log_paths: vec![
				PathBuf::from("/var/log/dirsrv/slapd-ldap/errors"),
				PathBuf::from("/var/log/dirsrv/slapd-ldap/access"),
			],
			poll_interval: 5,
			start_at_end: false,
			event_buffer: 1024,
		}
	}
}

impl ConnectionConfig {
	/// Create a [`LdapConnSettings`] based on this [`ConnectionConfig`]
	pub(crate) async fn to_settings(&self) -> Result<LdapConnSettings, Error> {
		let mut settings = LdapConnSettings::new();

		settings = settings.set_conn_timeout(Duration::from_secs(self.timeout));
		settings = settings.set_starttls(self.tls.starttls);
		settings = settings.set_no_tls_verify(self.tls.no_tls_verify);

		if let Some(path) = &self.tls.root_certificates_path {
			let mut roots = RootCertStore::empty();
			let certs = rustls_pemfile::certs(&mut tokio::fs::read(path).await?.as_slice())?;
			if certs.is_empty() {
				return Err(Error::Invalid("Could not read root certificate".to_owned()));
			}
			for der in certs {
				roots
					.add(&Certificate(der))
					.map_err(|_| Error::Invalid("Could not read root certificate".to_owned()))?;
			}
			let builder = ClientConfig::builder().with_safe_defaults().with_root_certificates(roots);

			let client_config =
				match (&self.tls.client_key_path, &self.tls.client_certificate_path) {
					(Some(key_path), Some(cert_path)) => {
						let chain =
							rustls_pemfile::certs(&mut tokio::fs::read(cert_path).await?.as_slice())?
								.into_iter()
								.map(Certificate)
								.collect();
						let key = rustls_pemfile::pkcs8_private_keys(
							&mut tokio::fs::read(key_path).await?.as_slice(),
						)?
						.into_iter()
						.next()
						.ok_or_else(|| {
							Error::Invalid("Could not read client certificates".to_owned())
						})?;
						builder.with_client_auth_cert(chain, PrivateKey(key)).map_err(|_| {
							Error::Invalid("Could not read client certificates".to_owned())
						})?
					}
					(None, None) => builder.with_no_client_auth(),
					_ => Err(Error::Invalid(
						"Both a client certificate and key file in PKCS8 format must be specified"
							.to_owned(),
					))?,
				};
			settings = settings.set_config(Arc::new(client_config));
		}
		Ok(settings)
	}
}
