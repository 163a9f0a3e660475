//! Error codes

/// Errors that can occur when using this library
#[derive(thiserror::Error, Debug)]
pub enum Error {
	/// Establishing or binding a directory session failed. Fatal to a rotation
	/// cycle.
	#[error("Connecting to {host} failed: {source}")]
	Connection {
		/// Host the session was opened against
		host: String,
		/// Underlying protocol error
		#[source]
		source: ldap3::LdapError,
	},
	/// The agreement search failed. Fatal to a rotation cycle.
	#[error("Search under {base} failed: {source}")]
	Query {
		/// Search base
		base: String,
		/// Underlying protocol error
		#[source]
		source: ldap3::LdapError,
	},
	/// A single attribute write failed.
	#[error("Modifying {attribute} on {dn} failed: {source}")]
	Modify {
		/// Entry that was written
		dn: String,
		/// Attribute that was replaced
		attribute: String,
		/// Underlying protocol error
		#[source]
		source: ldap3::LdapError,
	},
	/// The password policy cannot produce a value that satisfies itself.
	#[error("Password policy unsatisfiable: {0}")]
	PolicyUnsatisfiable(String),
	/// A required attribute in a search result was missing.
	#[error("Missing attribute {0}")]
	Missing(String),
	/// The contents of an attribute or setting did not conform to the expected
	/// syntax.
	#[error("Malformed data: {0}")]
	Invalid(String),
	/// Reading a log source or certificate failed.
	#[error(transparent)]
	Io(#[from] std::io::Error),
	/// The configuration file could not be parsed.
	#[error(transparent)]
	Config(#[from] serde_yaml::Error),
	/// An underlying protocol error or similar occurred, or the LDAP library
	/// was used incorrectly.
	#[error(transparent)]
	Ldap(#[from] ldap3::LdapError),
}
