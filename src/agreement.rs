//! Discovery of replication agreements.

use ldap3::SearchEntry;
use tracing::{info, warn};

use crate::{
	config::{AttributeConfig, Searches},
	directory::Directory,
	entry::SearchEntryExt,
	error::Error,
};

/// One directional supplier to consumer replication link.
///
/// Built from live directory state on every discovery and never modified
/// afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationAgreement {
	/// Common name of the agreement entry
	pub name: String,
	/// Host of the session the agreement was discovered through
	pub supplier: String,
	/// Host of the consumer the agreement replicates to
	pub consumer: String,
	/// Port of the consumer, if the agreement records one
	pub consumer_port: Option<u16>,
	/// Identity the supplier binds as on the consumer
	pub bind_dn: String,
	/// DN of the agreement entry
	pub dn: String,
	/// Whether replication over this agreement is turned on
	pub enabled: bool,
}

/// The consumer server an agreement's consumer write lands on. Every
/// agreement writes the same replication manager account on its consumer, so
/// agreements with equal keys must carry equal credentials.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsumerKey {
	/// Consumer host, lowercased
	pub host: String,
	/// Consumer port, if the agreement records one
	pub port: Option<u16>,
}

impl ReplicationAgreement {
	/// The consumer account this agreement's consumer write targets.
	#[must_use]
	pub fn consumer_key(&self) -> ConsumerKey {
		ConsumerKey { host: self.consumer.to_ascii_lowercase(), port: self.consumer_port }
	}

	/// Converts a [`SearchEntry`] to a [`ReplicationAgreement`] using the
	/// attribute names in the given configuration.
	///
	/// Agreements carry no supplier address, so the host of the discovering
	/// session is used. A missing enabled flag means enabled: 389 agreements
	/// replicate unless explicitly turned off.
	pub fn from_search(
		entry: &SearchEntry,
		supplier: &str,
		attributes: &AttributeConfig,
	) -> Result<Self, Error> {
		let required = |attr: &str| {
			entry.attr_first(attr).map(str::to_owned).ok_or_else(|| Error::Missing(attr.to_owned()))
		};

		Ok(Self {
			name: required(&attributes.name)?,
			supplier: supplier.to_owned(),
			consumer: required(&attributes.consumer_host)?,
			consumer_port: entry.port_first(&attributes.consumer_port).transpose()?,
			bind_dn: required(&attributes.bind_identity)?,
			dn: entry.dn.clone(),
			enabled: entry.flag_first(&attributes.enabled).unwrap_or(true),
		})
	}
}

/// Reads replication agreements through a borrowed supplier session.
#[derive(Debug)]
pub struct Catalog<'a, D> {
	/// Session with the supplier
	session: &'a mut D,
	/// Where to search
	searches: &'a Searches,
	/// What to read
	attributes: &'a AttributeConfig,
}

impl<'a, D: Directory> Catalog<'a, D> {
	/// Create a catalog reading through `session`.
	pub fn new(session: &'a mut D, searches: &'a Searches, attributes: &'a AttributeConfig) -> Self {
		Self { session, searches, attributes }
	}

	/// Find every replication agreement below the configured base, in server
	/// order.
	///
	/// Entries that lack a name, consumer host or bind identity cannot be
	/// rotated and are skipped with a warning. An empty result is not an
	/// error.
	pub async fn discover(&mut self) -> Result<Vec<ReplicationAgreement>, Error> {
		let entries = self
			.session
			.search(
				&self.searches.agreement_base,
				&self.searches.agreement_filter,
				&self.attributes.get_attr_filter(),
			)
			.await?;

		let supplier = self.session.host().to_owned();
		let mut agreements = Vec::with_capacity(entries.len());
		for entry in &entries {
			match ReplicationAgreement::from_search(entry, &supplier, self.attributes) {
				Ok(agreement) => {
					info!(
						"Found agreement {}: {} -> {}",
						agreement.name, agreement.supplier, agreement.consumer
					);
					agreements.push(agreement);
				}
				Err(err) => warn!("Skipping agreement entry {}: {err}", entry.dn),
			}
		}
		info!("Found {} replication agreements", agreements.len());

		Ok(agreements)
	}
}
