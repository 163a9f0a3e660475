//! Directory sessions used for discovery and credential writes.
//!
//! The engine only talks to servers through [`Directory`] and [`Connector`],
//! so every decision it makes can be exercised against an in-memory server.
//! [`LdapConnector`] is the implementation backed by `ldap3`.

use std::{collections::HashSet, time::Duration};

use async_trait::async_trait;
use ldap3::{
	adapters::{Adapter, EntriesOnly, PagedResults},
	LdapConnAsync, LdapError, LdapResult, Mod, Scope, SearchEntry,
};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use crate::{config::Config, error::Error};

/// One established and bound session with a directory server.
///
/// A session has one operation in flight at a time, which `&mut self`
/// enforces.
#[async_trait]
pub trait Directory: Send {
	/// Host name of the server this session talks to.
	fn host(&self) -> &str;

	/// Subtree search below `base`, returning every matching entry in the
	/// order the server produced them.
	async fn search(
		&mut self,
		base: &str,
		filter: &str,
		attributes: &[String],
	) -> Result<Vec<SearchEntry>, Error>;

	/// Replace all values of `attribute` on `dn` with `value`.
	async fn modify(&mut self, dn: &str, attribute: &str, value: &str) -> Result<(), Error>;

	/// Unbind and release the session.
	async fn close(&mut self) -> Result<(), Error>;
}

/// Opens sessions against the supplier and against individual consumers.
#[async_trait]
pub trait Connector: Send + Sync {
	/// Session type produced by this connector
	type Session: Directory;

	/// Open and bind a session with the configured supplier.
	async fn connect_supplier(&self) -> Result<Self::Session, Error>;

	/// Open and bind a session with a consumer, on `port` if the agreement
	/// names one.
	async fn connect(&self, host: &str, port: Option<u16>) -> Result<Self::Session, Error>;
}

/// [`Connector`] for real servers.
#[derive(Debug, Clone)]
pub struct LdapConnector {
	/// Connection, bind and search settings
	config: Config,
}

impl LdapConnector {
	/// Create a connector using the url, bind identity and TLS settings of
	/// `config`.
	#[must_use]
	pub fn new(config: Config) -> Self {
		Self { config }
	}

	/// Create a connection to an ldap server and bind as the administrative
	/// identity.
	async fn open(&self, url: &Url) -> Result<LdapSession, Error> {
		let host = url.host_str().unwrap_or_default().to_owned();
		let settings = self.config.connection.to_settings().await?;
		let (conn, mut ldap) = LdapConnAsync::from_url_with_settings(settings, url)
			.await
			.map_err(|source| Error::Connection { host: host.clone(), source })?;
		let driver = tokio::spawn(async move {
			if let Err(err) = conn.drive().await {
				warn!("Ldap connection error {err}");
			}
		});

		let bound = ldap
			.with_timeout(self.config.connection.operation_timeout)
			.simple_bind(&self.config.bind_dn, &self.config.bind_password)
			.await
			.and_then(LdapResult::success);
		if let Err(source) = bound {
			driver.abort();
			return Err(Error::Connection { host, source });
		}
		debug!("Bound to {host} as {}", self.config.bind_dn);

		Ok(LdapSession {
			host,
			ldap,
			driver: Some(driver),
			page_size: self.config.searches.page_size,
			operation_timeout: self.config.connection.operation_timeout,
		})
	}
}

#[async_trait]
impl Connector for LdapConnector {
	type Session = LdapSession;

	async fn connect_supplier(&self) -> Result<LdapSession, Error> {
		self.open(&self.config.url).await
	}

	async fn connect(&self, host: &str, port: Option<u16>) -> Result<LdapSession, Error> {
		let url = self.config.consumer_url(host, port)?;
		self.open(&url).await
	}
}

/// A bound `ldap3` session.
#[derive(Debug)]
pub struct LdapSession {
	/// Host the session is connected to
	host: String,
	/// Handle used to issue operations
	ldap: ldap3::Ldap,
	/// Background task driving the connection, taken on close
	driver: Option<JoinHandle<()>>,
	/// Page size for the simple paged results control
	page_size: Option<i32>,
	/// Timeout applied to each operation
	operation_timeout: Duration,
}

#[async_trait]
impl Directory for LdapSession {
	fn host(&self) -> &str {
		&self.host
	}

	async fn search(
		&mut self,
		base: &str,
		filter: &str,
		attributes: &[String],
	) -> Result<Vec<SearchEntry>, Error> {
		let query = |source: LdapError| Error::Query { base: base.to_owned(), source };

		let mut adapters: Vec<Box<dyn Adapter<_, _>>> = vec![Box::new(EntriesOnly::new())];
		if let Some(page_size) = self.page_size {
			adapters.push(Box::new(PagedResults::new(page_size)));
		}

		let mut search = self
			.ldap
			.with_timeout(self.operation_timeout)
			.streaming_search_with(adapters, base, Scope::Subtree, filter, attributes.to_vec())
			.await
			.map_err(query)?;

		let mut entries = Vec::new();
		while let Some(entry) = search.next().await.map_err(query)? {
			entries.push(SearchEntry::construct(entry));
		}
		search.finish().await.success().map_err(query)?;

		Ok(entries)
	}

	async fn modify(&mut self, dn: &str, attribute: &str, value: &str) -> Result<(), Error> {
		self.ldap
			.with_timeout(self.operation_timeout)
			.modify(dn, vec![Mod::Replace(attribute, HashSet::from([value]))])
			.await
			.and_then(LdapResult::success)
			.map_err(|source| Error::Modify {
				dn: dn.to_owned(),
				attribute: attribute.to_owned(),
				source,
			})?;
		Ok(())
	}

	async fn close(&mut self) -> Result<(), Error> {
		let Some(driver) = self.driver.take() else {
			return Ok(());
		};
		let unbound = self.ldap.unbind().await;
		if let Err(err) = driver.await {
			warn!("Failed to join background task: {err}");
		}
		unbound?;
		Ok(())
	}
}
