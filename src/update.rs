//! Ordered supplier then consumer credential writes for one agreement.
//!
//! The supplier side (the credential stored on the agreement entry) is always
//! written first. Only if that succeeds is the consumer side (the password of
//! the account the supplier binds as) written. A failed consumer write after a
//! successful supplier write leaves the agreement knowingly inconsistent and is
//! reported as such, never retried here.

use std::fmt;

use tracing::{info, warn};

use crate::{
	agreement::ReplicationAgreement,
	config::Config,
	directory::{Connector, Directory},
	error::Error,
};

/// Whether writes are performed or only described.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
	/// Perform every write
	Execute,
	/// Run the same decisions but replace each write with a log record
	Preview,
}

/// Which end of an agreement a write targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
	/// The agreement entry on the supplier
	Supplier,
	/// The replication manager account on the consumer
	Consumer,
}

impl fmt::Display for Side {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::Supplier => "supplier",
			Self::Consumer => "consumer",
		})
	}
}

/// A single attribute replacement on one server.
#[derive(Clone, PartialEq, Eq)]
pub struct WriteTarget {
	/// Side of the agreement
	pub side: Side,
	/// Server to write to
	pub host: String,
	/// Port to write to, if it differs from the configured one
	pub port: Option<u16>,
	/// Entry to modify
	pub dn: String,
	/// Attribute to replace
	pub attribute: String,
	/// New value
	pub value: String,
}

impl WriteTarget {
	/// Where the credential for `side` of `agreement` lives. Depends only on
	/// the agreement, the side and the configuration, and is the one place
	/// execute mode, preview mode and manual commands get their targets from.
	#[must_use]
	pub fn derive(
		agreement: &ReplicationAgreement,
		side: Side,
		credential: &str,
		config: &Config,
	) -> Self {
		match side {
			Side::Supplier => Self {
				side,
				host: agreement.supplier.clone(),
				port: None,
				dn: agreement.dn.clone(),
				attribute: config.attributes.credentials.clone(),
				value: credential.to_owned(),
			},
			Side::Consumer => Self {
				side,
				host: agreement.consumer.clone(),
				port: agreement.consumer_port,
				dn: config.consumer.replication_manager_dn.clone(),
				attribute: config.consumer.password_attribute.clone(),
				value: credential.to_owned(),
			},
		}
	}

	/// The write as an LDIF modify record.
	#[must_use]
	pub fn to_ldif(&self) -> String {
		format!(
			"dn: {}\nchangetype: modify\nreplace: {}\n{}: {}\n",
			self.dn, self.attribute, self.attribute, self.value
		)
	}

	/// An `ldapmodify` invocation performing the write by hand.
	#[must_use]
	pub fn manual_command(&self, config: &Config) -> String {
		let port = self.port.or_else(|| config.url.port()).map(|port| format!(":{port}"));
		format!(
			"ldapmodify -x -D \"{}\" -W -H {}://{}{} << EOF\n{}EOF",
			config.bind_dn,
			config.url.scheme(),
			self.host,
			port.unwrap_or_default(),
			self.to_ldif()
		)
	}
}

impl fmt::Debug for WriteTarget {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("WriteTarget")
			.field("side", &self.side)
			.field("host", &self.host)
			.field("port", &self.port)
			.field("dn", &self.dn)
			.field("attribute", &self.attribute)
			.field("value", &"<redacted>")
			.finish()
	}
}

/// What happened to one write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteStatus {
	/// The server accepted the write
	Written,
	/// Preview mode, the write was only described
	Previewed,
	/// The write was attempted and failed
	Failed {
		/// Error reported for the write
		error: String,
	},
	/// The write was not attempted because an earlier step failed
	Skipped {
		/// The earlier failure
		cause: String,
	},
}

/// Result of one side of one agreement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOutcome {
	/// Agreement name
	pub agreement: String,
	/// Side that was written
	pub side: Side,
	/// What was (or would have been) written
	pub target: WriteTarget,
	/// How it went
	pub status: WriteStatus,
}

impl UpdateOutcome {
	/// Whether the write took effect, or would have in preview mode.
	#[must_use]
	pub fn succeeded(&self) -> bool {
		matches!(self.status, WriteStatus::Written | WriteStatus::Previewed)
	}

	/// Whether a write was sent to the server.
	#[must_use]
	pub fn attempted(&self) -> bool {
		matches!(self.status, WriteStatus::Written | WriteStatus::Failed { .. })
	}

	/// The failure, or the failure that caused this side to be skipped.
	#[must_use]
	pub fn error(&self) -> Option<&str> {
		match &self.status {
			WriteStatus::Failed { error } => Some(error),
			WriteStatus::Skipped { cause } => Some(cause),
			WriteStatus::Written | WriteStatus::Previewed => None,
		}
	}
}

/// Both outcomes of one agreement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgreementUpdate {
	/// The agreement entry write
	pub supplier: UpdateOutcome,
	/// The replication manager account write
	pub consumer: UpdateOutcome,
}

impl AgreementUpdate {
	/// Both sides succeeded.
	#[must_use]
	pub fn succeeded(&self) -> bool {
		self.supplier.succeeded() && self.consumer.succeeded()
	}

	/// The supplier now sends a credential the consumer does not accept.
	#[must_use]
	pub fn is_partial(&self) -> bool {
		self.supplier.succeeded() && !self.consumer.succeeded()
	}
}

/// Applies credential writes for agreements, borrowing the supplier session
/// and opening a short-lived session per consumer.
pub struct Updater<'a, C: Connector> {
	/// Opens consumer sessions
	connector: &'a C,
	/// Session with the supplier
	supplier: &'a mut C::Session,
	/// Attribute names and account locations
	config: &'a Config,
}

impl<C: Connector> fmt::Debug for Updater<'_, C> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Updater").field("supplier", &self.supplier.host()).finish_non_exhaustive()
	}
}

impl<'a, C: Connector> Updater<'a, C> {
	/// Create an updater writing supplier entries through `supplier`.
	pub fn new(connector: &'a C, supplier: &'a mut C::Session, config: &'a Config) -> Self {
		Self { connector, supplier, config }
	}

	/// Rotate `agreement` to `credential`, supplier side first. If the supplier
	/// write fails the consumer write is skipped.
	pub async fn apply(
		&mut self,
		agreement: &ReplicationAgreement,
		credential: &str,
		mode: ExecutionMode,
	) -> AgreementUpdate {
		let supplier_target =
			WriteTarget::derive(agreement, Side::Supplier, credential, self.config);
		let consumer_target =
			WriteTarget::derive(agreement, Side::Consumer, credential, self.config);

		let supplier = self.write(&supplier_target, mode).await;
		let consumer = if let WriteStatus::Failed { error } = &supplier {
			warn!(
				"Supplier update for {} failed, not touching consumer {}",
				agreement.name, agreement.consumer
			);
			WriteStatus::Skipped { cause: error.clone() }
		} else {
			self.write(&consumer_target, mode).await
		};

		let update = AgreementUpdate {
			supplier: UpdateOutcome {
				agreement: agreement.name.clone(),
				side: Side::Supplier,
				target: supplier_target,
				status: supplier,
			},
			consumer: UpdateOutcome {
				agreement: agreement.name.clone(),
				side: Side::Consumer,
				target: consumer_target,
				status: consumer,
			},
		};

		if update.is_partial() {
			warn!(
				"Agreement {} is inconsistent: supplier {} has the new credential, consumer {} does not; \
				 reconcile {} on {} manually",
				agreement.name,
				agreement.supplier,
				agreement.consumer,
				update.consumer.target.dn,
				agreement.consumer,
			);
		}
		update
	}

	/// Perform or describe one write.
	async fn write(&mut self, target: &WriteTarget, mode: ExecutionMode) -> WriteStatus {
		match mode {
			ExecutionMode::Preview => {
				info!(
					"Would replace {} on {} at {} ({} side)",
					target.attribute, target.dn, target.host, target.side
				);
				WriteStatus::Previewed
			}
			ExecutionMode::Execute => match self.execute(target).await {
				Ok(()) => {
					info!("Updated {} on {} at {}", target.attribute, target.dn, target.host);
					WriteStatus::Written
				}
				Err(err) => {
					warn!("Updating {} side at {} failed: {err}", target.side, target.host);
					WriteStatus::Failed { error: err.to_string() }
				}
			},
		}
	}

	/// Send one write to the server owning it.
	async fn execute(&mut self, target: &WriteTarget) -> Result<(), Error> {
		match target.side {
			Side::Supplier => {
				self.supplier.modify(&target.dn, &target.attribute, &target.value).await
			}
			Side::Consumer => {
				let mut session = self.connector.connect(&target.host, target.port).await?;
				let written = session.modify(&target.dn, &target.attribute, &target.value).await;
				if let Err(err) = session.close().await {
					warn!("Closing session with {} failed: {err}", target.host);
				}
				written
			}
		}
	}
}
