//! Rotate the credentials of 389 Directory Server replication agreements.
//!
//! Every replication agreement binds two values that must match: the
//! credential stored on the agreement entry on the supplier
//! (`nsDS5ReplicaCredentials`), and the password of the account the supplier
//! binds as on the consumer. The two live on different servers, so rotating
//! them is an ordered two-step write: the supplier side first, the consumer
//! side only once that succeeded. If the second step fails the agreement is
//! reported as partial together with the `ldapmodify` command that finishes
//! the job by hand.
//!
//! A rotation cycle discovers the agreements below `cn=config`, resolves a new
//! credential for each from the [password policy](config::PasswordConfig)
//! (explicit value per agreement, then a default value, then a generated one),
//! applies the writes and returns a [`CycleReport`]. A
//! [`Monitor`] watches the server logs for authentication failures (`err=49`)
//! on replication agreements and turns them into rotation triggers.
//!
//! For a general primer on LDAP, the [introduction] in the `ldap3` crate which
//! is used here for interfacing with LDAP is an excellent resource.
//!
//! [introduction]: https://github.com/inejge/ldap3/blob/master/LDAP-primer.md
//!
//! # Getting started
//! A preview of a full rotation might look like so:
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use ldap_repl_rotator::{Config, CycleOutcome, ExecutionMode, LdapConnector, Rotator};
//!
//! let config = Config::load("config.yaml")?;
//! let rotator = Rotator::new(config.clone(), LdapConnector::new(config));
//!
//! match rotator.run_cycle(None, ExecutionMode::Preview).await? {
//!     CycleOutcome::NoAgreements => println!("Nothing to rotate, check the search base"),
//!     CycleOutcome::Completed(report) => println!("{:#?}", report.counts()),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Rotating automatically on authentication failures:
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use ldap_repl_rotator::{Config, ExecutionMode, LdapConnector, Monitor, Rotator};
//!
//! let config = Config::load("config.yaml")?;
//! let (monitor, events) = Monitor::new(config.monitor.clone(), None);
//! let cancel = monitor.cancellation_token();
//! let rotator = Rotator::new(config.clone(), LdapConnector::new(config));
//! let (results, mut received) = tokio::sync::mpsc::channel(16);
//!
//! tokio::spawn(async move { monitor.run().await });
//! tokio::spawn(async move {
//!     rotator.serve_triggers(events, results, ExecutionMode::Execute, cancel).await;
//! });
//! while let Some(rotation) = received.recv().await {
//!     println!("{}: {:?}", rotation.event.agreement, rotation.outcome);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Limitations
//! * Agreements are rotated one at a time.
//! * A rotated log that has grown past the previously read position before the
//!   next poll is not recognized as rotated.
//! * A monitor without saved offsets reports every failure already in its
//!   logs, unless `monitor.start_at_end` is set.
//! * [secrecy](https://docs.rs/secrecy) is not used for storing credentials.

pub mod agreement;
pub mod config;
pub mod credential;
pub mod directory;
pub mod entry;
pub mod error;
pub mod monitor;
mod offsets;
pub mod rotation;
pub mod update;

pub use ldap3::{self, SearchEntry};

pub use crate::{
	agreement::{Catalog, ConsumerKey, ReplicationAgreement},
	config::{Config, ConnectionConfig, MonitorConfig, PasswordConfig},
	credential::{CredentialAssignment, Resolution, Resolver},
	directory::{Connector, Directory, LdapConnector},
	entry::SearchEntryExt,
	error::Error,
	monitor::{AuthFailureEvent, Monitor, MonitorState},
	offsets::Offsets,
	rotation::{AgreementStatus, CycleOutcome, CycleReport, Rotator},
	update::{ExecutionMode, Side, UpdateOutcome, Updater, WriteStatus, WriteTarget},
};
