//! Rotation cycles: discover, resolve, update, report.

use std::collections::HashSet;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
	agreement::{Catalog, ConsumerKey, ReplicationAgreement},
	config::Config,
	credential::{Resolution, Resolver},
	directory::{Connector, Directory},
	error::Error,
	monitor::AuthFailureEvent,
	update::{AgreementUpdate, ExecutionMode, Updater, WriteStatus},
};

/// Final state of one agreement after a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgreementStatus {
	/// Both sides carry the new credential (or would, in preview mode)
	Succeeded,
	/// The supplier carries the new credential but the consumer does not.
	/// Needs manual reconciliation with the contained command.
	Partial {
		/// `ldapmodify` invocation completing the consumer side
		reconcile: String,
	},
	/// The supplier write failed; nothing changed
	Failed,
	/// No credential could be determined; nothing was attempted
	Unresolved {
		/// Why resolution failed
		reason: String,
	},
}

/// What happened to one agreement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgreementReport {
	/// The agreement as discovered
	pub agreement: ReplicationAgreement,
	/// Classification of the outcome
	pub status: AgreementStatus,
	/// Per side outcomes, absent if the credential was unresolved
	pub update: Option<AgreementUpdate>,
}

/// Number of agreements per [`AgreementStatus`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleCounts {
	/// Both sides succeeded
	pub succeeded: usize,
	/// Supplier succeeded, consumer failed
	pub partial: usize,
	/// Supplier failed
	pub failed: usize,
	/// No credential
	pub unresolved: usize,
}

/// Everything a cycle did, in agreement order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
	/// Whether writes were performed
	pub mode: ExecutionMode,
	/// One entry per agreement
	pub agreements: Vec<AgreementReport>,
}

impl CycleReport {
	/// Tally the agreements by status.
	#[must_use]
	pub fn counts(&self) -> CycleCounts {
		let mut counts = CycleCounts::default();
		for report in &self.agreements {
			match report.status {
				AgreementStatus::Succeeded => counts.succeeded += 1,
				AgreementStatus::Partial { .. } => counts.partial += 1,
				AgreementStatus::Failed => counts.failed += 1,
				AgreementStatus::Unresolved { .. } => counts.unresolved += 1,
			}
		}
		counts
	}

	/// Every agreement succeeded on both sides.
	#[must_use]
	pub fn is_success(&self) -> bool {
		self.agreements.iter().all(|report| report.status == AgreementStatus::Succeeded)
	}

	/// Report entry of the named agreement.
	#[must_use]
	pub fn get(&self, agreement: &str) -> Option<&AgreementReport> {
		self.agreements.iter().find(|report| report.agreement.name == agreement)
	}
}

/// Result of a cycle that reached the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
	/// Discovery found nothing to rotate. Distinct from a completed cycle so a
	/// wrong search base does not look like success.
	NoAgreements,
	/// Agreements were processed
	Completed(CycleReport),
}

/// A rotation started by a detected authentication failure.
#[derive(Debug)]
pub struct TriggeredRotation {
	/// The failure that caused the rotation
	pub event: AuthFailureEvent,
	/// Outcome of rotating the named agreement
	pub outcome: Result<CycleOutcome, Error>,
}

/// Which agreements a cycle covers.
#[derive(Debug)]
enum Selection<'a> {
	/// Everything discovery finds
	All,
	/// Only the discovered agreement with this name
	Named(&'a str),
	/// Exactly these, without discovery
	Given(Vec<ReplicationAgreement>),
}

/// Drives rotation cycles against the servers reached through a
/// [`Connector`].
#[derive(Debug)]
pub struct Rotator<C> {
	/// Engine configuration
	config: Config,
	/// Opens supplier and consumer sessions
	connector: C,
}

impl<C: Connector> Rotator<C> {
	/// Create a rotator.
	#[must_use]
	pub fn new(config: Config, connector: C) -> Self {
		Self { config, connector }
	}

	/// The configuration in use.
	#[must_use]
	pub fn config(&self) -> &Config {
		&self.config
	}

	/// Rotate `agreements`, or everything discovery finds if `None`.
	///
	/// Fails only if the supplier cannot be reached or discovery fails. Per
	/// agreement problems are reported in the [`CycleReport`] and never stop
	/// the remaining agreements.
	///
	/// Agreements sharing a consumer account get one credential. Given
	/// `agreements` should therefore include every agreement of a shared
	/// account, otherwise the ones left out stop matching.
	pub async fn run_cycle(
		&self,
		agreements: Option<Vec<ReplicationAgreement>>,
		mode: ExecutionMode,
	) -> Result<CycleOutcome, Error> {
		let selection = agreements.map_or(Selection::All, Selection::Given);
		self.cycle(selection, mode).await
	}

	/// Rotate the discovered agreement called `name`, together with every
	/// agreement writing the same consumer account. Yields
	/// [`CycleOutcome::NoAgreements`] if there is none.
	pub async fn rotate_agreement(
		&self,
		name: &str,
		mode: ExecutionMode,
	) -> Result<CycleOutcome, Error> {
		self.cycle(Selection::Named(name), mode).await
	}

	/// Rotate the agreement named by each received event until the channel
	/// closes or `cancel` fires, forwarding each outcome to `results`.
	pub async fn serve_triggers(
		&self,
		mut events: mpsc::Receiver<AuthFailureEvent>,
		results: mpsc::Sender<TriggeredRotation>,
		mode: ExecutionMode,
		cancel: CancellationToken,
	) {
		loop {
			let event = tokio::select! {
				() = cancel.cancelled() => break,
				event = events.recv() => match event {
					Some(event) => event,
					None => break,
				},
			};
			info!(
				"Authentication failure for agreement '{}' at {}, rotating",
				event.agreement, event.timestamp
			);
			let outcome = self.rotate_agreement(&event.agreement, mode).await;
			if let Err(err) = &outcome {
				error!("Triggered rotation of '{}' failed: {err}", event.agreement);
			}
			if results.send(TriggeredRotation { event, outcome }).await.is_err() {
				warn!("Nobody is listening for rotation results, stopping");
				break;
			}
		}
	}

	/// Hold a supplier session for the length of one cycle and release it on
	/// every exit path.
	async fn cycle(
		&self,
		selection: Selection<'_>,
		mode: ExecutionMode,
	) -> Result<CycleOutcome, Error> {
		info!("Starting rotation cycle in {mode:?} mode");
		let mut session = self.connector.connect_supplier().await.map_err(|err| {
			error!("Rotation cycle aborted: {err}");
			err
		})?;

		let outcome = self.cycle_with(&mut session, selection, mode).await;

		if let Err(err) = session.close().await {
			warn!("Closing session with {} failed: {err}", session.host());
		}
		match &outcome {
			Ok(CycleOutcome::NoAgreements) => info!("No replication agreements to rotate"),
			Ok(CycleOutcome::Completed(report)) => {
				let counts = report.counts();
				info!(
					succeeded = counts.succeeded,
					partial = counts.partial,
					failed = counts.failed,
					unresolved = counts.unresolved,
					"Rotation cycle finished"
				);
			}
			Err(err) => error!("Rotation cycle aborted: {err}"),
		}
		outcome
	}

	/// Read the current agreements through the supplier session.
	async fn discover(&self, session: &mut C::Session) -> Result<Vec<ReplicationAgreement>, Error> {
		Catalog::new(session, &self.config.searches, &self.config.attributes).discover().await
	}

	/// Discover, resolve and update through an open supplier session.
	async fn cycle_with(
		&self,
		session: &mut C::Session,
		selection: Selection<'_>,
		mode: ExecutionMode,
	) -> Result<CycleOutcome, Error> {
		let agreements = match selection {
			Selection::Given(agreements) => agreements,
			Selection::All => self.discover(session).await?,
			Selection::Named(name) => {
				let discovered = self.discover(session).await?;
				let Some(key) = discovered
					.iter()
					.find(|agreement| agreement.name == name)
					.map(ReplicationAgreement::consumer_key)
				else {
					warn!("No replication agreement named '{name}'");
					return Ok(CycleOutcome::NoAgreements);
				};
				let sharing: Vec<_> = discovered
					.into_iter()
					.filter(|agreement| agreement.consumer_key() == key)
					.collect();
				if sharing.len() > 1 {
					info!(
						"Agreement '{name}' shares the consumer account on {} with {} other \
						 agreements, rotating them together",
						key.host,
						sharing.len() - 1
					);
				}
				sharing
			}
		};
		if agreements.is_empty() {
			return Ok(CycleOutcome::NoAgreements);
		}

		let assignment = Resolver::new(&self.config.password).resolve(&agreements);
		let mut updater = Updater::new(&self.connector, session, &self.config);
		let mut reports = Vec::with_capacity(agreements.len());

		for agreement in agreements {
			if !agreement.enabled {
				info!("Agreement {} is disabled, rotating it anyway", agreement.name);
			}
			let credential = match assignment.get(&agreement.name) {
				Some(Resolution::Resolved { value, .. }) => value,
				Some(Resolution::Unresolved { reason }) => {
					warn!("Skipping agreement {}: {reason}", agreement.name);
					reports.push(AgreementReport {
						status: AgreementStatus::Unresolved { reason: reason.clone() },
						agreement,
						update: None,
					});
					continue;
				}
				None => {
					reports.push(AgreementReport {
						status: AgreementStatus::Unresolved {
							reason: "agreement missing from credential assignment".to_owned(),
						},
						agreement,
						update: None,
					});
					continue;
				}
			};

			let update = updater.apply(&agreement, credential, mode).await;
			let status = if update.succeeded() {
				AgreementStatus::Succeeded
			} else if update.is_partial() {
				AgreementStatus::Partial {
					reconcile: update.consumer.target.manual_command(&self.config),
				}
			} else {
				AgreementStatus::Failed
			};
			reports.push(AgreementReport { agreement, status, update: Some(update) });
		}

		warn_stale_siblings(&reports);
		Ok(CycleOutcome::Completed(CycleReport { mode, agreements: reports }))
	}
}

/// A failed agreement whose consumer account was rewritten for a sibling
/// agreement no longer matches its consumer.
fn warn_stale_siblings(reports: &[AgreementReport]) {
	let rewritten: HashSet<ConsumerKey> = reports
		.iter()
		.filter(|report| {
			report.update.as_ref().is_some_and(|update| update.consumer.status == WriteStatus::Written)
		})
		.map(|report| report.agreement.consumer_key())
		.collect();
	for report in reports {
		if report.status == AgreementStatus::Failed
			&& rewritten.contains(&report.agreement.consumer_key())
		{
			warn!(
				"Agreement {} kept its old credential but the consumer account on {} was rotated \
				 for another agreement, rotate {} again",
				report.agreement.name, report.agreement.consumer, report.agreement.name
			);
		}
	}
}
