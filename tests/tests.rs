#![allow(
	clippy::dbg_macro,
	clippy::expect_used,
	clippy::missing_docs_in_private_items,
	clippy::print_stderr,
	clippy::print_stdout,
	clippy::unwrap_used,
	clippy::bool_assert_comparison
)]
use std::{error::Error, path::PathBuf, time::Duration};

use ldap_repl_rotator::{
	config::Config,
	monitor::Severity,
	rotation::TriggeredRotation,
	AgreementStatus, AuthFailureEvent, CycleOutcome, CycleReport, ExecutionMode, LdapConnector,
	Rotator, Side, WriteStatus,
};
use serial_test::serial;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

mod common;

use common::{agreement_dn, agreement_entry, config, FakeConnector, Op, REPLICATION_MANAGER, SUPPLIER};

/// Explicit credential for agreement-A only, default "D", no generation.
const PASSWORDS: &str = "
password:
  predefined_passwords:
    agreement-A: explicit-A
  default_password: D
  generate_random: false
";

fn two_agreements() -> FakeConnector {
	FakeConnector::new(vec![agreement_entry("agreement-A", "c1"), agreement_entry("agreement-B", "c2")])
}

fn completed(outcome: CycleOutcome) -> CycleReport {
	match outcome {
		CycleOutcome::Completed(report) => report,
		CycleOutcome::NoAgreements => panic!("expected a completed cycle"),
	}
}

#[tokio::test]
async fn rotates_both_sides_in_order() -> Result<(), Box<dyn Error>> {
	let _ = tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::default().add_directive(LevelFilter::DEBUG.into()))
		.try_init();

	let connector = two_agreements();
	let rotator = Rotator::new(config(PASSWORDS), connector.clone());

	let report = completed(rotator.run_cycle(None, ExecutionMode::Execute).await?);

	assert!(report.is_success());
	assert_eq!(report.counts().succeeded, 2);
	let outcomes: Vec<_> = report
		.agreements
		.iter()
		.filter_map(|agreement| agreement.update.as_ref())
		.flat_map(|update| [&update.supplier, &update.consumer])
		.collect();
	assert_eq!(outcomes.len(), 4);
	assert!(outcomes.iter().all(|outcome| outcome.status == WriteStatus::Written));

	assert_eq!(
		connector.modifies(),
		vec![
			Op::Modify {
				host: SUPPLIER.to_owned(),
				dn: agreement_dn("agreement-A"),
				attribute: "nsDS5ReplicaCredentials".to_owned(),
				value: "explicit-A".to_owned(),
			},
			Op::Modify {
				host: "c1".to_owned(),
				dn: REPLICATION_MANAGER.to_owned(),
				attribute: "userPassword".to_owned(),
				value: "explicit-A".to_owned(),
			},
			Op::Modify {
				host: SUPPLIER.to_owned(),
				dn: agreement_dn("agreement-B"),
				attribute: "nsDS5ReplicaCredentials".to_owned(),
				value: "D".to_owned(),
			},
			Op::Modify {
				host: "c2".to_owned(),
				dn: REPLICATION_MANAGER.to_owned(),
				attribute: "userPassword".to_owned(),
				value: "D".to_owned(),
			},
		]
	);

	// Every session that was opened was closed again
	let ops = connector.ops();
	let connects = ops.iter().filter(|op| matches!(op, Op::Connect { .. })).count();
	let closes = ops.iter().filter(|op| matches!(op, Op::Close { .. })).count();
	assert_eq!(connects, 3);
	assert_eq!(connects, closes);
	assert_eq!(ops.last(), Some(&Op::Close { host: SUPPLIER.to_owned() }));

	Ok(())
}

#[tokio::test]
async fn supplier_failure_skips_consumer() -> Result<(), Box<dyn Error>> {
	let connector = two_agreements();
	connector.fail_write(SUPPLIER, &agreement_dn("agreement-A"));
	let rotator = Rotator::new(config(PASSWORDS), connector.clone());

	let report = completed(rotator.run_cycle(None, ExecutionMode::Execute).await?);

	let a = report.get("agreement-A").unwrap();
	assert_eq!(a.status, AgreementStatus::Failed);
	let update = a.update.as_ref().unwrap();
	assert!(matches!(update.supplier.status, WriteStatus::Failed { .. }));
	assert!(matches!(update.consumer.status, WriteStatus::Skipped { .. }));
	assert!(!update.consumer.attempted());
	assert_eq!(update.consumer.error(), update.supplier.error(), "Supplier failure is the cause");

	assert!(
		!connector.ops().iter().any(|op| matches!(op, Op::Connect { host } if host == "c1")),
		"Consumer of agreement-A must not be contacted"
	);
	assert_eq!(report.get("agreement-B").unwrap().status, AgreementStatus::Succeeded);
	assert_eq!(report.counts().failed, 1);
	assert_eq!(report.counts().succeeded, 1);
	assert!(!report.is_success());

	Ok(())
}

#[tokio::test]
async fn consumer_failure_is_partial() -> Result<(), Box<dyn Error>> {
	let connector = two_agreements();
	connector.fail_write("c1", REPLICATION_MANAGER);
	connector.unreachable("c2");
	let rotator = Rotator::new(config(PASSWORDS), connector.clone());

	let report = completed(rotator.run_cycle(None, ExecutionMode::Execute).await?);

	assert_eq!(report.counts().partial, 2);
	let AgreementStatus::Partial { reconcile } = &report.get("agreement-A").unwrap().status else {
		panic!("agreement-A should be partial");
	};
	assert!(reconcile.contains("-H ldap://c1:389"));
	assert!(reconcile.contains("dn: cn=replication manager,cn=config\nchangetype: modify"));
	assert!(reconcile.contains("userPassword: explicit-A"));

	let b = report.get("agreement-B").unwrap().update.as_ref().unwrap();
	assert_eq!(b.supplier.status, WriteStatus::Written);
	assert!(b.consumer.error().unwrap().contains("c2"));

	// No automatic retry within the cycle
	let consumer_writes = connector
		.modifies()
		.into_iter()
		.filter(|op| matches!(op, Op::Modify { host, .. } if host == "c1"))
		.count();
	assert_eq!(consumer_writes, 1);

	Ok(())
}

#[tokio::test]
async fn preview_matches_execute() -> Result<(), Box<dyn Error>> {
	let preview_connector = two_agreements();
	let preview = Rotator::new(config(PASSWORDS), preview_connector.clone());
	let execute = Rotator::new(config(PASSWORDS), two_agreements());

	let previewed = completed(preview.run_cycle(None, ExecutionMode::Preview).await?);
	let executed = completed(execute.run_cycle(None, ExecutionMode::Execute).await?);

	assert!(preview_connector.modifies().is_empty(), "Preview must not write");
	assert_eq!(previewed.agreements.len(), executed.agreements.len());
	for (previewed, executed) in previewed.agreements.iter().zip(&executed.agreements) {
		let previewed = previewed.update.as_ref().unwrap();
		let executed = executed.update.as_ref().unwrap();
		assert_eq!(previewed.supplier.target, executed.supplier.target);
		assert_eq!(previewed.consumer.target, executed.consumer.target);
		assert_eq!(previewed.supplier.status, WriteStatus::Previewed);
		assert_eq!(previewed.consumer.status, WriteStatus::Previewed);
	}
	assert_eq!(previewed.mode, ExecutionMode::Preview);

	Ok(())
}

#[tokio::test]
async fn consumer_target_is_never_the_supplier() -> Result<(), Box<dyn Error>> {
	let connector = two_agreements();
	let rotator = Rotator::new(config(PASSWORDS), connector);

	let report = completed(rotator.run_cycle(None, ExecutionMode::Execute).await?);
	for agreement in &report.agreements {
		let update = agreement.update.as_ref().unwrap();
		assert_eq!(update.consumer.side, Side::Consumer);
		assert_eq!(update.consumer.target.host, agreement.agreement.consumer);
		assert_ne!(update.consumer.target.host, SUPPLIER);
		assert_eq!(update.consumer.target.dn, REPLICATION_MANAGER);
	}

	Ok(())
}

#[tokio::test]
async fn unresolved_agreement_is_skipped() -> Result<(), Box<dyn Error>> {
	let connector = two_agreements();
	let passwords = "
password:
  predefined_passwords:
    agreement-A: explicit-A
  generate_random: false
";
	let rotator = Rotator::new(config(passwords), connector.clone());

	let report = completed(rotator.run_cycle(None, ExecutionMode::Execute).await?);

	assert_eq!(report.get("agreement-A").unwrap().status, AgreementStatus::Succeeded);
	let b = report.get("agreement-B").unwrap();
	assert!(matches!(b.status, AgreementStatus::Unresolved { .. }));
	assert!(b.update.is_none());
	assert!(!connector.modifies().iter().any(
		|op| matches!(op, Op::Modify { dn, host, .. } if *dn == agreement_dn("agreement-B") || host == "c2")
	));
	assert_eq!(report.counts().unresolved, 1);

	Ok(())
}

#[tokio::test]
async fn generated_credential_is_shared_by_both_sides() -> Result<(), Box<dyn Error>> {
	let connector = FakeConnector::new(vec![agreement_entry("agreement-A", "c1")]);
	let rotator = Rotator::new(config(""), connector.clone());

	let report = completed(rotator.run_cycle(None, ExecutionMode::Execute).await?);
	let update = report.get("agreement-A").unwrap().update.as_ref().unwrap();

	assert_eq!(update.supplier.target.value, update.consumer.target.value);
	assert_eq!(update.supplier.target.value.len(), 16);

	Ok(())
}

fn shared_consumer() -> FakeConnector {
	FakeConnector::new(vec![agreement_entry("agreement-A", "c1"), agreement_entry("agreement-B", "c1")])
}

#[tokio::test]
async fn shared_consumer_account_keeps_both_agreements_matching() -> Result<(), Box<dyn Error>> {
	let connector = shared_consumer();
	let rotator = Rotator::new(config(""), connector.clone());

	let report = completed(rotator.run_cycle(None, ExecutionMode::Execute).await?);
	assert_eq!(report.counts().succeeded, 2);

	// The account on c1 ends up with the last value written to it
	let account = connector
		.modifies()
		.into_iter()
		.filter_map(|op| match op {
			Op::Modify { host, value, .. } if host == "c1" => Some(value),
			_ => None,
		})
		.last()
		.unwrap();
	for name in ["agreement-A", "agreement-B"] {
		let update = report.get(name).unwrap().update.as_ref().unwrap();
		assert_eq!(update.supplier.target.value, account, "{name} must match its consumer");
	}

	Ok(())
}

#[tokio::test]
async fn shared_consumer_account_conflicting_values() -> Result<(), Box<dyn Error>> {
	let connector = shared_consumer();
	let passwords = "
password:
  predefined_passwords:
    agreement-A: explicit-A
    agreement-B: explicit-B
";
	let rotator = Rotator::new(config(passwords), connector.clone());

	let report = completed(rotator.run_cycle(None, ExecutionMode::Execute).await?);
	assert_eq!(report.counts().unresolved, 2);
	assert!(connector.modifies().is_empty(), "Conflicting values must not be written");

	Ok(())
}

#[tokio::test]
async fn rotate_agreement_includes_shared_consumer() -> Result<(), Box<dyn Error>> {
	let connector = FakeConnector::new(vec![
		agreement_entry("agreement-A", "c1"),
		agreement_entry("agreement-B", "c1"),
		agreement_entry("agreement-C", "c2"),
	]);
	let rotator = Rotator::new(config(""), connector.clone());

	let report = completed(rotator.rotate_agreement("agreement-A", ExecutionMode::Execute).await?);
	let names: Vec<_> = report.agreements.iter().map(|report| report.agreement.name.as_str()).collect();
	assert_eq!(names, ["agreement-A", "agreement-B"]);
	assert!(report.is_success());
	assert!(!connector.modifies().iter().any(|op| matches!(op, Op::Modify { host, .. } if host == "c2")));

	Ok(())
}

#[tokio::test]
async fn empty_catalog_is_a_distinct_outcome() -> Result<(), Box<dyn Error>> {
	let connector = FakeConnector::new(Vec::new());
	let rotator = Rotator::new(config(PASSWORDS), connector.clone());

	assert_eq!(rotator.run_cycle(None, ExecutionMode::Execute).await?, CycleOutcome::NoAgreements);
	assert_eq!(
		rotator.run_cycle(Some(Vec::new()), ExecutionMode::Execute).await?,
		CycleOutcome::NoAgreements
	);
	assert!(connector.modifies().is_empty());

	Ok(())
}

#[tokio::test]
async fn fatal_errors_abort_the_cycle() -> Result<(), Box<dyn Error>> {
	let connector = two_agreements();
	connector.state.lock().unwrap().failing_search = true;
	let rotator = Rotator::new(config(PASSWORDS), connector.clone());

	let result = rotator.run_cycle(None, ExecutionMode::Execute).await;
	assert!(matches!(result, Err(ldap_repl_rotator::Error::Query { .. })));
	assert_eq!(
		connector.ops().last(),
		Some(&Op::Close { host: SUPPLIER.to_owned() }),
		"Session is released after a failed search"
	);
	assert!(connector.modifies().is_empty());

	let connector = two_agreements();
	connector.unreachable(SUPPLIER);
	let rotator = Rotator::new(config(PASSWORDS), connector.clone());
	let result = rotator.run_cycle(None, ExecutionMode::Execute).await;
	assert!(matches!(result, Err(ldap_repl_rotator::Error::Connection { .. })));
	assert!(connector.ops().is_empty());

	Ok(())
}

#[tokio::test]
async fn rotate_single_agreement() -> Result<(), Box<dyn Error>> {
	let connector = two_agreements();
	let rotator = Rotator::new(config(PASSWORDS), connector.clone());

	let report = completed(rotator.rotate_agreement("agreement-B", ExecutionMode::Execute).await?);
	assert_eq!(report.agreements.len(), 1);
	assert_eq!(report.agreements[0].agreement.name, "agreement-B");
	assert!(connector.modifies().iter().all(
		|op| matches!(op, Op::Modify { value, .. } if value == "D")
	));

	assert_eq!(
		rotator.rotate_agreement("agreement-Z", ExecutionMode::Execute).await?,
		CycleOutcome::NoAgreements
	);

	Ok(())
}

#[tokio::test]
async fn triggers_rotate_the_named_agreement() -> Result<(), Box<dyn Error>> {
	let connector = two_agreements();
	let rotator = Rotator::new(config(PASSWORDS), connector.clone());
	let (events, receiver) = tokio::sync::mpsc::channel(4);
	let (results, mut rotations) = tokio::sync::mpsc::channel::<TriggeredRotation>(4);
	let cancel = CancellationToken::new();

	let serving = tokio::spawn({
		let cancel = cancel.clone();
		async move { rotator.serve_triggers(receiver, results, ExecutionMode::Execute, cancel).await }
	});

	events
		.send(AuthFailureEvent {
			timestamp: OffsetDateTime::now_utc(),
			agreement: "agreement-A".to_owned(),
			line: "err=49 agreement: agreement-A".to_owned(),
			source: PathBuf::from("errors"),
			severity: Severity::Error,
		})
		.await?;

	let rotation = tokio::time::timeout(Duration::from_secs(5), rotations.recv()).await?.unwrap();
	assert_eq!(rotation.event.agreement, "agreement-A");
	let report = completed(rotation.outcome?);
	assert_eq!(report.agreements.len(), 1);
	assert_eq!(report.agreements[0].status, AgreementStatus::Succeeded);
	assert!(connector
		.modifies()
		.iter()
		.all(|op| matches!(op, Op::Modify { value, .. } if value == "explicit-A")));

	cancel.cancel();
	tokio::time::timeout(Duration::from_secs(5), serving).await??;

	Ok(())
}

fn docker_config() -> Config {
	Config::from_yaml_str(
		"
url: ldap://localhost:3389
bind_dn: cn=Directory Manager
bind_password: adminpassword
password:
  default_password: rotated-password
",
	)
	.unwrap()
}

#[ignore = "docker"]
#[tokio::test]
#[serial]
async fn ldap_preview_cycle_test() -> Result<(), Box<dyn Error>> {
	let config = docker_config();
	let rotator = Rotator::new(config.clone(), LdapConnector::new(config));

	match rotator.run_cycle(None, ExecutionMode::Preview).await? {
		CycleOutcome::NoAgreements => {}
		CycleOutcome::Completed(report) => {
			assert!(report.is_success(), "Preview cannot fail a write: {report:#?}");
		}
	}

	Ok(())
}

#[ignore = "docker"]
#[tokio::test]
#[serial]
async fn ldap_bad_credentials_test() -> Result<(), Box<dyn Error>> {
	let mut config = docker_config();
	config.bind_password = "wrong".to_owned();
	let rotator = Rotator::new(config.clone(), LdapConnector::new(config));

	let result = rotator.run_cycle(None, ExecutionMode::Preview).await;
	assert!(matches!(result, Err(ldap_repl_rotator::Error::Connection { .. })));

	Ok(())
}
