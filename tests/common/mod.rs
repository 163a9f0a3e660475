use std::{
	collections::{HashMap, HashSet},
	io,
	sync::{Arc, Mutex},
};

use async_trait::async_trait;
use ldap3::{LdapError, LdapResult, SearchEntry};
use ldap_repl_rotator::{config::Config, Connector, Directory};

pub const SUPPLIER: &str = "supplier.example.com";
pub const REPLICATION_MANAGER: &str = "cn=replication manager,cn=config";

/// An operation the fake servers received, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
	Connect { host: String },
	Search { host: String, base: String },
	Modify { host: String, dn: String, attribute: String, value: String },
	Close { host: String },
}

#[derive(Debug, Default)]
pub struct FakeState {
	pub ops: Vec<Op>,
	pub agreements: Vec<SearchEntry>,
	/// `(host, dn)` pairs whose writes are rejected
	pub failing_writes: HashSet<(String, String)>,
	/// Hosts that refuse connections
	pub unreachable: HashSet<String>,
	pub failing_search: bool,
}

/// In-memory supplier and consumers sharing one operation log.
#[derive(Debug, Clone)]
pub struct FakeConnector {
	pub state: Arc<Mutex<FakeState>>,
}

impl FakeConnector {
	pub fn new(agreements: Vec<SearchEntry>) -> Self {
		let state = FakeState { agreements, ..FakeState::default() };
		Self { state: Arc::new(Mutex::new(state)) }
	}

	pub fn fail_write(&self, host: &str, dn: &str) {
		self.state.lock().unwrap().failing_writes.insert((host.to_owned(), dn.to_owned()));
	}

	pub fn unreachable(&self, host: &str) {
		self.state.lock().unwrap().unreachable.insert(host.to_owned());
	}

	pub fn ops(&self) -> Vec<Op> {
		self.state.lock().unwrap().ops.clone()
	}

	pub fn modifies(&self) -> Vec<Op> {
		self.ops().into_iter().filter(|op| matches!(op, Op::Modify { .. })).collect()
	}

	fn open(&self, host: &str) -> Result<FakeSession, ldap_repl_rotator::Error> {
		let mut state = self.state.lock().unwrap();
		if state.unreachable.contains(host) {
			return Err(ldap_repl_rotator::Error::Connection {
				host: host.to_owned(),
				source: LdapError::from(io::Error::new(
					io::ErrorKind::ConnectionRefused,
					"connection refused",
				)),
			});
		}
		state.ops.push(Op::Connect { host: host.to_owned() });
		Ok(FakeSession { host: host.to_owned(), state: Arc::clone(&self.state) })
	}
}

#[async_trait]
impl Connector for FakeConnector {
	type Session = FakeSession;

	async fn connect_supplier(&self) -> Result<FakeSession, ldap_repl_rotator::Error> {
		self.open(SUPPLIER)
	}

	async fn connect(
		&self,
		host: &str,
		_port: Option<u16>,
	) -> Result<FakeSession, ldap_repl_rotator::Error> {
		self.open(host)
	}
}

#[derive(Debug)]
pub struct FakeSession {
	host: String,
	state: Arc<Mutex<FakeState>>,
}

fn rejected(rc: u32, text: &str) -> LdapError {
	LdapError::LdapResult {
		result: LdapResult {
			rc,
			matched: String::new(),
			text: text.to_owned(),
			refs: Vec::new(),
			ctrls: Vec::new(),
		},
	}
}

#[async_trait]
impl Directory for FakeSession {
	fn host(&self) -> &str {
		&self.host
	}

	async fn search(
		&mut self,
		base: &str,
		_filter: &str,
		_attributes: &[String],
	) -> Result<Vec<SearchEntry>, ldap_repl_rotator::Error> {
		let mut state = self.state.lock().unwrap();
		state.ops.push(Op::Search { host: self.host.clone(), base: base.to_owned() });
		if state.failing_search {
			return Err(ldap_repl_rotator::Error::Query {
				base: base.to_owned(),
				source: rejected(32, "no such object"),
			});
		}
		Ok(state.agreements.clone())
	}

	async fn modify(
		&mut self,
		dn: &str,
		attribute: &str,
		value: &str,
	) -> Result<(), ldap_repl_rotator::Error> {
		let mut state = self.state.lock().unwrap();
		state.ops.push(Op::Modify {
			host: self.host.clone(),
			dn: dn.to_owned(),
			attribute: attribute.to_owned(),
			value: value.to_owned(),
		});
		if state.failing_writes.contains(&(self.host.clone(), dn.to_owned())) {
			return Err(ldap_repl_rotator::Error::Modify {
				dn: dn.to_owned(),
				attribute: attribute.to_owned(),
				source: rejected(50, "insufficient access"),
			});
		}
		Ok(())
	}

	async fn close(&mut self) -> Result<(), ldap_repl_rotator::Error> {
		self.state.lock().unwrap().ops.push(Op::Close { host: self.host.clone() });
		Ok(())
	}
}

pub fn agreement_dn(name: &str) -> String {
	format!("cn={name},cn=replica,cn=dc\\3Dexample\\2Cdc\\3Dcom,cn=mapping tree,cn=config")
}

pub fn agreement_entry(name: &str, consumer: &str) -> SearchEntry {
	SearchEntry {
		dn: agreement_dn(name),
		attrs: HashMap::from([
			("cn".to_owned(), vec![name.to_owned()]),
			("nsDS5ReplicaHost".to_owned(), vec![consumer.to_owned()]),
			("nsDS5ReplicaBindDN".to_owned(), vec![REPLICATION_MANAGER.to_owned()]),
			("nsds5ReplicaEnabled".to_owned(), vec!["on".to_owned()]),
		]),
		bin_attrs: HashMap::new(),
	}
}

pub fn config(yaml_password_section: &str) -> Config {
	let yaml = format!(
		"url: ldap://{SUPPLIER}:389\nbind_dn: cn=Directory Manager\nbind_password: secret\n{yaml_password_section}"
	);
	Config::from_yaml_str(&yaml).unwrap()
}
