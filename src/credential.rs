//! Deciding the new credential for each agreement.

use std::{collections::HashMap, fmt};

use rand::{rngs::OsRng, Rng};
use tracing::{info, warn};

use crate::{
	agreement::{ConsumerKey, ReplicationAgreement},
	config::{PasswordConfig, SPECIAL_CHARS},
	error::Error,
};

/// Upper bound on generate-and-validate rounds for one credential.
pub const MAX_GENERATION_ATTEMPTS: usize = 100;

/// Where a resolved credential came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
	/// Configured for this agreement by name
	Explicit,
	/// The organization wide default
	Default,
	/// Freshly generated from the password policy
	Generated,
}

/// Outcome of resolving the credential of one agreement.
#[derive(Clone, PartialEq, Eq)]
pub enum Resolution {
	/// A value was found.
	Resolved {
		/// The new credential
		value: String,
		/// Which policy layer produced it
		source: CredentialSource,
	},
	/// No value could be determined; the agreement must not be updated.
	Unresolved {
		/// Why resolution failed
		reason: String,
	},
}

impl Resolution {
	/// The credential, if one was resolved.
	#[must_use]
	pub fn value(&self) -> Option<&str> {
		match self {
			Self::Resolved { value, .. } => Some(value),
			Self::Unresolved { .. } => None,
		}
	}
}

impl fmt::Debug for Resolution {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Resolved { source, .. } => {
				f.debug_struct("Resolved").field("value", &"<redacted>").field("source", source).finish()
			}
			Self::Unresolved { reason } => f.debug_struct("Unresolved").field("reason", reason).finish(),
		}
	}
}

/// Resolved credentials for one rotation cycle, keyed by agreement name. Every
/// agreement passed to [`Resolver::resolve`] has exactly one entry.
#[derive(Debug, Clone, Default)]
pub struct CredentialAssignment {
	/// Resolution per agreement name
	entries: HashMap<String, Resolution>,
}

impl CredentialAssignment {
	/// Resolution of the named agreement.
	#[must_use]
	pub fn get(&self, agreement: &str) -> Option<&Resolution> {
		self.entries.get(agreement)
	}

	/// Number of agreements in the assignment.
	#[must_use]
	pub fn len(&self) -> usize {
		self.entries.len()
	}

	/// Whether the assignment holds no agreements.
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}
}

/// Applies the layered credential policy: explicit value, then default value,
/// then generation, then failure.
#[derive(Debug, Clone, Copy)]
pub struct Resolver<'a> {
	/// Policy to apply
	policy: &'a PasswordConfig,
}

impl<'a> Resolver<'a> {
	/// Create a resolver for `policy`.
	#[must_use]
	pub fn new(policy: &'a PasswordConfig) -> Self {
		Self { policy }
	}

	/// Resolve a credential for every agreement.
	///
	/// Agreements replicating to the same consumer account (see
	/// [`ReplicationAgreement::consumer_key`]) are resolved together and get
	/// the same value, since the account can only hold one. If their
	/// predefined values disagree, none of them is resolved.
	#[must_use]
	pub fn resolve(&self, agreements: &[ReplicationAgreement]) -> CredentialAssignment {
		let mut groups: Vec<(ConsumerKey, Vec<&str>)> = Vec::new();
		for agreement in agreements {
			let key = agreement.consumer_key();
			match groups.iter_mut().find(|(existing, _)| *existing == key) {
				Some((_, names)) => names.push(agreement.name.as_str()),
				None => groups.push((key, vec![agreement.name.as_str()])),
			}
		}

		let mut entries = HashMap::with_capacity(agreements.len());
		for (key, names) in groups {
			let resolution = if let [name] = names.as_slice() {
				self.resolve_shared(&format!("agreement '{name}'"), &names)
			} else {
				info!(
					"Agreements {} share the consumer account on {}, resolving one credential",
					names.join(", "),
					key.host
				);
				self.resolve_shared(
					&format!("agreements {} (consumer {})", names.join(", "), key.host),
					&names,
				)
			};
			for name in names {
				entries.insert(name.to_owned(), resolution.clone());
			}
		}
		CredentialAssignment { entries }
	}

	/// Resolve the credential of a single agreement. Empty configured values
	/// count as absent.
	#[must_use]
	pub fn resolve_one(&self, agreement: &str) -> Resolution {
		self.resolve_shared(&format!("agreement '{agreement}'"), &[agreement])
	}

	/// Resolve one credential for `agreements`, which share a consumer
	/// account. `label` names them in logs and reasons.
	fn resolve_shared(&self, label: &str, agreements: &[&str]) -> Resolution {
		let configured = |value: Option<&'a String>| value.filter(|value| !value.is_empty());

		let mut explicit = agreements
			.iter()
			.filter_map(|agreement| configured(self.policy.predefined_passwords.get(*agreement)));
		if let Some(value) = explicit.next() {
			if explicit.any(|other| other != value) {
				warn!("Credential for {label}: conflicting predefined values");
				return Resolution::Unresolved {
					reason: format!("conflicting predefined credentials for {label}"),
				};
			}
			info!("Credential for {label}: using predefined value");
			return Resolution::Resolved { value: value.clone(), source: CredentialSource::Explicit };
		}
		if let Some(value) = configured(self.policy.default_password.as_ref()) {
			info!("Credential for {label}: using default value");
			return Resolution::Resolved { value: value.clone(), source: CredentialSource::Default };
		}
		if !self.policy.generation_enabled() {
			warn!("Credential for {label}: no predefined or default value");
			return Resolution::Unresolved {
				reason: "no predefined or default credential and generation is disabled".to_owned(),
			};
		}
		match Generator::new(self.policy).generate() {
			Ok(value) => {
				info!("Credential for {label}: generated");
				Resolution::Resolved { value, source: CredentialSource::Generated }
			}
			Err(err) => {
				warn!("Credential for {label}: {err}");
				Resolution::Unresolved { reason: err.to_string() }
			}
		}
	}
}

/// A character class a generated credential can be required to contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CharClass {
	/// a-z
	Lower,
	/// A-Z
	Upper,
	/// 0-9
	Digit,
	/// [`SPECIAL_CHARS`]
	Special,
}

impl CharClass {
	/// Every member of the class.
	fn members(self) -> &'static str {
		match self {
			Self::Lower => "abcdefghijklmnopqrstuvwxyz",
			Self::Upper => "ABCDEFGHIJKLMNOPQRSTUVWXYZ",
			Self::Digit => "0123456789",
			Self::Special => SPECIAL_CHARS,
		}
	}

	/// Whether `c` belongs to the class.
	fn contains(self, c: char) -> bool {
		self.members().contains(c)
	}
}

/// Generates random credentials from the operating system's secure random
/// source.
#[derive(Debug, Clone, Copy)]
pub struct Generator<'a> {
	/// Policy to satisfy
	policy: &'a PasswordConfig,
}

impl<'a> Generator<'a> {
	/// Create a generator for `policy`.
	#[must_use]
	pub fn new(policy: &'a PasswordConfig) -> Self {
		Self { policy }
	}

	/// Character classes the policy requires.
	fn classes(&self) -> Vec<CharClass> {
		[
			(self.policy.include_lowercase, CharClass::Lower),
			(self.policy.include_uppercase, CharClass::Upper),
			(self.policy.include_numbers, CharClass::Digit),
			(self.policy.include_special, CharClass::Special),
		]
		.into_iter()
		.filter_map(|(enabled, class)| enabled.then_some(class))
		.collect()
	}

	/// Generate a credential that passes [`Generator::validate`].
	///
	/// Fails with [`Error::PolicyUnsatisfiable`] if the policy leaves nothing
	/// to draw from, or if no valid value turned up within
	/// [`MAX_GENERATION_ATTEMPTS`] rounds (for example a length shorter than
	/// the number of required classes).
	pub fn generate(&self) -> Result<String, Error> {
		let classes = self.classes();
		if classes.is_empty() {
			return Err(Error::PolicyUnsatisfiable("no character class enabled".to_owned()));
		}

		let mut alphabet = Vec::new();
		for class in &classes {
			let before = alphabet.len();
			alphabet.extend(
				class.members().chars().filter(|c| !self.policy.exclude_chars.contains(*c)),
			);
			if alphabet.len() == before {
				return Err(Error::PolicyUnsatisfiable(format!(
					"every {class:?} character is excluded"
				)));
			}
		}

		let length = self.policy.length.max(1);
		for _ in 0..MAX_GENERATION_ATTEMPTS {
			let candidate: String =
				(0..length).map(|_| alphabet[OsRng.gen_range(0..alphabet.len())]).collect();
			if self.validate(&candidate).is_ok() {
				return Ok(candidate);
			}
		}

		Err(Error::PolicyUnsatisfiable(format!(
			"no valid credential after {MAX_GENERATION_ATTEMPTS} attempts"
		)))
	}

	/// Check a credential against the length, class and exclusion rules.
	pub fn validate(&self, value: &str) -> Result<(), Error> {
		if value.chars().count() < self.policy.length {
			return Err(Error::Invalid("credential too short".to_owned()));
		}
		if let Some(c) = value.chars().find(|c| self.policy.exclude_chars.contains(*c)) {
			return Err(Error::Invalid(format!("credential contains excluded character {c:?}")));
		}
		for class in self.classes() {
			if !value.chars().any(|c| class.contains(c)) {
				return Err(Error::Invalid(format!("credential missing {class:?} character")));
			}
		}
		Ok(())
	}
}

/// Rough grading of a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Strength {
	/// Short or single-class
	Weak,
	/// Some length and diversity
	Medium,
	/// Long or diverse
	Strong,
	/// Long and uses every class
	VeryStrong,
}

impl fmt::Display for Strength {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::Weak => "Weak",
			Self::Medium => "Medium",
			Self::Strong => "Strong",
			Self::VeryStrong => "Very Strong",
		})
	}
}

/// Grade a credential by length and the number of character classes it uses.
#[must_use]
pub fn strength(value: &str) -> Strength {
	let length = value.chars().count();
	let mut score = match length {
		12.. => 2,
		8..=11 => 1,
		_ => 0,
	};
	score += [CharClass::Lower, CharClass::Upper, CharClass::Digit, CharClass::Special]
		.into_iter()
		.filter(|class| value.chars().any(|c| class.contains(c)))
		.count();

	match score {
		6.. => Strength::VeryStrong,
		5 => Strength::Strong,
		3 | 4 => Strength::Medium,
		_ => Strength::Weak,
	}
}
