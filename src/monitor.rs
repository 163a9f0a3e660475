//! Watching directory server logs for replication authentication failures
//!
//! Each configured log is polled by its own task. A task remembers how far it
//! has read and only scans bytes appended since, so a line is reported once no
//! matter how long the monitor runs. A source that shrinks (truncated or
//! rotated away) is read again from the start.

use std::{
	io::{ErrorKind, SeekFrom},
	path::{Path, PathBuf},
	sync::{
		atomic::{AtomicU64, AtomicUsize, Ordering},
		Arc, LazyLock,
	},
	time::Duration,
};

use regex::Regex;
use time::{format_description::FormatItem, OffsetDateTime};
use tokio::{
	fs::File,
	io::{AsyncReadExt, AsyncSeekExt},
	sync::{mpsc, watch, RwLock},
	task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{config::MonitorConfig, error::Error, offsets::Offsets};

/// An authentication failure (LDAP result 49) naming the agreement.
#[allow(clippy::expect_used)]
static AUTH_FAILURE: LazyLock<Regex> = LazyLock::new(|| {
	Regex::new(r#"err=49\b.*agreement[:\s]+([^\s,;"')]+)"#).expect("valid pattern")
});

/// The bracketed timestamp opening a 389 log line.
#[allow(clippy::expect_used)]
static TIMESTAMP: LazyLock<Regex> =
	LazyLock::new(|| Regex::new(r"^\s*\[([^\]]+)\]").expect("valid pattern"));

/// 389 log timestamp, e.g. `01/Sep/2025:13:54:42 -0500`
const LOG_TIME_FORMAT: &[FormatItem] = time::macros::format_description!(
	"[day]/[month repr:short]/[year]:[hour]:[minute]:[second] [offset_hour sign:mandatory][offset_minute]"
);

/// 389 log timestamp with the nanosecond precision newer servers write
const LOG_TIME_FORMAT_PRECISE: &[FormatItem] = time::macros::format_description!(
	"[day]/[month repr:short]/[year]:[hour]:[minute]:[second].[subsecond] [offset_hour sign:mandatory][offset_minute]"
);

/// How urgent a detected failure is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Severity {
	/// Replication is failing to authenticate
	Error,
}

/// A detected replication authentication failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthFailureEvent {
	/// When the server logged the failure, or when it was detected if the
	/// line carried no readable timestamp
	pub timestamp: OffsetDateTime,
	/// Agreement whose credential was rejected
	pub agreement: String,
	/// The log line, trimmed
	pub line: String,
	/// Log the line was read from
	pub source: PathBuf,
	/// Severity of the failure
	pub severity: Severity,
}

/// Recognize an authentication failure in a single log line.
#[must_use]
pub fn parse_line(line: &str, source: &Path) -> Option<AuthFailureEvent> {
	let agreement = AUTH_FAILURE.captures(line)?.get(1)?.as_str();
	let timestamp = TIMESTAMP
		.captures(line)
		.and_then(|captures| captures.get(1))
		.and_then(|raw| parse_timestamp(raw.as_str()))
		.unwrap_or_else(|| {
			debug!("No readable timestamp, using detection time: {line}");
			OffsetDateTime::now_utc()
		});

	Some(AuthFailureEvent {
		timestamp,
		agreement: agreement.to_owned(),
		line: line.trim().to_owned(),
		source: source.to_owned(),
		severity: Severity::Error,
	})
}

/// Parse a 389 log timestamp.
fn parse_timestamp(raw: &str) -> Option<OffsetDateTime> {
	OffsetDateTime::parse(raw, LOG_TIME_FORMAT)
		.or_else(|_| OffsetDateTime::parse(raw, LOG_TIME_FORMAT_PRECISE))
		.ok()
}

/// Incremental reader of one log source.
#[derive(Debug, Clone)]
pub struct LogWatcher {
	/// The log file
	path: PathBuf,
	/// Offset of the first byte not yet scanned
	position: u64,
}

impl LogWatcher {
	/// Watch `path`, resuming at `position`.
	#[must_use]
	pub fn new(path: PathBuf, position: u64) -> Self {
		Self { path, position }
	}

	/// The watched file.
	#[must_use]
	pub fn path(&self) -> &Path {
		&self.path
	}

	/// Offset of the first byte not yet scanned.
	#[must_use]
	pub fn position(&self) -> u64 {
		self.position
	}

	/// Scan complete lines appended since the previous scan. A trailing line
	/// without a newline is left for the next scan.
	pub async fn scan(&mut self) -> Result<Vec<AuthFailureEvent>, Error> {
		let mut file = match File::open(&self.path).await {
			Ok(file) => file,
			Err(err) if err.kind() == ErrorKind::NotFound => {
				debug!("Log {} does not exist (yet)", self.path.display());
				self.position = 0;
				return Ok(Vec::new());
			}
			Err(err) => return Err(err.into()),
		};

		let len = file.metadata().await?.len();
		if len < self.position {
			warn!(
				"Log {} shrank from {} to {len} bytes, reading from the start",
				self.path.display(),
				self.position
			);
			self.position = 0;
		}
		if len == self.position {
			return Ok(Vec::new());
		}

		file.seek(SeekFrom::Start(self.position)).await?;
		let mut appended = Vec::new();
		file.take(len - self.position).read_to_end(&mut appended).await?;

		let Some(end) = appended.iter().rposition(|byte| *byte == b'\n') else {
			return Ok(Vec::new());
		};
		let complete = &appended[..=end];
		self.position += complete.len() as u64;

		Ok(String::from_utf8_lossy(complete)
			.lines()
			.filter_map(|line| parse_line(line, &self.path))
			.collect())
	}
}

/// Lifecycle of a [`Monitor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
	/// Created, not yet running
	Idle,
	/// Polling sources
	Watching,
	/// Forwarding detected events
	Emitting,
	/// Cancelled, every watcher has exited
	Stopped,
}

/// Activity counters of a [`Monitor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorStats {
	/// Number of configured sources
	pub sources: usize,
	/// Events forwarded so far
	pub events_emitted: u64,
	/// End of the most recent scan of any source
	pub last_scan: Option<OffsetDateTime>,
}

/// State shared between the monitor handle and its watcher tasks.
#[derive(Debug)]
struct Shared {
	/// Where detected events go
	sender: mpsc::Sender<AuthFailureEvent>,
	/// Stops watchers and emission
	cancel: CancellationToken,
	/// Published lifecycle state
	state: watch::Sender<MonitorState>,
	/// Scan positions per source
	offsets: RwLock<Offsets>,
	/// Watchers currently forwarding events
	emitting: AtomicUsize,
	/// Events forwarded so far
	events_emitted: AtomicU64,
	/// End of the most recent scan
	last_scan: RwLock<Option<OffsetDateTime>>,
}

impl Shared {
	/// Scan one source and forward its events. Returns `false` once the
	/// watcher should stop: cancelled, or nobody is listening anymore.
	async fn scan(&self, watcher: &mut LogWatcher) -> bool {
		let events = match watcher.scan().await {
			Ok(events) => events,
			Err(err) => {
				warn!("Error checking log file {}: {err}", watcher.path().display());
				return true;
			}
		};
		*self.last_scan.write().await = Some(OffsetDateTime::now_utc());

		let delivered = self.emit(events).await;
		if delivered {
			self.offsets.write().await.record(watcher.path(), watcher.position());
		}
		delivered
	}

	/// Forward events to the consumer in log order.
	async fn emit(&self, events: Vec<AuthFailureEvent>) -> bool {
		if events.is_empty() {
			return true;
		}
		if self.emitting.fetch_add(1, Ordering::SeqCst) == 0 {
			self.state.send_replace(MonitorState::Emitting);
		}

		let mut delivered = true;
		for event in events {
			info!(
				"Detected authentication failure for agreement '{}' in {}",
				event.agreement,
				event.source.display()
			);
			tokio::select! {
				() = self.cancel.cancelled() => {
					delivered = false;
					break;
				}
				sent = self.sender.send(event) => {
					if let Err(err) = sent {
						warn!("Sending event failed: {err}");
						delivered = false;
						break;
					}
					self.events_emitted.fetch_add(1, Ordering::SeqCst);
				}
			}
		}

		if self.emitting.fetch_sub(1, Ordering::SeqCst) == 1 && !self.cancel.is_cancelled() {
			self.state.send_replace(MonitorState::Watching);
		}
		delivered
	}

	/// Where to resume `path`: its saved offset, otherwise the beginning or,
	/// with `from_end`, its current length.
	async fn start_position(&self, path: &Path, from_end: bool) -> u64 {
		if let Some(position) = self.offsets.read().await.saved(path) {
			return position;
		}
		if !from_end {
			return 0;
		}
		match tokio::fs::metadata(path).await {
			Ok(metadata) => {
				debug!("Skipping {} existing bytes of {}", metadata.len(), path.display());
				metadata.len()
			}
			Err(_) => 0,
		}
	}

	/// Poll one source until cancelled.
	async fn watch(self: Arc<Self>, path: PathBuf, interval: Duration, from_end: bool) {
		let position = self.start_position(&path, from_end).await;
		let mut watcher = LogWatcher::new(path, position);
		let mut ticker = tokio::time::interval(interval);
		info!("Starting log watcher for {}", watcher.path().display());

		loop {
			tokio::select! {
				() = self.cancel.cancelled() => break,
				_ = ticker.tick() => {}
			}
			if !self.scan(&mut watcher).await {
				break;
			}
		}
		debug!("Log watcher for {} stopped", watcher.path().display());
	}
}

/// Watches every configured log source and forwards authentication failures
/// over a channel.
#[derive(Debug)]
pub struct Monitor {
	/// Sources and poll interval
	config: MonitorConfig,
	/// State shared with watcher tasks
	shared: Arc<Shared>,
}

impl Monitor {
	/// Create a new [`Monitor`] with the given configuration and optional
	/// saved offsets. Also returns the receiver detected events are pushed to.
	#[must_use]
	pub fn new(
		config: MonitorConfig,
		offsets: Option<Offsets>,
	) -> (Self, mpsc::Receiver<AuthFailureEvent>) {
		let (sender, receiver) = mpsc::channel(config.event_buffer.max(1));
		let (state, _) = watch::channel(MonitorState::Idle);
		let shared = Shared {
			sender,
			cancel: CancellationToken::new(),
			state,
			offsets: RwLock::new(offsets.unwrap_or_default()),
			emitting: AtomicUsize::new(0),
			events_emitted: AtomicU64::new(0),
			last_scan: RwLock::new(None),
		};
		(Self { config, shared: Arc::new(shared) }, receiver)
	}

	/// Token that stops the monitor when cancelled.
	#[must_use]
	pub fn cancellation_token(&self) -> CancellationToken {
		self.shared.cancel.clone()
	}

	/// Stop every watcher. [`Monitor::run`] returns once they have exited.
	pub fn stop(&self) {
		info!("Stopping monitor");
		self.shared.cancel.cancel();
	}

	/// Subscribe to lifecycle changes.
	#[must_use]
	pub fn state(&self) -> watch::Receiver<MonitorState> {
		self.shared.state.subscribe()
	}

	/// Watch all sources concurrently until cancelled. Returns right away,
	/// in [`MonitorState::Stopped`], if monitoring is disabled.
	pub async fn run(&self) {
		if !self.config.enabled {
			info!("Monitoring is disabled, not watching any logs");
			self.shared.state.send_replace(MonitorState::Stopped);
			return;
		}
		if self.shared.cancel.is_cancelled() {
			self.shared.state.send_replace(MonitorState::Stopped);
			return;
		}
		let interval = Duration::from_secs(self.config.poll_interval.max(1));
		info!("Monitoring {} log files", self.config.log_paths.len());
		self.shared.state.send_replace(MonitorState::Watching);

		let mut watchers = JoinSet::new();
		for path in &self.config.log_paths {
			watchers.spawn(Arc::clone(&self.shared).watch(
				path.clone(),
				interval,
				self.config.start_at_end,
			));
		}
		while let Some(joined) = watchers.join_next().await {
			if let Err(err) = joined {
				warn!("Log watcher task failed: {err}");
			}
		}

		self.shared.state.send_replace(MonitorState::Stopped);
		info!("Monitor stopped");
	}

	/// Scan every source once, in order, and return how many events were
	/// forwarded. Scans even if monitoring is disabled, since the caller asks
	/// for it explicitly.
	pub async fn scan_once(&self) -> u64 {
		let before = self.shared.events_emitted.load(Ordering::SeqCst);
		for path in &self.config.log_paths {
			let position = self.shared.start_position(path, self.config.start_at_end).await;
			let mut watcher = LogWatcher::new(path.clone(), position);
			if !self.shared.scan(&mut watcher).await {
				break;
			}
		}
		self.shared.events_emitted.load(Ordering::SeqCst) - before
	}

	/// Current scan positions, to pass to [`Monitor::new`] after a restart.
	pub async fn persist_offsets(&self) -> Offsets {
		self.shared.offsets.read().await.clone()
	}

	/// Activity counters.
	pub async fn stats(&self) -> MonitorStats {
		MonitorStats {
			sources: self.config.log_paths.len(),
			events_emitted: self.shared.events_emitted.load(Ordering::SeqCst),
			last_scan: *self.shared.last_scan.read().await,
		}
	}
}
