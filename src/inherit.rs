//! The environment contract between a process and the successor it spawns.
//!
//! A successor is started with two extra environment variables:
//!
//! * [`INHERITED_PROCESS`] set to `1`, meaning “this process was spawned by a predecessor to replace it”.
//! * [`INHERITED_LISTENER`] set to the number of inherited listening sockets, which occupy file descriptors [`LISTEN_FDS_START`] (3) and up, right after standard input, output, and error. It is omitted when there are none.
//!
//! The count is the only source of truth about how many descriptors are inherited. Nothing scans the descriptor table to guess.

use crate::errors::InheritError;
use nix::sys::resource::{getrlimit, Resource};
use std::{
	env,
	ffi::OsStr,
	os::fd::RawFd,
	sync::atomic::{AtomicBool, Ordering},
};

#[cfg(test)]
use assert_matches::assert_matches;

/// Environment variable that marks a process as a spawned successor. Its value is `1`.
pub const INHERITED_PROCESS: &str = "INHERITED_PROCESS";

/// Environment variable holding the number of inherited listening sockets.
pub const INHERITED_LISTENER: &str = "INHERITED_LISTENER";

/// Prefix shared by every environment variable of the handoff contract.
///
/// When a successor inherits its parent's environment, variables with this prefix are not copied, so that a stale count from an earlier generation never reaches it.
pub const RESERVED_PREFIX: &str = "INHERITED_";

/// The first inherited listener's file descriptor.
pub const LISTEN_FDS_START: RawFd = 3;

/// Returns true if the current process was spawned as a successor, according to its environment.
pub fn is_successor() -> bool {
	env::var_os(INHERITED_PROCESS).as_deref() == Some(OsStr::new("1"))
}

/// A parsed snapshot of the handoff environment variables.
///
/// [`ListenerRegistry`][crate::ListenerRegistry] reconstructs its inherited listeners from one of these. Production code uses [`Inheritance::from_env`]. Tests can build one with [`Inheritance::from_vars`] and [`Inheritance::with_fd_start`] to simulate several generations of processes inside one.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Inheritance {
	successor: bool,
	listeners: usize,
	fd_start: RawFd,
}

impl Inheritance {
	/// No inherited listeners. The process is not a successor.
	pub fn none() -> Self {
		Self {
			successor: false,
			listeners: 0,
			fd_start: LISTEN_FDS_START,
		}
	}

	/// Reads the current process's environment.
	///
	/// Inherited listeners can only be taken over once per process, so only the first call sees them. Later calls log a warning and return [`Inheritance::none`]. Share one [`ListenerRegistry`][crate::ListenerRegistry] instead of creating several.
	pub fn from_env() -> Self {
		static TAKEN: AtomicBool = AtomicBool::new(false);

		if TAKEN.swap(true, Ordering::AcqRel) {
			tracing::warn!("inherited listeners were already taken from the environment; not inheriting any");
			return Self::none();
		}

		Self::from_vars(
			[INHERITED_PROCESS, INHERITED_LISTENER]
			.into_iter()
			.filter_map(|name| Some((name, env::var(name).ok()?)))
		)
	}

	/// Reads the handoff variables out of the given `(name, value)` pairs. Other variables are ignored.
	///
	/// The listener count is only consulted when the successor flag is set. A malformed count is not an error; it counts as zero. So is a count larger than the number of file descriptors the process is allowed to have.
	pub fn from_vars<I, K, V>(vars: I) -> Self
	where
		I: IntoIterator<Item = (K, V)>,
		K: AsRef<str>,
		V: AsRef<str>,
	{
		let mut successor = false;
		let mut count: Option<String> = None;

		for (name, value) in vars {
			match name.as_ref() {
				INHERITED_PROCESS => successor = value.as_ref() == "1",
				INHERITED_LISTENER => count = Some(value.as_ref().to_owned()),
				_ => {}
			}
		}

		let listeners = match (successor, count) {
			(true, Some(value)) => parse_count(value).unwrap_or_else(|error| {
				tracing::warn!(%error, "ignoring inherited listener count");
				0
			}),

			(false, Some(value)) => {
				tracing::debug!(%value, "INHERITED_LISTENER is set but INHERITED_PROCESS is not; ignoring it");
				0
			},

			(_, None) => 0,
		};

		Self {
			successor,
			listeners,
			fd_start: LISTEN_FDS_START,
		}
	}

	/// Changes the file descriptor of the first inherited listener. The default is [`LISTEN_FDS_START`].
	pub fn with_fd_start(mut self, fd_start: RawFd) -> Self {
		self.fd_start = fd_start;
		self
	}

	/// Whether the process is a spawned successor.
	pub fn is_successor(&self) -> bool {
		self.successor
	}

	/// The number of inherited listeners announced by the parent.
	pub fn listener_count(&self) -> usize {
		self.listeners
	}

	/// The file descriptors that hold inherited listeners, in order. Stops early rather than go past the largest possible descriptor number.
	pub fn fds(&self) -> impl Iterator<Item = RawFd> {
		let start = self.fd_start;
		(0..self.listeners).map_while(move |i| RawFd::try_from(i).ok()?.checked_add(start))
	}
}

impl Default for Inheritance {
	fn default() -> Self {
		Self::none()
	}
}

fn parse_count(value: String) -> Result<usize, InheritError> {
	let count: usize =
		value.trim().parse()
		.map_err(|error| InheritError::InvalidCount { value, error })?;

	let max = max_listener_count();

	if count > max {
		return Err(InheritError::CountOutOfRange { count, max });
	}

	Ok(count)
}

/// The most listeners that could fit in the descriptor table after the standard streams.
fn max_listener_count() -> usize {
	let fd_limit: usize = match getrlimit(Resource::RLIMIT_NOFILE) {
		Ok((soft, _)) => usize::try_from(soft).unwrap_or(usize::MAX),
		Err(error) => {
			tracing::debug!(%error, "couldn't get the file descriptor limit");
			usize::MAX
		}
	};

	let fd_limit = fd_limit.min(RawFd::MAX as usize);
	fd_limit.saturating_sub(LISTEN_FDS_START as usize)
}

#[test]
fn test_from_vars() {
	let inheritance = Inheritance::from_vars([
		("PATH", "/usr/bin"),
		(INHERITED_PROCESS, "1"),
		(INHERITED_LISTENER, "2"),
	]);

	assert!(inheritance.is_successor());
	assert_eq!(inheritance.listener_count(), 2);
	assert_eq!(inheritance.fds().collect::<Vec<_>>(), [3, 4]);

	let inheritance = inheritance.with_fd_start(700);
	assert_eq!(inheritance.fds().collect::<Vec<_>>(), [700, 701]);
}

#[test]
fn test_from_vars_without_count() {
	let inheritance = Inheritance::from_vars([(INHERITED_PROCESS, "1")]);

	assert!(inheritance.is_successor());
	assert_eq!(inheritance.listener_count(), 0);
	assert_eq!(inheritance.fds().count(), 0);
}

#[test]
fn test_from_vars_malformed_count() {
	for bad in ["", "two", "-1", "1,2"] {
		let inheritance = Inheritance::from_vars([
			(INHERITED_PROCESS, "1"),
			(INHERITED_LISTENER, bad),
		]);

		assert!(inheritance.is_successor());
		assert_eq!(inheritance.listener_count(), 0, "{bad:?}");
	}
}

#[test]
fn test_from_vars_count_out_of_range() {
	for huge in ["18446744073709551615", "4294967296", "2147483647"] {
		let inheritance = Inheritance::from_vars([
			(INHERITED_PROCESS, "1"),
			(INHERITED_LISTENER, huge),
		]);

		assert!(inheritance.is_successor());
		assert_eq!(inheritance.listener_count(), 0, "{huge:?}");
	}

	assert_matches!(
		parse_count("18446744073709551615".to_owned()),
		Err(InheritError::CountOutOfRange { count: usize::MAX, .. })
	);
}

#[test]
fn test_fds_stop_at_largest_descriptor() {
	let inheritance = Inheritance::from_vars([
		(INHERITED_PROCESS, "1"),
		(INHERITED_LISTENER, "3"),
	]);

	let inheritance = inheritance.with_fd_start(RawFd::MAX - 1);
	assert_eq!(inheritance.fds().collect::<Vec<_>>(), [RawFd::MAX - 1, RawFd::MAX]);
}

#[test]
fn test_from_vars_count_without_flag() {
	let inheritance = Inheritance::from_vars([
		(INHERITED_PROCESS, "0"),
		(INHERITED_LISTENER, "3"),
	]);

	assert!(!inheritance.is_successor());
	assert_eq!(inheritance.listener_count(), 0);
	assert_eq!(inheritance, Inheritance::none());
}
