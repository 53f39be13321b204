//! Various errors that can be raised by this library.

use std::{
	ffi::OsString,
	io,
	net,
	num::ParseIntError,
	os::fd::RawFd,
	path::PathBuf,
};

use crate::Network;

#[cfg(doc)]
use crate::{
	ListenAddr,
	ListenerRegistry,
	Process,
};

/// An error parsing a [`Network`] from a string.
#[derive(Debug, thiserror::Error)]
#[error("unrecognized network `{name}` (expected `tcp`, `tcp4`, `tcp6`, `udp`, `udp4`, `udp6`, or `unix`)")]
#[non_exhaustive]
pub struct InvalidNetworkError {
	/// The network name that was not recognized.
	pub name: String,
}

/// An error parsing or resolving a [`ListenAddr`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum InvalidListenAddrError {
	/// The address has no `:port` part.
	#[error("missing port in address `{addr}`")]
	#[non_exhaustive]
	MissingPort {
		/// The address as it was given.
		addr: String,
	},

	/// The part after the last `:` is not a port number.
	#[error("invalid port in address `{addr}`: {error}")]
	#[non_exhaustive]
	InvalidPort {
		/// The address as it was given.
		addr: String,

		#[source]
		error: ParseIntError,
	},

	/// The host part was bracketed, but what was inside the brackets is not an IPv6 address.
	#[error("invalid bracketed IPv6 address in `{addr}`: {error}")]
	#[non_exhaustive]
	InvalidIpv6 {
		/// The address as it was given.
		addr: String,

		#[source]
		error: net::AddrParseError,
	},

	/// The host name could not be resolved.
	#[error("couldn't resolve host `{host}`: {error}")]
	#[non_exhaustive]
	Resolve {
		/// The host name that failed to resolve.
		host: String,

		#[source]
		error: io::Error,
	},

	/// The host name resolved, but not to any address of the requested network's family. For example, `tcp6` was requested and the host only has IPv4 addresses.
	#[error("host `{host}` has no address usable with this network")]
	#[non_exhaustive]
	NoSuitableAddress {
		/// The host name.
		host: String,
	},

	/// The address is an IP address literal of the wrong family for the network, like `[::1]:80` for `tcp4`.
	#[error("address `{addr}` can't be used with the `{network}` network")]
	#[non_exhaustive]
	WrongFamily {
		/// The address as it was given.
		addr: String,

		/// The network that was requested.
		network: Network,
	},
}

/// An error that occurred in [binding][ListenerRegistry::bind] a listener.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum BindError {
	/// The network name is not recognized.
	#[error("{0}")]
	InvalidNetwork(#[from] InvalidNetworkError),

	/// The address is malformed or could not be resolved.
	#[error("{0}")]
	InvalidAddr(#[from] InvalidListenAddrError),

	/// The network is recognized, but only TCP listeners can be bound and inherited.
	#[error("the `{network}` network is not supported for listening (only `tcp`, `tcp4`, and `tcp6` are)")]
	#[non_exhaustive]
	UnsupportedNetwork {
		/// The network that was requested.
		network: Network,
	},

	/// [`socket2::Socket::new`] failed.
	#[error("couldn't create socket: {error}")]
	#[non_exhaustive]
	CreateSocket {
		/// The error that this one arose from.
		#[source]
		error: io::Error,
	},

	/// Setting a socket option failed.
	#[error("couldn't set socket option `{option}`: {error}")]
	#[non_exhaustive]
	SetSockOpt {
		/// The name of the socket option, like `SO_REUSEPORT`.
		option: &'static str,

		/// The error that this one arose from.
		#[source]
		error: io::Error,
	},

	/// [`socket2::Socket::bind`] failed.
	#[error("couldn't bind socket to address: {error}")]
	#[non_exhaustive]
	Bind {
		/// The error that this one arose from.
		#[source]
		error: io::Error,
	},

	/// [`socket2::Socket::listen`] failed.
	#[error("couldn't make the socket listen: {error}")]
	#[non_exhaustive]
	Listen {
		/// The error that this one arose from.
		#[source]
		error: io::Error,
	},
}

impl From<BindError> for io::Error {
	fn from(error: BindError) -> Self {
		use io::ErrorKind as EK;

		let kind = match &error {
			BindError::InvalidNetwork(_)          => EK::InvalidInput,
			BindError::UnsupportedNetwork { .. }  => EK::Unsupported ,

			BindError::InvalidAddr(error) => match error {
				InvalidListenAddrError::Resolve { error, .. } => error.kind(),
				InvalidListenAddrError::NoSuitableAddress { .. } => EK::NotFound,
				_ => EK::InvalidInput,
			},

			| BindError::CreateSocket { error }
			| BindError::SetSockOpt { error, .. }
			| BindError::Bind { error }
			| BindError::Listen { error }
			=> error.kind(),
		};

		io::Error::new(kind, error)
	}
}

/// A problem with inherited listener state.
///
/// These are never returned to callers. The [`ListenerRegistry`] recovers from them locally, by treating a bad count as zero inherited listeners or leaving a bad slot empty, and reports them through [`tracing`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum InheritError {
	/// The inherited listener count is not a non-negative integer.
	#[error("invalid inherited listener count `{value}`: {error}")]
	#[non_exhaustive]
	InvalidCount {
		/// The value of the count variable.
		value: String,

		#[source]
		error: ParseIntError,
	},

	/// The inherited listener count is a number, but larger than the number of file descriptors this process could possibly have inherited.
	#[error("inherited listener count {count} is out of range (at most {max})")]
	#[non_exhaustive]
	CountOutOfRange {
		/// The parsed count.
		count: usize,

		/// The largest count that is accepted.
		max: usize,
	},

	/// Another registry in this process has already taken this file descriptor.
	#[error("inherited fd {fd} is already in use by another registry")]
	#[non_exhaustive]
	AlreadyInherited {
		/// The file descriptor.
		fd: RawFd,
	},

	/// The file descriptor is closed or is not a socket.
	#[error("inherited fd {fd} is not an open socket: {error}")]
	#[non_exhaustive]
	CheckSocket {
		/// The file descriptor.
		fd: RawFd,

		#[source]
		error: io::Error,
	},

	/// The inherited socket is not a stream socket.
	#[error("inherited fd {fd} has wrong type (expected `STREAM`; got `{actual:?}`)")]
	#[non_exhaustive]
	WrongType {
		/// The file descriptor.
		fd: RawFd,

		/// The type that the socket actually has.
		actual: socket2::Type,
	},

	/// The inherited socket is not an IPv4 or IPv6 socket.
	#[error("inherited fd {fd} is not an IP socket")]
	#[non_exhaustive]
	WrongDomain {
		/// The file descriptor.
		fd: RawFd,
	},

	/// The inherited stream socket is not in a listening state.
	#[error("inherited fd {fd} is not listening")]
	#[non_exhaustive]
	NotListening {
		/// The file descriptor.
		fd: RawFd,
	},

	/// The inherited socket's local address couldn't be determined.
	#[error("couldn't get local address of inherited fd {fd}: {error}")]
	#[non_exhaustive]
	LocalAddr {
		/// The file descriptor.
		fd: RawFd,

		#[source]
		error: io::Error,
	},

	/// Setting the close-on-exec flag on the adopted socket failed.
	#[error("couldn't set close-on-exec on inherited fd {fd}: {error}")]
	#[non_exhaustive]
	SetCloexec {
		/// The file descriptor.
		fd: RawFd,

		#[source]
		error: io::Error,
	},
}

/// An error that occurred in [starting][Process::start] a successor process.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StartProcessError {
	/// The program could not be found on the search path, or is not executable.
	#[error("executable `{}` not found", .program.to_string_lossy())]
	#[non_exhaustive]
	ExecutableNotFound {
		/// The program name as it was given.
		program: OsString,
	},

	/// The operating system refused to create the process.
	#[error("couldn't start `{}`: {error}", .program.display())]
	#[non_exhaustive]
	Spawn {
		/// The resolved path of the program.
		program: PathBuf,

		/// The error that this one arose from.
		#[source]
		error: io::Error,
	},
}

impl From<StartProcessError> for io::Error {
	fn from(error: StartProcessError) -> Self {
		let kind = match &error {
			StartProcessError::ExecutableNotFound { .. } => io::ErrorKind::NotFound,
			StartProcessError::Spawn { error, .. } => error.kind(),
		};

		io::Error::new(kind, error)
	}
}
