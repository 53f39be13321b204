use crate::NetAddr;
use socket2::Socket;
use std::{
	io,
	os::fd::{AsFd, BorrowedFd},
};

#[cfg(doc)]
use crate::Process;

/// A bound network endpoint that can be handed to a successor [`Process`].
///
/// The only capability that matters for handoff is [`inheritable_fd`][Self::inheritable_fd]: listeners backed by an OS socket return it, and everything else keeps the default `None`. Listeners without a descriptor (in-memory listeners in tests, for example) can still be passed to [`Process`]; they are simply skipped.
///
/// Implemented for [`std::net::TcpListener`], [`socket2::Socket`], and, with the `tokio` feature, [`tokio::net::TcpListener`].
pub trait Listener {
	/// Returns the address this listener is bound to.
	fn local_addr(&self) -> io::Result<NetAddr>;

	/// Returns the listener's file descriptor, if it has one that a child process could inherit.
	///
	/// The descriptor is only borrowed. [`Process`] duplicates it, so the listener stays open and keeps accepting connections in this process.
	fn inheritable_fd(&self) -> Option<BorrowedFd<'_>> {
		None
	}
}

impl<L: Listener + ?Sized> Listener for &L {
	fn local_addr(&self) -> io::Result<NetAddr> {
		(**self).local_addr()
	}

	fn inheritable_fd(&self) -> Option<BorrowedFd<'_>> {
		(**self).inheritable_fd()
	}
}

impl<L: Listener + ?Sized> Listener for Box<L> {
	fn local_addr(&self) -> io::Result<NetAddr> {
		(**self).local_addr()
	}

	fn inheritable_fd(&self) -> Option<BorrowedFd<'_>> {
		(**self).inheritable_fd()
	}
}

impl<L: Listener + ?Sized> Listener for std::sync::Arc<L> {
	fn local_addr(&self) -> io::Result<NetAddr> {
		(**self).local_addr()
	}

	fn inheritable_fd(&self) -> Option<BorrowedFd<'_>> {
		(**self).inheritable_fd()
	}
}

impl Listener for std::net::TcpListener {
	fn local_addr(&self) -> io::Result<NetAddr> {
		std::net::TcpListener::local_addr(self).map(NetAddr::from)
	}

	fn inheritable_fd(&self) -> Option<BorrowedFd<'_>> {
		Some(self.as_fd())
	}
}

impl Listener for Socket {
	fn local_addr(&self) -> io::Result<NetAddr> {
		let addr = Socket::local_addr(self)?;

		addr.as_socket()
		.map(NetAddr::from)
		.ok_or_else(|| io::Error::new(io::ErrorKind::Unsupported, "socket is not an IP socket"))
	}

	fn inheritable_fd(&self) -> Option<BorrowedFd<'_>> {
		Some(self.as_fd())
	}
}

#[cfg(feature = "tokio")]
impl Listener for tokio::net::TcpListener {
	fn local_addr(&self) -> io::Result<NetAddr> {
		tokio::net::TcpListener::local_addr(self).map(NetAddr::from)
	}

	fn inheritable_fd(&self) -> Option<BorrowedFd<'_>> {
		Some(self.as_fd())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::Transport;

	#[derive(Debug)]
	struct InMemoryListener(&'static str);

	impl Listener for InMemoryListener {
		fn local_addr(&self) -> io::Result<NetAddr> {
			Ok(NetAddr::new(Transport::Tcp, self.0))
		}
	}

	#[test]
	fn in_memory_listener_has_no_fd() {
		let listener = InMemoryListener(":9000");
		assert!(listener.inheritable_fd().is_none());
		assert!((&listener).inheritable_fd().is_none());
	}

	#[test]
	fn std_listener_has_fd() {
		use std::os::fd::AsRawFd;

		let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
		let fd = Listener::inheritable_fd(&listener).unwrap();
		assert_eq!(fd.as_raw_fd(), listener.as_raw_fd());

		let addr = Listener::local_addr(&listener).unwrap();
		assert_eq!(addr.transport(), Transport::Tcp);
		assert_eq!(addr.as_str(), listener.local_addr().unwrap().to_string());
	}
}
