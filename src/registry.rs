use crate::{
	addr::{equivalent, ListenAddr, NetAddr, Network, Transport},
	errors::{BindError, InheritError},
	BindOptions,
	Inheritance,
};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use socket2::{SockRef, Socket};
use std::{
	collections::BTreeSet,
	io,
	net::TcpListener,
	os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd},
};

/// Listeners inherited from a predecessor process, handed out by address.
///
/// Create one registry when the process starts and share it with everything that opens listeners. The first call to [`bind`][Self::bind] (or any other method) reconstructs the inherited listeners described by the registry's [`Inheritance`]. After that, each `bind` either claims the inherited listener whose address is [equivalent][crate::equivalent()] to the requested one, or binds a new listener if there is none.
///
/// Matching is by address, not by position, so a successor finds its listeners no matter what order its predecessor passed them in.
///
/// Each inherited file descriptor is taken by at most one registry in the process. If several registries are built from the same [`Inheritance`], only the first to reconstruct gets the listeners; the others see none.
///
///
/// # Example
///
/// ```no_run
/// use socket_handoff::{ListenerRegistry, Process};
///
/// # fn example_fn() -> Result<(), Box<dyn std::error::Error>> {
/// let registry = ListenerRegistry::from_env();
///
/// // Inherited from the predecessor if it was listening on port 8080, otherwise bound now.
/// let listener = registry.bind("tcp", ":8080")?;
///
/// // Nothing else will be claimed, so release whatever is left.
/// registry.close_all();
///
/// // …later, to hand the listener to a replacement:
/// let successor = Process::new(std::env::current_exe()?)
/// 	.listener(&listener)
/// 	.start()?;
/// # drop(successor);
/// # Ok(())
/// # }
/// ```
///
///
/// # Inherited listeners
///
/// An inherited listener is returned exactly as the predecessor left it. In particular, it may be in non-blocking mode if the predecessor used an asynchronous runtime. The mode is shared with the predecessor's copy of the socket for as long as both processes hold it.
#[derive(Debug)]
pub struct ListenerRegistry {
	inheritance: Inheritance,
	options: BindOptions,
	slots: OnceCell<Mutex<Vec<Option<Slot>>>>,
}

#[derive(Debug)]
struct Slot {
	addr: NetAddr,
	listener: TcpListener,
}

impl ListenerRegistry {
	/// Creates a registry for the inherited listeners described by the current process's environment, with default [`BindOptions`].
	pub fn from_env() -> Self {
		Self::new(Inheritance::from_env(), BindOptions::default())
	}

	/// Creates a registry for the given inherited listeners. Listeners that have to be bound fresh use `options`.
	pub fn new(inheritance: Inheritance, options: BindOptions) -> Self {
		Self {
			inheritance,
			options,
			slots: OnceCell::new(),
		}
	}

	/// The [`Inheritance`] this registry was created from.
	pub fn inheritance(&self) -> &Inheritance {
		&self.inheritance
	}

	/// Returns a listener for `network` and `address`: an inherited one with an equivalent address if there is one, otherwise a newly bound one.
	///
	/// See [`Network`] and [`ListenAddr`] for the accepted syntax. Only TCP networks are supported.
	///
	/// An inherited listener is only ever returned once. Asking for the same address again binds a new listener, which normally fails with [`io::ErrorKind::AddrInUse`] while the first one is still open.
	pub fn bind(&self, network: &str, address: &str) -> Result<TcpListener, BindError> {
		let network: Network = network.parse()?;
		check_supported(network)?;

		let address = ListenAddr::parse(network, address)?;
		self.bind_addr(&address)
	}

	/// Like [`bind`][Self::bind], but with an already parsed address.
	pub fn bind_addr(&self, address: &ListenAddr) -> Result<TcpListener, BindError> {
		check_supported(address.network())?;

		if let Some(listener) = self.claim(&address.to_net_addr()) {
			return Ok(listener);
		}

		bind_new(address, &self.options)
	}

	/// The number of inherited listeners that have not been claimed or closed yet.
	pub fn inherited_count(&self) -> usize {
		self.slots().lock().iter().filter(|slot| slot.is_some()).count()
	}

	/// Closes every inherited listener that has not been claimed.
	///
	/// Call this once the application has bound everything it needs, so that inherited sockets nobody asked for do not stay open. Calling it again, or on a registry with nothing inherited, does nothing.
	pub fn close_all(&self) {
		let unclaimed: Vec<Slot> =
			self.slots().lock()
			.iter_mut()
			.filter_map(Option::take)
			.collect();

		for slot in unclaimed {
			tracing::debug!(addr = %slot.addr, fd = slot.listener.as_raw_fd(), "closing unclaimed inherited listener");
		}
	}

	fn slots(&self) -> &Mutex<Vec<Option<Slot>>> {
		self.slots.get_or_init(|| Mutex::new(reconstruct(&self.inheritance)))
	}

	fn claim(&self, wanted: &NetAddr) -> Option<TcpListener> {
		// The lock is held from the search until the slot is emptied, so two callers can never claim the same slot.
		let mut slots = self.slots().lock();

		let Slot { addr, listener } =
			slots.iter_mut()
			.find(|slot| matches!(slot, Some(slot) if equivalent(&slot.addr, wanted)))?
			.take()?;

		tracing::info!(%addr, requested = %wanted, fd = listener.as_raw_fd(), "claimed inherited listener");

		Some(listener)
	}
}

fn check_supported(network: Network) -> Result<(), BindError> {
	match network.transport() {
		Transport::Tcp => Ok(()),
		_ => Err(BindError::UnsupportedNetwork { network }),
	}
}

fn reconstruct(inheritance: &Inheritance) -> Vec<Option<Slot>> {
	inheritance.fds()
	.map(|fd| match adopt(fd) {
		Ok(slot) => {
			tracing::info!(fd, addr = %slot.addr, "inherited listener from parent process");
			Some(slot)
		}

		Err(error) => {
			tracing::warn!(fd, %error, "couldn't reconstruct inherited listener");
			None
		}
	})
	.collect()
}

/// Descriptors that some registry in this process has already tried to adopt. Each inherited descriptor gets exactly one owner, even if several registries are built from the same [`Inheritance`].
static TAKEN_FDS: Mutex<BTreeSet<RawFd>> = parking_lot::const_mutex(BTreeSet::new());

fn adopt(fd: RawFd) -> Result<Slot, InheritError> {
	if fd < 0 {
		return Err(InheritError::CheckSocket {
			fd,
			error: io::Error::from_raw_os_error(nix::libc::EBADF),
		});
	}

	if !TAKEN_FDS.lock().insert(fd) {
		return Err(InheritError::AlreadyInherited { fd });
	}

	// Safety: The descriptor number comes from the handoff contract. It is only borrowed until it is known to be an open socket, so a bogus number is never closed.
	let borrowed: BorrowedFd<'_> = unsafe { BorrowedFd::borrow_raw(fd) };

	let actual_type: socket2::Type =
		SockRef::from(&borrowed).r#type()
		.map_err(|error| InheritError::CheckSocket { fd, error })?;

	// Safety: It is an open socket, and the handoff contract gives it to this process. From here on it is owned, and closed if it turns out to be unusable.
	let socket: Socket = Socket::from(unsafe { OwnedFd::from_raw_fd(fd) });

	if actual_type != socket2::Type::STREAM {
		return Err(InheritError::WrongType { fd, actual: actual_type });
	}

	let addr: std::net::SocketAddr =
		socket.local_addr()
		.map_err(|error| InheritError::LocalAddr { fd, error })?
		.as_socket()
		.ok_or(InheritError::WrongDomain { fd })?;

	// Check whether the socket is in a listening state, if the platform supports that. Errors from the check itself are ignored; the likely cause is an old kernel.
	cfg_if::cfg_if! {
		if #[cfg(any(
			target_os = "aix",
			target_os = "android",
			target_os = "freebsd",
			target_os = "fuchsia",
			target_os = "linux",
		))] {
			if let Ok(false) = socket.is_listener() {
				return Err(InheritError::NotListening { fd });
			}
		}
	}

	// Inherited descriptors arrive without close-on-exec. Only an explicit handoff should pass this one on again.
	socket.set_cloexec(true)
	.map_err(|error| InheritError::SetCloexec { fd, error })?;

	Ok(Slot {
		addr: addr.into(),
		listener: socket.into(),
	})
}

fn bind_new(address: &ListenAddr, options: &BindOptions) -> Result<TcpListener, BindError> {
	let sock_addr: socket2::SockAddr = address.socket_addr().into();

	let socket: Socket =
		Socket::new(sock_addr.domain(), socket2::Type::STREAM, Some(socket2::Protocol::TCP))
		.map_err(|error| BindError::CreateSocket { error })?;

	if !options.ip_socket_no_reuse_address {
		socket.set_reuse_address(true)
		.map_err(|error| BindError::SetSockOpt {
			option: "SO_REUSEADDR",
			error,
		})?;
	}

	#[cfg(not(any(target_os = "solaris", target_os = "illumos")))]
	if options.ip_socket_reuse_port {
		socket.set_reuse_port(true)
		.map_err(|error| BindError::SetSockOpt {
			option: "SO_REUSEPORT",
			error,
		})?;
	}

	if options.ip_socket_v6_only && sock_addr.is_ipv6() {
		socket.set_only_v6(true)
		.map_err(|error| BindError::SetSockOpt {
			option: "IPV6_V6ONLY",
			error,
		})?;
	}

	socket.bind(&sock_addr)
	.map_err(|error| BindError::Bind { error })?;

	socket.listen(options.backlog())
	.map_err(|error| BindError::Listen { error })?;

	tracing::debug!(%address, fd = socket.as_raw_fd(), "bound new listener");

	Ok(socket.into())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::inherit::{INHERITED_LISTENER, INHERITED_PROCESS};
	use assert_matches::assert_matches;
	use std::{fs::File, thread};
	use tracing_test::traced_test;

	// Each test plants its descriptors in its own range, well above anything the test harness opens, so tests can run in parallel.
	fn plant(fd_start: RawFd, fds: &[&dyn AsRawFd]) {
		for (i, fd) in fds.iter().enumerate() {
			nix::unistd::dup2(fd.as_raw_fd(), fd_start + i as RawFd).unwrap();
		}
	}

	fn successor_registry(fd_start: RawFd, count: &str) -> ListenerRegistry {
		let inheritance = Inheritance::from_vars([
			(INHERITED_PROCESS, "1"),
			(INHERITED_LISTENER, count),
		]);

		ListenerRegistry::new(inheritance.with_fd_start(fd_start), BindOptions::default())
	}

	fn loopback_listener() -> (TcpListener, String) {
		let listener = TcpListener::bind("127.0.0.1:0").unwrap();
		let addr = listener.local_addr().unwrap().to_string();
		(listener, addr)
	}

	#[test]
	fn zero_inheritance_binds_fresh() {
		let registry = ListenerRegistry::new(Inheritance::none(), BindOptions::default());

		let listener = registry.bind("tcp", ":0").unwrap();
		assert_ne!(listener.local_addr().unwrap().port(), 0);

		let listener = registry.bind("tcp4", "127.0.0.1:0").unwrap();
		assert!(listener.local_addr().unwrap().ip().is_loopback());

		assert_eq!(registry.inherited_count(), 0);
	}

	#[test]
	fn claims_each_inherited_listener_once() {
		let (a, a_addr) = loopback_listener();
		let (b, b_addr) = loopback_listener();
		plant(600, &[&a, &b]);

		let registry = successor_registry(600, "2");
		assert_eq!(registry.inherited_count(), 2);

		// Asked for in the opposite order from how they were passed.
		let claimed_b = registry.bind("tcp", &b_addr).unwrap();
		assert_eq!(claimed_b.as_raw_fd(), 601);

		let claimed_a = registry.bind("tcp", &a_addr).unwrap();
		assert_eq!(claimed_a.as_raw_fd(), 600);
		assert_eq!(claimed_a.local_addr().unwrap(), a.local_addr().unwrap());

		assert_eq!(registry.inherited_count(), 0);

		// A second request for the same address binds fresh, which collides with the listener that is already open.
		assert_matches!(
			registry.bind("tcp", &a_addr),
			Err(BindError::Bind { error })
			if error.kind() == io::ErrorKind::AddrInUse
		);
	}

	#[test]
	fn wildcard_listener_matches_ipv6_wildcard_request() {
		let listener = TcpListener::bind("0.0.0.0:0").unwrap();
		let port = listener.local_addr().unwrap().port();
		plant(620, &[&listener]);

		let registry = successor_registry(620, "1");

		let claimed = registry.bind("tcp", &format!("[::]:{port}")).unwrap();
		assert_eq!(claimed.as_raw_fd(), 620);
	}

	#[test]
	fn empty_host_matches_wildcard_listener() {
		let listener = TcpListener::bind("0.0.0.0:0").unwrap();
		let port = listener.local_addr().unwrap().port();
		plant(630, &[&listener]);

		let registry = successor_registry(630, "1");

		let claimed = registry.bind("tcp", &format!(":{port}")).unwrap();
		assert_eq!(claimed.as_raw_fd(), 630);
	}

	#[test]
	#[traced_test]
	fn bad_slot_is_skipped() {
		let (a, a_addr) = loopback_listener();
		let not_a_socket = File::open("/dev/null").unwrap();
		let (c, c_addr) = loopback_listener();
		plant(640, &[&a, &not_a_socket, &c]);

		let registry = successor_registry(640, "3");
		assert_eq!(registry.inherited_count(), 2);
		assert!(logs_contain("couldn't reconstruct inherited listener"));

		assert_eq!(registry.bind("tcp", &a_addr).unwrap().as_raw_fd(), 640);
		assert_eq!(registry.bind("tcp", &c_addr).unwrap().as_raw_fd(), 642);

		// The registry never adopted the non-socket, so it is still open.
		assert!(nix::fcntl::fcntl(641, nix::fcntl::FcntlArg::F_GETFD).is_ok());
		nix::unistd::close(641).unwrap();
	}

	#[test]
	fn datagram_socket_is_not_inherited() {
		let udp = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
		plant(660, &[&udp]);

		let registry = successor_registry(660, "1");
		assert_eq!(registry.inherited_count(), 0);
	}

	#[test]
	fn not_listening_socket_is_not_inherited() {
		let socket = Socket::new(socket2::Domain::IPV4, socket2::Type::STREAM, None).unwrap();
		socket.bind(&"127.0.0.1:0".parse::<std::net::SocketAddr>().unwrap().into()).unwrap();
		plant(665, &[&socket]);

		let registry = successor_registry(665, "1");

		#[cfg(target_os = "linux")]
		assert_eq!(registry.inherited_count(), 0);

		registry.close_all();
	}

	#[test]
	fn malformed_count_means_nothing_inherited() {
		let (listener, addr) = loopback_listener();
		plant(670, &[&listener]);

		let registry = successor_registry(670, "one");
		assert_eq!(registry.inherited_count(), 0);

		// Falls back to a fresh bind, which collides with the listener that is still open.
		assert_matches!(registry.bind("tcp", &addr), Err(BindError::Bind { .. }));

		nix::unistd::close(670).unwrap();
	}

	#[test]
	fn rejects_unsupported_networks_and_bad_addresses() {
		let registry = ListenerRegistry::new(Inheritance::none(), BindOptions::default());

		assert_matches!(
			registry.bind("udp", ":0"),
			Err(BindError::UnsupportedNetwork { network: Network::Udp })
		);

		assert_matches!(
			registry.bind("unix", ":0"),
			Err(BindError::UnsupportedNetwork { network: Network::Unix })
		);

		assert_matches!(registry.bind("carrier-pigeon", ":0"), Err(BindError::InvalidNetwork(_)));
		assert_matches!(registry.bind("tcp", "8080"), Err(BindError::InvalidAddr(_)));

		let error: io::Error = registry.bind("udp", ":0").unwrap_err().into();
		assert_eq!(error.kind(), io::ErrorKind::Unsupported);
	}

	#[test]
	fn huge_count_falls_back_to_fresh_bind() {
		let registry = successor_registry(750, "18446744073709551615");
		assert_eq!(registry.inherited_count(), 0);

		let listener = registry.bind("tcp", "127.0.0.1:0").unwrap();
		assert_ne!(listener.local_addr().unwrap().port(), 0);

		// The registry is still usable.
		registry.bind("tcp", "127.0.0.1:0").unwrap();
	}

	#[test]
	#[traced_test]
	fn registries_sharing_an_inheritance_take_each_listener_once() {
		let (listener, addr) = loopback_listener();
		plant(740, &[&listener]);

		let inheritance = Inheritance::from_vars([
			(INHERITED_PROCESS, "1"),
			(INHERITED_LISTENER, "1"),
		]).with_fd_start(740);

		let first = ListenerRegistry::new(inheritance.clone(), BindOptions::default());
		let second = ListenerRegistry::new(inheritance, BindOptions::default());

		let claimed = first.bind("tcp", &addr).unwrap();
		assert_eq!(claimed.as_raw_fd(), 740);

		assert_eq!(second.inherited_count(), 0);
		assert!(logs_contain("already in use by another registry"));

		// Both the original and the claimed copy still hold the port.
		assert_matches!(second.bind("tcp", &addr), Err(BindError::Bind { .. }));
		second.close_all();
		assert!(claimed.local_addr().is_ok());
	}

	#[test]
	fn close_all_is_idempotent() {
		let (listener, addr) = loopback_listener();
		plant(680, &[&listener]);
		drop(listener);

		let registry = successor_registry(680, "1");
		registry.close_all();
		assert_eq!(registry.inherited_count(), 0);
		registry.close_all();

		// The inherited socket is gone, so the port is free for a fresh bind.
		let fresh = registry.bind("tcp", &addr).unwrap();
		assert_eq!(fresh.local_addr().unwrap().to_string(), addr);

		ListenerRegistry::new(Inheritance::none(), BindOptions::default()).close_all();
	}

	#[test]
	fn concurrent_binds_claim_a_slot_once() {
		let (listener, addr) = loopback_listener();
		plant(700, &[&listener]);

		let registry = successor_registry(700, "1");

		let results: Vec<Result<TcpListener, BindError>> = thread::scope(|scope| {
			let handles: Vec<_> =
				(0..8)
				.map(|_| scope.spawn(|| registry.bind("tcp", &addr)))
				.collect();

			handles.into_iter().map(|handle| handle.join().unwrap()).collect()
		});

		let claimed: Vec<&TcpListener> = results.iter().filter_map(|result| result.as_ref().ok()).collect();
		assert_eq!(claimed.len(), 1);
		assert_eq!(claimed[0].as_raw_fd(), 700);

		for result in &results {
			if let Err(error) = result {
				assert_matches!(error, BindError::Bind { error } if error.kind() == io::ErrorKind::AddrInUse);
			}
		}
	}

	#[test]
	fn bind_options_are_applied() {
		let mut options = BindOptions::default();
		options.listen_socket_backlog = Some(4);
		options.ip_socket_reuse_port = true;

		let registry = ListenerRegistry::new(Inheritance::none(), options);
		let listener = registry.bind("tcp", "127.0.0.1:0").unwrap();

		assert!(SockRef::from(&listener).reuse_port().unwrap());
		assert!(SockRef::from(&listener).reuse_address().unwrap());
	}
}
