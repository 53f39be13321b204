use crate::{
	errors::StartProcessError,
	find_executable,
	inherit::{INHERITED_LISTENER, INHERITED_PROCESS, LISTEN_FDS_START, RESERVED_PREFIX},
	Listener,
};
use nix::fcntl::{fcntl, FcntlArg};
use socket2::SockRef;
use std::{
	env,
	ffi::OsString,
	io,
	os::{
		fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd},
		unix::{
			ffi::OsStrExt,
			process::CommandExt,
		},
	},
	path::{Path, PathBuf},
	process::{Child, Command},
};

/// A request to start a successor process that takes over some listeners.
///
/// The successor gets:
///
/// * standard input, output, and error from this process, as file descriptors 0, 1, and 2;
/// * each of [`listeners`][Self::listeners] that has an [inheritable file descriptor][Listener::inheritable_fd], in order, as file descriptors 3 and up;
/// * the environment variables `INHERITED_PROCESS=1` and, if at least one listener was passed, `INHERITED_LISTENER=`<code><var>n</var></code>;
/// * this process's other environment variables, if [`inherit_env`][Self::inherit_env] is true;
/// * this process's current directory.
///
/// Starting a successor does not affect the listeners in this process. They stay open and keep accepting until the caller closes them, normally once the successor reports that it is ready.
#[derive(Clone)]
#[non_exhaustive]
pub struct Process<'a> {
	/// The program to run. A name without a `/` is looked up on `PATH`.
	pub program: OsString,

	/// Listeners to hand to the successor.
	pub listeners: Vec<&'a dyn Listener>,

	/// The complete argument vector, starting with `argv[0]`. If empty, `argv[0]` is the program path and there are no other arguments.
	pub args: Vec<OsString>,

	/// Whether to pass on this process's environment variables, other than those starting with `INHERITED_`. Default is false.
	pub inherit_env: bool,
}

impl<'a> Process<'a> {
	/// Initializes a new `Process` that runs `program`. All other fields have their default values.
	pub fn new(program: impl Into<OsString>) -> Self {
		Self {
			program: program.into(),
			listeners: Vec::new(),
			args: Vec::new(),
			inherit_env: false,
		}
	}

	/// Adds a listener to hand off.
	pub fn listener(mut self, listener: &'a dyn Listener) -> Self {
		self.listeners.push(listener);
		self
	}

	/// Sets the complete argument vector, starting with `argv[0]`.
	pub fn args<I>(mut self, args: I) -> Self
	where
		I: IntoIterator,
		I::Item: Into<OsString>,
	{
		self.args = args.into_iter().map(Into::into).collect();
		self
	}

	/// Sets whether to pass on this process's environment variables.
	pub fn inherit_env(mut self, inherit_env: bool) -> Self {
		self.inherit_env = inherit_env;
		self
	}

	/// Starts the successor process.
	///
	/// This returns as soon as the operating system has created the process. It does not wait for the successor to start accepting connections; the successor is expected to say so itself, for example by signaling this process to shut down.
	///
	/// The process ID is available from [`Child::id`].
	pub fn start(&self) -> Result<Child, StartProcessError> {
		self.prepare()?.spawn()
	}

	/// Resolves the program, assembles the environment, and duplicates the listeners' file descriptors, without starting anything yet.
	pub fn prepare(&self) -> Result<PreparedProcess, StartProcessError> {
		let program: PathBuf = find_executable(&self.program)?;

		let mut env: Vec<(OsString, OsString)> = Vec::new();

		if self.inherit_env {
			env.extend(
				env::vars_os()
				.filter(|(name, _)| !name.as_bytes().starts_with(RESERVED_PREFIX.as_bytes()))
			);
		}

		env.push((INHERITED_PROCESS.into(), "1".into()));

		// Duplicates are numbered above the range they will occupy in the child, so placing one can never overwrite another.
		let min_fd: RawFd = LISTEN_FDS_START.saturating_add(self.listeners.len() as RawFd);

		let fds: Vec<OwnedFd> =
			self.listeners.iter()
			.filter_map(|listener| {
				let fd = listener.inheritable_fd()?;

				match duplicate_listener_fd(fd, min_fd) {
					Ok(fd) => Some(fd),
					Err(error) => {
						tracing::warn!(addr = ?listener.local_addr().ok(), %error, "not handing off listener");
						None
					}
				}
			})
			.collect();

		if !fds.is_empty() {
			env.push((INHERITED_LISTENER.into(), fds.len().to_string().into()));
		}

		tracing::debug!(program = %program.display(), env_vars = env.len(), listeners = fds.len(), "prepared successor process");

		Ok(PreparedProcess {
			program,
			args: self.args.clone(),
			env,
			fds,
		})
	}
}

fn duplicate_listener_fd(fd: BorrowedFd<'_>, min_fd: RawFd) -> io::Result<OwnedFd> {
	let r#type = SockRef::from(&fd).r#type()?;

	if r#type != socket2::Type::STREAM {
		return Err(io::Error::new(
			io::ErrorKind::Unsupported,
			format!("only stream sockets can be handed off (got `{type:?}`)", type = r#type),
		));
	}

	let dup: RawFd = fcntl(fd.as_raw_fd(), FcntlArg::F_DUPFD_CLOEXEC(min_fd))?;

	// Safety: `fcntl` just created this descriptor, and nothing else owns it.
	Ok(unsafe { OwnedFd::from_raw_fd(dup) })
}

/// A [`Process`] that is ready to [spawn][Self::spawn].
///
/// This owns the duplicated listener file descriptors. They are closed in this process when it is dropped, which [`spawn`][Self::spawn] does whether or not the successor starts.
#[derive(Debug)]
pub struct PreparedProcess {
	program: PathBuf,
	args: Vec<OsString>,
	env: Vec<(OsString, OsString)>,
	fds: Vec<OwnedFd>,
}

impl PreparedProcess {
	/// The resolved path of the program.
	pub fn program(&self) -> &Path {
		&self.program
	}

	/// The argument vector, starting with `argv[0]`.
	pub fn args(&self) -> &[OsString] {
		&self.args
	}

	/// The successor's complete environment.
	pub fn env(&self) -> &[(OsString, OsString)] {
		&self.env
	}

	/// The listener file descriptors, in the order they will appear in the successor starting at descriptor 3.
	pub fn fds(&self) -> &[OwnedFd] {
		&self.fds
	}

	/// The size of the successor's descriptor table: the three standard streams plus the listeners.
	pub fn descriptor_table_len(&self) -> usize {
		3 + self.fds.len()
	}

	/// Starts the successor process.
	pub fn spawn(self) -> Result<Child, StartProcessError> {
		let mut command = Command::new(&self.program);

		if let Some((arg0, args)) = self.args.split_first() {
			command.arg0(arg0).args(args);
		}

		command.env_clear().envs(self.env.iter().map(|(name, value)| (name, value)));

		match env::current_dir() {
			Ok(dir) => { command.current_dir(dir); }
			Err(error) => tracing::debug!(%error, "couldn't get current directory; successor starts in the default one"),
		}

		let sources: Vec<RawFd> = self.fds.iter().map(AsRawFd::as_raw_fd).collect();

		// Safety: `place_listener_fds` only calls `dup2`, which is async-signal-safe, and does not allocate.
		unsafe {
			command.pre_exec(move || place_listener_fds(&sources));
		}

		let child: Child =
			command.spawn()
			.map_err(|error| StartProcessError::Spawn {
				program: self.program.clone(),
				error,
			})?;

		tracing::info!(pid = child.id(), program = %self.program.display(), listeners = self.fds.len(), "started successor process");

		Ok(child)
	}
}

// Runs in the child between `fork` and `exec`. `dup2` leaves close-on-exec clear on the new descriptors, so exactly these survive `exec`.
fn place_listener_fds(sources: &[RawFd]) -> io::Result<()> {
	for (i, source) in sources.iter().enumerate() {
		nix::unistd::dup2(*source, LISTEN_FDS_START + i as RawFd)?;
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		util::TEST_SCRATCH,
		BindOptions,
		Inheritance,
		ListenerRegistry,
		NetAddr,
		Transport,
	};
	use assert_matches::assert_matches;
	use std::{
		fs,
		net::TcpListener,
		os::unix::fs::PermissionsExt,
	};

	struct InMemoryListener;

	impl Listener for InMemoryListener {
		fn local_addr(&self) -> io::Result<NetAddr> {
			Ok(NetAddr::new(Transport::Tcp, ":9000"))
		}
	}

	fn env_strings(prepared: &PreparedProcess) -> Vec<(String, String)> {
		prepared.env().iter()
		.map(|(name, value)| (name.to_str().unwrap().to_owned(), value.to_str().unwrap().to_owned()))
		.collect()
	}

	fn this_program() -> PathBuf {
		env::current_exe().unwrap()
	}

	#[test]
	fn without_inherited_env_only_handoff_vars_are_set() {
		let listener = TcpListener::bind("127.0.0.1:0").unwrap();

		let prepared = Process::new(this_program())
			.listener(&listener)
			.prepare()
			.unwrap();

		assert_eq!(
			env_strings(&prepared),
			[
				("INHERITED_PROCESS".to_owned(), "1".to_owned()),
				("INHERITED_LISTENER".to_owned(), "1".to_owned()),
			],
		);

		assert_eq!(prepared.descriptor_table_len(), 4);
		assert!(prepared.fds()[0].as_raw_fd() >= 4);
		assert_ne!(prepared.fds()[0].as_raw_fd(), listener.as_raw_fd());
	}

	#[test]
	fn listeners_without_fd_are_skipped() {
		let listener = TcpListener::bind("127.0.0.1:0").unwrap();
		let in_memory = InMemoryListener;

		let prepared = Process::new(this_program())
			.listener(&in_memory)
			.listener(&listener)
			.listener(&in_memory)
			.prepare()
			.unwrap();

		assert_eq!(prepared.fds().len(), 1);
		assert_eq!(prepared.descriptor_table_len(), 4);
		assert!(env_strings(&prepared).contains(&("INHERITED_LISTENER".to_owned(), "1".to_owned())));

		let prepared = Process::new(this_program())
			.listener(&in_memory)
			.prepare()
			.unwrap();

		assert_eq!(prepared.descriptor_table_len(), 3);
		assert_eq!(env_strings(&prepared), [("INHERITED_PROCESS".to_owned(), "1".to_owned())]);
	}

	#[test]
	fn datagram_sockets_are_skipped() {
		let udp = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
		let udp = socket2::Socket::from(udp);

		let prepared = Process::new(this_program())
			.listener(&udp)
			.prepare()
			.unwrap();

		assert!(prepared.fds().is_empty());
	}

	#[test]
	fn inherited_env_drops_reserved_vars() {
		env::set_var("INHERITED_STALE_FOR_TEST", "9");

		let prepared = Process::new(this_program())
			.inherit_env(true)
			.prepare()
			.unwrap();

		let vars = env_strings(&prepared);

		assert!(!vars.iter().any(|(name, _)| name == "INHERITED_STALE_FOR_TEST"));
		assert!(!vars.iter().any(|(name, _)| name == "INHERITED_LISTENER"));
		assert_eq!(vars.iter().filter(|(name, _)| name == "INHERITED_PROCESS").count(), 1);

		if let Some(path) = env::var_os("PATH") {
			assert!(prepared.env().contains(&("PATH".into(), path)));
		}
	}

	#[test]
	fn unknown_program_is_not_started() {
		let listener = TcpListener::bind("127.0.0.1:0").unwrap();

		assert_matches!(
			Process::new("no-such-program-for-socket-handoff").listener(&listener).start(),
			Err(StartProcessError::ExecutableNotFound { .. })
		);

		// The listener is untouched.
		assert!(listener.local_addr().is_ok());
	}

	#[test]
	fn spawn_failure_is_wrapped() {
		let path = TEST_SCRATCH.join("not-a-real-executable");
		fs::write(&path, "#!/no/such/interpreter\n").unwrap();
		fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();

		let result = Process::new(&path).start();

		assert_matches!(
			result,
			Err(StartProcessError::Spawn { program, .. })
			if program == path
		);
	}

	#[test]
	fn environment_round_trip() {
		let a = TcpListener::bind("127.0.0.1:0").unwrap();
		let b = TcpListener::bind("127.0.0.1:0").unwrap();

		let prepared = Process::new(this_program())
			.listener(&a)
			.listener(&b)
			.prepare()
			.unwrap();

		// Lay the descriptors out the way the successor would see them, at a base that doesn't disturb this test process.
		const BASE: RawFd = 720;
		for (i, fd) in prepared.fds().iter().enumerate() {
			nix::unistd::dup2(fd.as_raw_fd(), BASE + i as RawFd).unwrap();
		}

		let vars = env_strings(&prepared);
		drop(prepared);

		let registry = ListenerRegistry::new(
			Inheritance::from_vars(vars).with_fd_start(BASE),
			BindOptions::default(),
		);

		assert!(registry.inheritance().is_successor());
		assert_eq!(registry.inherited_count(), 2);

		let b_again = registry.bind("tcp", &b.local_addr().unwrap().to_string()).unwrap();
		assert_eq!(b_again.as_raw_fd(), BASE + 1);

		let a_again = registry.bind("tcp", &a.local_addr().unwrap().to_string()).unwrap();
		assert_eq!(a_again.as_raw_fd(), BASE);
	}

	#[cfg(target_os = "linux")]
	#[test]
	fn successor_sees_listeners_and_env() {
		let a = TcpListener::bind("127.0.0.1:0").unwrap();
		let b = TcpListener::bind("127.0.0.1:0").unwrap();

		let script = r#"
			[ "$INHERITED_PROCESS" = 1 ] &&
			[ "$INHERITED_LISTENER" = 2 ] &&
			[ -S /proc/self/fd/3 ] &&
			[ -S /proc/self/fd/4 ]
		"#;

		let mut child = Process::new("sh")
			.listener(&a)
			.listener(&b)
			.args(["sh", "-c", script])
			.start()
			.unwrap();

		assert!(child.wait().unwrap().success());
	}
}
