use anyhow::Context as _;
use nix::{
	sys::signal::{kill, Signal},
	unistd::getppid,
};
use socket_handoff::{
	BindOptions,
	Inheritance,
	ListenerRegistry,
	Process,
};
use std::{
	env,
	process::Child,
};
use tokio::{
	io::{AsyncReadExt, AsyncWriteExt},
	net::{TcpListener, TcpStream},
	signal::unix::{signal, SignalKind},
	task::JoinSet,
};
use tracing_subscriber::EnvFilter;

const NO_NOTIFY_PARENT: &str = "--no-notify-parent";

/// A tiny HTTP server that answers every request with `hello <pid>`.
///
/// On `SIGUSR2`, it starts a new copy of itself and hands over its listener. The new copy sends `SIGTERM` to this one once it is accepting connections. On `SIGINT` or `SIGTERM`, it stops accepting, finishes the requests in progress, and exits.
#[derive(clap::Parser)]
struct CommandLine {
	#[command(flatten)]
	options: BindOptions,

	/// Network to listen on.
	#[arg(long, default_value = "tcp")]
	network: String,

	/// Address to listen on.
	#[arg(long, default_value = ":8080")]
	listen: String,

	/// Don't send `SIGTERM` to the parent process when ready, even if it handed over the listener. Not passed on to successors.
	#[arg(long)]
	no_notify_parent: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
	// Parse the command line options.
	let command_line = <CommandLine as clap::Parser>::parse();

	tracing_subscriber::fmt()
	.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
	.with_writer(std::io::stderr)
	.init();

	// Take over the predecessor's listener, if there is one, or bind a new one.
	let registry = ListenerRegistry::new(Inheritance::from_env(), command_line.options);

	let listener: std::net::TcpListener =
		registry.bind(&command_line.network, &command_line.listen)
		.context("couldn't open listener")?;

	// That's the only listener this program uses. Close any others.
	registry.close_all();

	// Set up the listener for use with Tokio.
	listener.set_nonblocking(true).context("couldn't configure listener for Tokio")?;
	let listener = TcpListener::from_std(listener).context("couldn't configure listener for Tokio")?;

	let mut terminate = signal(SignalKind::terminate()).context("couldn't handle SIGTERM")?;
	let mut interrupt = signal(SignalKind::interrupt()).context("couldn't handle SIGINT")?;
	let mut restart = signal(SignalKind::user_defined2()).context("couldn't handle SIGUSR2")?;

	tracing::info!(addr = %listener.local_addr()?, "accepting connections");

	// Ready. If a predecessor started this process, it can go now.
	if socket_handoff::is_successor() && !command_line.no_notify_parent {
		notify_parent();
	}

	let mut connections = JoinSet::new();
	let mut successor: Option<Child> = None;

	loop {
		tokio::select! {
			accepted = listener.accept() => match accepted {
				Ok((connection, _)) => { connections.spawn(respond(connection)); }
				Err(error) => tracing::warn!(%error, "couldn't accept a connection"),
			},

			_ = restart.recv() => start_successor(&listener, &mut successor),
			_ = terminate.recv() => break,
			_ = interrupt.recv() => break,

			Some(_) = connections.join_next(), if !connections.is_empty() => {}
		}
	}

	// Stop accepting. A successor, if any, has its own copy of the listener.
	drop(listener);

	tracing::info!(in_flight = connections.len(), "shutting down");
	while connections.join_next().await.is_some() {}

	Ok(())
}

fn notify_parent() {
	let parent = getppid();

	if parent.as_raw() <= 1 {
		tracing::warn!("predecessor is already gone");
		return;
	}

	match kill(parent, Signal::SIGTERM) {
		Ok(()) => tracing::info!(pid = parent.as_raw(), "told predecessor to shut down"),
		Err(error) => tracing::warn!(pid = parent.as_raw(), %error, "couldn't signal predecessor"),
	}
}

/// Starts a successor, unless one started earlier is still getting ready.
fn start_successor(listener: &TcpListener, pending: &mut Option<Child>) {
	if let Some(child) = pending {
		match child.try_wait() {
			Ok(None) => {
				tracing::warn!(pid = child.id(), "a successor is already starting; ignoring restart request");
				return;
			}

			Ok(Some(status)) => tracing::warn!(pid = child.id(), %status, "previous successor exited without taking over"),
			Err(error) => tracing::warn!(pid = child.id(), %error, "couldn't check on previous successor"),
		}
	}

	*pending = None;

	let program = match env::current_exe() {
		Ok(program) => program,
		Err(error) => {
			tracing::error!(%error, "couldn't find this program's executable");
			return;
		}
	};

	let started =
		Process::new(program)
		.listener(listener)
		.args(env::args_os().filter(|arg| arg.as_os_str() != NO_NOTIFY_PARENT))
		.inherit_env(true)
		.start();

	match started {
		Ok(child) => *pending = Some(child),
		Err(error) => tracing::error!(%error, "couldn't start successor; still serving"),
	}
}

async fn respond(mut connection: TcpStream) {
	let mut request = Vec::new();
	let mut buf = [0u8; 1024];

	// Read up to the end of the request headers. Anything after that is ignored.
	loop {
		match connection.read(&mut buf).await {
			Ok(0) => break,

			Ok(n) => {
				request.extend_from_slice(&buf[..n]);

				if request.windows(4).any(|window| window == b"\r\n\r\n") || request.len() > 8192 {
					break;
				}
			}

			Err(error) => {
				tracing::debug!(%error, "couldn't read request");
				return;
			}
		}
	}

	let body = format!("hello {}\n", std::process::id());

	let response = format!(
		"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
		body.len(),
	);

	if let Err(error) = connection.write_all(response.as_bytes()).await {
		tracing::debug!(%error, "couldn't write response");
		return;
	}

	let _ = connection.shutdown().await;
}
