//! This library lets a network server replace itself with a new process (to upgrade its binary or reload its configuration, for example) without ever closing its listening sockets, so no connection attempt is refused while the replacement starts.
//!
//! The running process spawns its successor and hands it the listening sockets through the descriptor table. The successor finds them again by address, starts accepting, and tells its predecessor to shut down.
//!
//!
//! # Usage
//!
//! Open listening sockets through a [`ListenerRegistry`]. In a successor, [`ListenerRegistry::bind`] returns the inherited listener whose address matches the request; in any other process, and for addresses the predecessor wasn't listening on, it binds a new one. Once everything has been bound, call [`ListenerRegistry::close_all`] to close inherited listeners that nobody asked for.
//!
//! To restart, pass the listeners currently in use to a [`Process`] and [start][Process::start] it. The listeners keep accepting in this process until you close them.
//!
//! Deciding *when* to restart or shut down, and telling the predecessor that the successor is ready, are up to the application. The `hello_server` demo in this crate's repository shows one way to do it with Unix signals: `SIGUSR2` starts a successor, which sends `SIGTERM` to its parent once it is accepting connections.
//!
//!
//! # Handoff contract
//!
//! A successor is started with file descriptors 0 to 2 shared with its parent, followed by the inherited listening sockets starting at descriptor 3, and with these environment variables:
//!
//! * [`INHERITED_PROCESS`] is `1`.
//! * [`INHERITED_LISTENER`] is the number of inherited listeners. It is not set if there are none.
//!
//! Any program that follows this contract can take part in a handoff, whether or not it uses this library.
//!
//!
//! # Feature flags and platform support
//!
//! This library only works on Unix-like platforms. Only TCP listeners can be handed off.
#![cfg_attr(all(
	feature = "clap",
	feature = "serde",
	feature = "tokio",
), doc = r#"

## Available feature flags

This library has the following feature flags:

* `clap`: Support parsing bind options from the command line using [`clap`]. Specifically, this adds an implementation of [`clap::Args`] for [`BindOptions`].
* `serde`: Support parsing bind options from configuration files or environment variables using [`serde`]. Specifically, this adds an implementation of [`serde::Deserialize`] to [`BindOptions`].
* `tokio`: Adds an implementation of [`Listener`] for [`tokio::net::TcpListener`], so that listeners in use by a [`tokio`] server can be handed off directly.
"#)]
//!
//!
//! # Related libraries
//!
//! * [`socket2`]: Used to inspect inherited sockets and to bind new ones.
//! * [`socket_config`](https://crates.io/crates/socket-config): Opens sockets according to user settings, including sockets inherited from systemd.

#![allow(clippy::tabs_in_doc_comments)] // This project uses tabs for indentation throughout, including in documentation examples.

#[cfg(not(unix))]
compile_error!("socket_handoff only supports Unix-like platforms");

mod addr;
pub mod errors;
mod inherit;
mod listener;
mod options;
mod process;
mod registry;
mod util;

pub use self::{
	addr::*,
	inherit::*,
	listener::*,
	options::*,
	process::*,
	registry::*,
	util::*,
};
