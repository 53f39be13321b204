use std::ffi::c_int;

#[cfg(doc)]
use crate::ListenerRegistry;

/// Options for binding fresh listeners, usually supplied by the user of your application.
///
/// These only affect listeners that [`ListenerRegistry::bind`] creates itself. A listener inherited from a predecessor process is returned exactly as the predecessor configured it.
#[cfg_attr(feature = "serde", doc = r#"

This structure is suitable for deserializing with [`serde`], with one caveat: it is marked with the attribute `#[serde(deny_unknown_fields)]`, and therefore must not be referenced in a field marked `#[serde(flatten)]`.
"#)]
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "clap", derive(clap::Args))]
#[cfg_attr(feature = "serde", derive(serde::Deserialize), serde(default, deny_unknown_fields))]
#[non_exhaustive]
pub struct BindOptions {
	/// Do not set the socket option `SO_REUSEADDR` on new listeners.
	///
	/// By default it is set, so that a restarted server can bind its port again while connections from the previous run are still in `TIME_WAIT`.
	#[cfg_attr(feature = "clap", arg(long))]
	pub ip_socket_no_reuse_address: bool,

	/// Set the socket option `SO_REUSEPORT`, which allows multiple processes to receive connections on the same port.
	///
	/// # Availability
	///
	/// Unix-like platforms except Solaris and illumos. Ignored elsewhere.
	#[cfg_attr(feature = "clap", arg(long))]
	pub ip_socket_reuse_port: bool,

	/// Only communicate over IPv6, not IPv4. Only meaningful for listeners bound to an IPv6 address.
	#[cfg_attr(feature = "clap", arg(long))]
	pub ip_socket_v6_only: bool,

	/// Maximum pending connections. Default is 128.
	#[cfg_attr(feature = "clap", arg(long))]
	pub listen_socket_backlog: Option<c_int>,
}

impl BindOptions {
	/// The default value used when [`BindOptions::listen_socket_backlog`] is `None`.
	pub const DEFAULT_LISTEN_SOCKET_BACKLOG: c_int = 128;

	pub(crate) fn backlog(&self) -> c_int {
		self.listen_socket_backlog.unwrap_or(Self::DEFAULT_LISTEN_SOCKET_BACKLOG)
	}
}

#[cfg(feature = "serde")]
#[test]
fn test_deserialize() {
	let options: BindOptions = serde_json::from_value(serde_json::json!({
		"ip_socket_reuse_port": true,
		"listen_socket_backlog": 1024,
	})).unwrap();

	assert!(options.ip_socket_reuse_port);
	assert!(!options.ip_socket_no_reuse_address);
	assert_eq!(options.backlog(), 1024);

	let unknown = serde_json::from_value::<BindOptions>(serde_json::json!({
		"unix_socket_owner": "nobody",
	}));
	assert!(unknown.is_err());
}

#[test]
fn test_default_backlog() {
	assert_eq!(BindOptions::default().backlog(), BindOptions::DEFAULT_LISTEN_SOCKET_BACKLOG);
}
