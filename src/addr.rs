use crate::errors::{
	InvalidListenAddrError,
	InvalidNetworkError,
};
use std::{
	fmt::{self, Display, Formatter},
	net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6, ToSocketAddrs},
	str::FromStr,
};

#[cfg(test)]
use assert_matches::assert_matches;

/// The transport protocol family of a [`Network`] or [`NetAddr`].
///
/// Two addresses can only be [equivalent][equivalent()] if they have the same transport. `tcp4` and `tcp6` are both [`Transport::Tcp`].
#[derive(Clone, Copy, Debug, derive_more::Display, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[non_exhaustive]
pub enum Transport {
	#[display(fmt = "tcp")]
	Tcp,

	#[display(fmt = "udp")]
	Udp,

	#[display(fmt = "unix")]
	Unix,
}

/// The name of a network, as passed to [`ListenerRegistry::bind`][crate::ListenerRegistry::bind].
///
/// # Syntax
///
/// One of `tcp`, `tcp4`, `tcp6`, `udp`, `udp4`, `udp6`, or `unix`. The `4` and `6` suffixes restrict addresses, host name resolution, and wildcard binding to one IP version.
///
/// Only the TCP networks can actually be bound. The others are recognized so that an attempt to use them fails with a clear [`BindError::UnsupportedNetwork`][crate::errors::BindError::UnsupportedNetwork] instead of being silently treated as TCP.
#[derive(Clone, Copy, Debug, derive_more::Display, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[non_exhaustive]
pub enum Network {
	#[display(fmt = "tcp")]
	Tcp,

	#[display(fmt = "tcp4")]
	Tcp4,

	#[display(fmt = "tcp6")]
	Tcp6,

	#[display(fmt = "udp")]
	Udp,

	#[display(fmt = "udp4")]
	Udp4,

	#[display(fmt = "udp6")]
	Udp6,

	#[display(fmt = "unix")]
	Unix,
}

impl Network {
	/// The transport protocol family of this network.
	pub fn transport(self) -> Transport {
		match self {
			Self::Tcp | Self::Tcp4 | Self::Tcp6 => Transport::Tcp,
			Self::Udp | Self::Udp4 | Self::Udp6 => Transport::Udp,
			Self::Unix => Transport::Unix,
		}
	}

	/// Whether an IP address of this kind can be used with this network.
	fn accepts(self, ip: &IpAddr) -> bool {
		match self {
			Self::Tcp4 | Self::Udp4 => ip.is_ipv4(),
			Self::Tcp6 | Self::Udp6 => ip.is_ipv6(),
			_ => true,
		}
	}

	/// The address that an empty host binds to.
	fn wildcard(self) -> IpAddr {
		match self {
			Self::Tcp6 | Self::Udp6 => Ipv6Addr::UNSPECIFIED.into(),
			_ => Ipv4Addr::UNSPECIFIED.into(),
		}
	}
}

impl FromStr for Network {
	type Err = InvalidNetworkError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Ok(match s {
			"tcp"  => Self::Tcp ,
			"tcp4" => Self::Tcp4,
			"tcp6" => Self::Tcp6,
			"udp"  => Self::Udp ,
			"udp4" => Self::Udp4,
			"udp6" => Self::Udp6,
			"unix" => Self::Unix,
			_ => return Err(InvalidNetworkError { name: s.to_owned() }),
		})
	}
}

/// A requested address to listen on.
///
/// # Syntax
///
/// <code><var>host</var>:<var>port</var></code>, where <code><var>host</var></code> is one of:
///
/// * empty, as in `:8080`, meaning any local interface
/// * an IPv4 address, as in `127.0.0.1:8080`
/// * a bracketed IPv6 address, as in `[::1]:8080`
/// * a host name, as in `localhost:8080`, which is resolved when the address is [parsed][ListenAddr::parse]
///
/// The [`Display`] form is `:port` when the host is empty, and otherwise the standard socket address form. That string form is what [`equivalent`] compares against an inherited listener's address.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ListenAddr {
	network: Network,
	ip: Option<IpAddr>,
	port: u16,
}

impl ListenAddr {
	/// Parses `addr` for use with `network`, resolving a host name if there is one.
	pub fn parse(network: Network, addr: &str) -> Result<Self, InvalidListenAddrError> {
		let (host, port) = addr.rsplit_once(':')
			.ok_or_else(|| InvalidListenAddrError::MissingPort { addr: addr.to_owned() })?;

		let port: u16 =
			port.parse()
			.map_err(|error| InvalidListenAddrError::InvalidPort {
				addr: addr.to_owned(),
				error,
			})?;

		if host.is_empty() {
			return Ok(Self { network, ip: None, port });
		}

		if let Some(bracketed) = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
			let ip: Ipv6Addr =
				bracketed.parse()
				.map_err(|error| InvalidListenAddrError::InvalidIpv6 {
					addr: addr.to_owned(),
					error,
				})?;

			return Self::literal(network, ip.into(), port, addr);
		}

		if let Ok(ip) = IpAddr::from_str(host) {
			return Self::literal(network, ip, port, addr);
		}

		let ip: IpAddr =
			(host, port).to_socket_addrs()
			.map_err(|error| InvalidListenAddrError::Resolve {
				host: host.to_owned(),
				error,
			})?
			.map(|resolved| resolved.ip())
			.find(|ip| network.accepts(ip))
			.ok_or_else(|| InvalidListenAddrError::NoSuitableAddress { host: host.to_owned() })?;

		Ok(Self::new(network, ip, port))
	}

	fn literal(network: Network, ip: IpAddr, port: u16, addr: &str) -> Result<Self, InvalidListenAddrError> {
		if !network.accepts(&ip) {
			return Err(InvalidListenAddrError::WrongFamily {
				addr: addr.to_owned(),
				network,
			});
		}

		Ok(Self::new(network, ip, port))
	}

	/// Creates a `ListenAddr` for a specific IP address and port.
	pub fn new(network: Network, ip: IpAddr, port: u16) -> Self {
		Self { network, ip: Some(ip), port }
	}

	/// Creates a `ListenAddr` for any local interface.
	pub fn any(network: Network, port: u16) -> Self {
		Self { network, ip: None, port }
	}

	/// The network this address is for.
	pub fn network(&self) -> Network {
		self.network
	}

	/// The IP address, or `None` for any local interface.
	pub fn ip(&self) -> Option<IpAddr> {
		self.ip
	}

	/// The port number.
	pub fn port(&self) -> u16 {
		self.port
	}

	/// The concrete socket address to bind. An empty host becomes the wildcard address of the network's IP version (IPv4 unless the network is `tcp6` or `udp6`).
	pub fn socket_addr(&self) -> std::net::SocketAddr {
		let ip = self.ip.unwrap_or_else(|| self.network.wildcard());
		std::net::SocketAddr::new(ip, self.port)
	}

	/// This address as a [`NetAddr`], suitable for [`equivalent`].
	pub fn to_net_addr(&self) -> NetAddr {
		NetAddr::new(self.network.transport(), self.to_string())
	}
}

impl Display for ListenAddr {
	fn fmt(&self, f: &mut Formatter) -> fmt::Result {
		match self.ip {
			None => write!(f, ":{}", self.port),
			Some(ip) => write!(f, "{}", std::net::SocketAddr::new(ip, self.port)),
		}
	}
}

/// A network address in string form, tagged with its [`Transport`].
///
/// This is what [`equivalent`] compares. It is deliberately loose: listeners of any kind, including mock listeners in tests, can describe their address this way.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct NetAddr {
	transport: Transport,
	addr: String,
}

impl NetAddr {
	/// Creates a `NetAddr` from a transport and an address in string form.
	pub fn new(transport: Transport, addr: impl Into<String>) -> Self {
		Self { transport, addr: addr.into() }
	}

	/// The transport this address belongs to.
	pub fn transport(&self) -> Transport {
		self.transport
	}

	/// The address in string form, without the transport.
	pub fn as_str(&self) -> &str {
		&self.addr
	}
}

impl Display for NetAddr {
	fn fmt(&self, f: &mut Formatter) -> fmt::Result {
		write!(f, "{}/{}", self.transport, self.addr)
	}
}

impl From<std::net::SocketAddr> for NetAddr {
	fn from(addr: std::net::SocketAddr) -> Self {
		Self::new(Transport::Tcp, addr.to_string())
	}
}

impl From<SocketAddrV4> for NetAddr {
	fn from(addr: SocketAddrV4) -> Self {
		std::net::SocketAddr::from(addr).into()
	}
}

impl From<SocketAddrV6> for NetAddr {
	fn from(addr: SocketAddrV6) -> Self {
		std::net::SocketAddr::from(addr).into()
	}
}

/// Checks whether two addresses refer to the same listening endpoint.
///
/// Addresses with different [transports][Transport] never match. Otherwise, they match if their string forms are equal, or if they become equal after removing a leading `[::]` and then a leading `0.0.0.0` from each.
///
/// The second rule lets a socket bound to the IPv6 wildcard match a request for the IPv4 wildcard on the same port (and vice versa), and lets either match a request with an empty host like `:8080`. It is a targeted heuristic for that one mismatch, not a general comparison of IPv4 and IPv6 addresses.
pub fn equivalent(a: &NetAddr, b: &NetAddr) -> bool {
	if a.transport != b.transport {
		return false;
	}

	if a.addr == b.addr {
		return true;
	}

	strip_wildcard(&a.addr) == strip_wildcard(&b.addr)
}

fn strip_wildcard(addr: &str) -> &str {
	const IPV6_ANY: &str = "[::]";
	const IPV4_ANY: &str = "0.0.0.0";

	let addr = addr.strip_prefix(IPV6_ANY).unwrap_or(addr);
	addr.strip_prefix(IPV4_ANY).unwrap_or(addr)
}

#[test]
fn test_equivalent() {
	let tcp = |addr: &str| NetAddr::new(Transport::Tcp, addr);
	let udp = |addr: &str| NetAddr::new(Transport::Udp, addr);

	for (a, b, expected) in [
		(tcp("0.0.0.0:8080"), tcp("[::]:8080"), true),
		(tcp("[::]:8080"), tcp("0.0.0.0:8080"), true),
		(tcp("[::]:8080"), tcp(":8080"), true),
		(tcp("0.0.0.0:8080"), tcp(":8080"), true),
		(tcp("127.0.0.1:8080"), tcp("127.0.0.1:8080"), true),
		(tcp(":8080"), udp(":8080"), false),
		(tcp("0.0.0.0:8080"), tcp("0.0.0.0:8081"), false),
		(tcp("[::]:8080"), tcp(":8081"), false),
		(tcp("127.0.0.1:8080"), tcp("0.0.0.0:8080"), false),
		(tcp("[::1]:8080"), tcp("127.0.0.1:8080"), false),
	] {
		assert_eq!(equivalent(&a, &b), expected, "{a} vs {b}");
	}
}

#[test]
fn test_network_from_str() {
	assert_eq!("tcp".parse::<Network>().unwrap(), Network::Tcp);
	assert_eq!("tcp6".parse::<Network>().unwrap().transport(), Transport::Tcp);
	assert_eq!("udp4".parse::<Network>().unwrap().transport(), Transport::Udp);
	assert_eq!(Network::Unix.to_string(), "unix");

	assert_matches!(
		"sctp".parse::<Network>(),
		Err(InvalidNetworkError { name }) if name == "sctp"
	);
}

#[test]
fn test_listen_addr_parse() {
	for (network, input, expected_display, expected_bind) in [
		(Network::Tcp, ":8080", ":8080", "0.0.0.0:8080"),
		(Network::Tcp4, ":0", ":0", "0.0.0.0:0"),
		(Network::Tcp6, ":8080", ":8080", "[::]:8080"),
		(Network::Tcp, "127.0.0.1:9000", "127.0.0.1:9000", "127.0.0.1:9000"),
		(Network::Tcp, "[::]:9000", "[::]:9000", "[::]:9000"),
		(Network::Tcp, "[::1]:9000", "[::1]:9000", "[::1]:9000"),
		(Network::Tcp, "0.0.0.0:9000", "0.0.0.0:9000", "0.0.0.0:9000"),
	] {
		let addr = ListenAddr::parse(network, input).unwrap();
		assert_eq!(addr.to_string(), expected_display);
		assert_eq!(addr.socket_addr().to_string(), expected_bind);
		assert_eq!(addr.to_net_addr().transport(), Transport::Tcp);
	}
}

#[test]
fn test_listen_addr_parse_errors() {
	assert_matches!(
		ListenAddr::parse(Network::Tcp, "8080"),
		Err(InvalidListenAddrError::MissingPort { addr }) if addr == "8080"
	);

	assert_matches!(
		ListenAddr::parse(Network::Tcp, "127.0.0.1:http"),
		Err(InvalidListenAddrError::InvalidPort { .. })
	);

	assert_matches!(
		ListenAddr::parse(Network::Tcp, "127.0.0.1:70000"),
		Err(InvalidListenAddrError::InvalidPort { .. })
	);

	assert_matches!(
		ListenAddr::parse(Network::Tcp, "[not-an-ip]:80"),
		Err(InvalidListenAddrError::InvalidIpv6 { .. })
	);

	assert_matches!(
		ListenAddr::parse(Network::Tcp4, "[::1]:0"),
		Err(InvalidListenAddrError::WrongFamily { addr, network: Network::Tcp4 }) if addr == "[::1]:0"
	);

	assert_matches!(
		ListenAddr::parse(Network::Tcp6, "127.0.0.1:0"),
		Err(InvalidListenAddrError::WrongFamily { network: Network::Tcp6, .. })
	);

	// Either family is fine for plain `tcp`.
	assert!(ListenAddr::parse(Network::Tcp, "[::1]:0").is_ok());
	assert!(ListenAddr::parse(Network::Tcp, "127.0.0.1:0").is_ok());
	assert!(ListenAddr::parse(Network::Tcp6, "[::1]:0").is_ok());
}

#[test]
fn test_listen_addr_resolves_localhost() {
	let addr = ListenAddr::parse(Network::Tcp4, "localhost:0").unwrap();
	assert_eq!(addr.ip(), Some(Ipv4Addr::LOCALHOST.into()));
}
