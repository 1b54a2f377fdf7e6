#![forbid(unsafe_code)]

pub mod endpoint {
	use std::net::SocketAddr;

	/// Parsed `tcp://host:port` endpoint.
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct TcpEndpoint {
		pub host: String,
		pub port: u16,
	}

	impl TcpEndpoint {
		/// Returns `host:port` (host preserved, IPv6 stays bracketed).
		pub fn hostport(&self) -> String {
			format!("{}:{}", self.host, self.port)
		}

		/// Convert to `SocketAddr` only if the host is an IP literal.
		pub fn to_socket_addr_if_ip_literal(&self) -> Result<SocketAddr, String> {
			self.hostport()
				.parse()
				.map_err(|_| format!("host must be an IP literal (DNS names not supported here): {}", self.host))
		}

		/// Parse a TCP endpoint string in the form `tcp://host:port`.
		pub fn parse(s: &str) -> Result<Self, String> {
			let s = s.trim();
			if s.is_empty() {
				return Err("endpoint must be non-empty (expected tcp://host:port)".to_string());
			}

			let rest = s
				.strip_prefix("tcp://")
				.ok_or_else(|| format!("invalid endpoint (expected tcp://host:port): {s}"))?;

			if rest.contains('/') || rest.contains('?') || rest.contains('#') {
				return Err(format!(
					"invalid endpoint (expected tcp://host:port without path/query/fragment): {s}"
				));
			}

			let (host, port_str) = rest
				.rsplit_once(':')
				.ok_or_else(|| format!("invalid endpoint (missing :port, expected tcp://host:port): {s}"))?;

			let host = host.trim();
			if host.is_empty() {
				return Err(format!("invalid endpoint host (expected tcp://host:port): {s}"));
			}

			if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
				return Err(format!(
					"invalid endpoint host (IPv6 must be bracketed like tcp://[::1]:18210): {s}"
				));
			}

			let port: u16 = port_str
				.trim()
				.parse()
				.map_err(|_| format!("invalid endpoint port (expected 1..=65535): {s}"))?;

			if port == 0 {
				return Err(format!("invalid endpoint port (expected 1..=65535): {s}"));
			}

			Ok(Self {
				host: host.to_string(),
				port,
			})
		}
	}

	#[cfg(test)]
	mod tests {
		use super::*;

		#[test]
		fn parses_dns_hostname() {
			let e = TcpEndpoint::parse("tcp://beacon.example.com:443").unwrap();
			assert_eq!(e.host, "beacon.example.com");
			assert_eq!(e.port, 443);
			assert_eq!(e.hostport(), "beacon.example.com:443");
		}

		#[test]
		fn parses_ipv4() {
			let e = TcpEndpoint::parse("tcp://127.0.0.1:18210").unwrap();
			assert_eq!(e.host, "127.0.0.1");
			assert_eq!(e.port, 18210);
			assert_eq!(e.hostport(), "127.0.0.1:18210");
		}

		#[test]
		fn parses_bracketed_ipv6() {
			let e = TcpEndpoint::parse("tcp://[::1]:18210").unwrap();
			assert_eq!(e.host, "[::1]");
			assert_eq!(e.port, 18210);
		}

		#[test]
		fn rejects_unbracketed_ipv6() {
			let err = TcpEndpoint::parse("tcp://::1:18210").unwrap_err();
			assert!(err.to_lowercase().contains("ipv6"));
		}

		#[test]
		fn rejects_path_query_fragment() {
			assert!(TcpEndpoint::parse("tcp://127.0.0.1:18210/").is_err());
			assert!(TcpEndpoint::parse("tcp://127.0.0.1:18210?x=y").is_err());
			assert!(TcpEndpoint::parse("tcp://127.0.0.1:18210#frag").is_err());
		}

		#[test]
		fn rejects_port_zero_and_missing_port() {
			assert!(TcpEndpoint::parse("tcp://127.0.0.1:0").is_err());
			assert!(TcpEndpoint::parse("tcp://127.0.0.1").is_err());
		}

		#[test]
		fn to_socket_addr_if_ip_literal_accepts_ip_literals() {
			let e4 = TcpEndpoint::parse("tcp://127.0.0.1:18210").unwrap();
			assert_eq!(e4.to_socket_addr_if_ip_literal().unwrap().to_string(), "127.0.0.1:18210");

			let e6 = TcpEndpoint::parse("tcp://[::1]:18210").unwrap();
			assert_eq!(e6.to_socket_addr_if_ip_literal().unwrap().to_string(), "[::1]:18210");
		}

		#[test]
		fn to_socket_addr_if_ip_literal_rejects_dns() {
			let e = TcpEndpoint::parse("tcp://beacon.example.com:443").unwrap();
			assert!(e.to_socket_addr_if_ip_literal().is_err());
		}
	}
}
