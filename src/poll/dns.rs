use crate::poll::result::CheckError;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Resolves an interface address asynchronously, bounded by the configured
/// check timeout. Literal IP addresses short-circuit the resolver.
pub(crate) async fn resolve(
	addr: &str,
	port: u16,
	timeout: Duration,
) -> Result<SocketAddr, CheckError> {
	if let Ok(ip) = addr.parse::<IpAddr>() {
		return Ok(SocketAddr::new(ip, port));
	}
	let lookup = tokio::net::lookup_host((addr, port));
	match tokio::time::timeout(timeout, lookup).await {
		Err(_) => Err(CheckError::timeout(format!("timed out resolving \"{addr}\""))),
		Ok(Err(e)) => Err(CheckError::network(format!("cannot resolve \"{addr}\": {e}"))),
		Ok(Ok(mut addrs)) => addrs
			.next()
			.ok_or_else(|| CheckError::network(format!("no addresses found for \"{addr}\""))),
	}
}
