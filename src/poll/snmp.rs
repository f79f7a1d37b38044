use crate::cnf;
use crate::itm::Item;
use crate::poll::dns;
use crate::poll::result::{completion, CheckError, CheckFuture};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;

const TARGET: &str = "sentinel::core::poll::snmp";

/// Session options re-armed when the SNMP engine cache is cleared.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SnmpOptions {
	pub max_repetitions: u32,
}

impl Default for SnmpOptions {
	fn default() -> Self {
		SnmpOptions {
			max_repetitions: *cnf::SNMP_MAX_REPETITIONS,
		}
	}
}

/// Clears the SNMP engine cache of one poller process. The cache itself
/// lives with the external SNMP decoder; this end only reports the drop.
pub(crate) fn clear_cache(process_num: usize) {
	info!(target: TARGET, "clearing SNMP engine cache on poller #{process_num}");
}

/// Dispatches an asynchronous SNMP check.
pub(crate) fn dispatch(
	item: Item,
	timeout: Duration,
	source_ip: Option<IpAddr>,
	options: SnmpOptions,
) -> Result<CheckFuture, (Item, CheckError)> {
	if item.interface.addr.is_empty() {
		return Err((item, CheckError::config("item has no interface address")));
	}
	if item.snmp_oid.is_empty() {
		return Err((item, CheckError::config("item has no SNMP OID configured")));
	}
	Ok(Box::pin(async move {
		let outcome = exchange(&item, timeout, source_ip, options).await;
		completion(item, outcome)
	}))
}

async fn exchange(
	item: &Item,
	timeout: Duration,
	source_ip: Option<IpAddr>,
	options: SnmpOptions,
) -> Result<String, CheckError> {
	let addr = dns::resolve(&item.interface.addr, item.interface.port, timeout).await?;
	match tokio::time::timeout(timeout, request(item, addr, source_ip, options)).await {
		Err(_) => Err(CheckError::timeout(format!(
			"SNMP check timed out after {} seconds",
			timeout.as_secs()
		))),
		Ok(outcome) => outcome,
	}
}

async fn request(
	item: &Item,
	addr: SocketAddr,
	source_ip: Option<IpAddr>,
	options: SnmpOptions,
) -> Result<String, CheckError> {
	let bind_addr = match (source_ip, addr) {
		(Some(ip), _) => SocketAddr::new(ip, 0),
		(None, SocketAddr::V4(_)) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
		(None, SocketAddr::V6(_)) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
	};
	let socket = UdpSocket::bind(bind_addr)
		.await
		.map_err(|e| CheckError::network(format!("cannot bind SNMP socket: {e}")))?;
	socket
		.connect(addr)
		.await
		.map_err(|e| CheckError::network(format!("cannot connect to [{addr}]: {e}")))?;
	let request_id = rand::random::<u32>();
	let pdu = encode_request(request_id, item, options);
	socket
		.send(&pdu)
		.await
		.map_err(|e| CheckError::network(format!("cannot send SNMP request to [{addr}]: {e}")))?;
	let mut buf = vec![0u8; 65535];
	let received = socket
		.recv(&mut buf)
		.await
		.map_err(|e| CheckError::network(format!("cannot read SNMP response from [{addr}]: {e}")))?;
	decode_response(request_id, &buf[..received])
}

// The real PDU codec is the external decoder's concern; this end exchanges
// a minimal request/response datagram with it.
fn encode_request(request_id: u32, item: &Item, options: SnmpOptions) -> Vec<u8> {
	format!(
		"GET {request_id} {} {} {}\n",
		item.snmp_community, item.snmp_oid, options.max_repetitions
	)
	.into_bytes()
}

fn decode_response(request_id: u32, datagram: &[u8]) -> Result<String, CheckError> {
	let text = String::from_utf8_lossy(datagram);
	let text = text.trim_end_matches(['\r', '\n']);
	let mut parts = text.splitn(3, ' ');
	let verb = parts.next().unwrap_or_default();
	let id = parts.next().and_then(|v| v.parse::<u32>().ok());
	if id != Some(request_id) {
		return Err(CheckError::agent("SNMP response id does not match the request"));
	}
	match verb {
		"VALUE" => Ok(parts.next().unwrap_or_default().to_string()),
		"NOSUCH" => Err(CheckError::unsupported("no such object on the SNMP agent")),
		"ERROR" => Err(CheckError::agent(format!(
			"SNMP agent returned an error: {}",
			parts.next().unwrap_or_default()
		))),
		_ => Err(CheckError::agent("cannot parse SNMP response")),
	}
}
