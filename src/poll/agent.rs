use crate::itm::Item;
use crate::poll::dns;
use crate::poll::result::{completion, CheckError, CheckFuture};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpSocket, TcpStream};

/// Marker prefix an agent puts in front of a reply it cannot serve.
const NOTSUPPORTED_MARKER: &str = "NOTSUPPORTED";

/// Dispatches an asynchronous agent check.
///
/// Misconfigured items fail synchronously with a typed error; everything
/// past that point surfaces through the returned future.
pub(crate) fn dispatch(
	item: Item,
	timeout: Duration,
	source_ip: Option<IpAddr>,
) -> Result<CheckFuture, (Item, CheckError)> {
	if item.interface.addr.is_empty() {
		return Err((item, CheckError::config("item has no interface address")));
	}
	if item.key.is_empty() {
		return Err((item, CheckError::config("item key is empty")));
	}
	Ok(Box::pin(async move {
		let outcome = exchange(&item, timeout, source_ip).await;
		completion(item, outcome)
	}))
}

async fn exchange(
	item: &Item,
	timeout: Duration,
	source_ip: Option<IpAddr>,
) -> Result<String, CheckError> {
	let addr = dns::resolve(&item.interface.addr, item.interface.port, timeout).await?;
	match tokio::time::timeout(timeout, request(item, addr, source_ip)).await {
		Err(_) => Err(CheckError::timeout(format!(
			"agent check timed out after {} seconds",
			timeout.as_secs()
		))),
		Ok(outcome) => outcome,
	}
}

async fn connect(addr: SocketAddr, source_ip: Option<IpAddr>) -> Result<TcpStream, CheckError> {
	let socket = match addr {
		SocketAddr::V4(_) => TcpSocket::new_v4(),
		SocketAddr::V6(_) => TcpSocket::new_v6(),
	}
	.map_err(|e| CheckError::network(format!("cannot create socket: {e}")))?;
	if let Some(ip) = source_ip {
		socket
			.bind(SocketAddr::new(ip, 0))
			.map_err(|e| CheckError::network(format!("cannot bind source address {ip}: {e}")))?;
	}
	socket
		.connect(addr)
		.await
		.map_err(|e| CheckError::network(format!("cannot connect to [{addr}]: {e}")))
}

/// One request/reply exchange: the item key out, a single reply line back.
async fn request(
	item: &Item,
	addr: SocketAddr,
	source_ip: Option<IpAddr>,
) -> Result<String, CheckError> {
	let mut stream = connect(addr, source_ip).await?;
	stream
		.write_all(format!("{}\n", item.key).as_bytes())
		.await
		.map_err(|e| CheckError::network(format!("cannot send request to [{addr}]: {e}")))?;
	let mut reply = String::new();
	BufReader::new(&mut stream)
		.read_line(&mut reply)
		.await
		.map_err(|e| CheckError::network(format!("cannot read response from [{addr}]: {e}")))?;
	decode_reply(reply)
}

/// Splits agent-level failures out of the reply text; the full value
/// decoding belongs to the external protocol decoder.
fn decode_reply(reply: String) -> Result<String, CheckError> {
	let text = reply.trim_end_matches(['\r', '\n']);
	if text.is_empty() {
		return Err(CheckError::network("connection closed without a response"));
	}
	if let Some(rest) = text.strip_prefix(NOTSUPPORTED_MARKER) {
		let detail = rest.trim_start_matches([':', ' ']);
		if detail.is_empty() {
			return Err(CheckError::agent("item is not supported by the agent"));
		}
		return Err(CheckError::agent(detail));
	}
	Ok(text.to_string())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::val::ErrCode;

	#[test]
	fn reply_decoding() {
		assert_eq!(decode_reply("1.23\n".to_string()).expect("value"), "1.23");
		let err = decode_reply("NOTSUPPORTED: no such key\n".to_string()).expect_err("error");
		assert_eq!(err.errcode, ErrCode::AgentError);
		assert_eq!(err.msg, "no such key");
		let err = decode_reply(String::new()).expect_err("error");
		assert_eq!(err.errcode, ErrCode::NetworkError);
	}
}
