use crate::cfg::MemCache;
use crate::ipc::{availability_channel, rtc_channel, AvailabilityReceiver, RtcCommand};
use crate::itm::{Availability, Interface, InterfaceKind, Item, ItemType};
use crate::poll::result::CheckCompletion;
use crate::poll::{Poller, PollerOptions, PollerType};
use crate::pre::Preprocessor;
use crate::val::{CheckResult, ErrCode, ItemState, ProcessedValue, Value, ValueType};
use futures::stream::FuturesUnordered;
use serial_test::serial;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

/// A fake agent accepting connections and answering every request line with
/// a fixed reply after an optional delay.
async fn fake_agent(reply: &'static str, delay: Duration) -> SocketAddr {
	let listener = TcpListener::bind("127.0.0.1:0").await.expect("listener");
	let addr = listener.local_addr().expect("listener address");
	tokio::spawn(async move {
		while let Ok((mut stream, _)) = listener.accept().await {
			tokio::spawn(async move {
				let mut key = String::new();
				let (read, mut write) = stream.split();
				if BufReader::new(read).read_line(&mut key).await.is_ok() {
					tokio::time::sleep(delay).await;
					write.write_all(reply.as_bytes()).await.ok();
				}
			});
		}
	});
	addr
}

fn interface(interfaceid: u64, addr: &SocketAddr) -> Interface {
	Interface {
		interfaceid,
		kind: InterfaceKind::Agent,
		addr: addr.ip().to_string(),
		port: addr.port(),
		available: Availability::Up,
		errors_from: 0,
		disable_until: 0,
	}
}

fn agent_item(itemid: u64, interface: Interface) -> Item {
	let mut item = Item::new(itemid, 1, "web-1", interface);
	item.item_type = ItemType::Agent;
	item.value_type = ValueType::Text;
	item.key_orig = "system.cpu.load".to_string();
	item
}

struct Harness {
	cache: Arc<MemCache>,
	preproc: Preprocessor,
	values: channel::Receiver<ProcessedValue>,
	avail: AvailabilityReceiver,
	rtc: channel::Sender<RtcCommand>,
	poller: Poller<MemCache>,
}

fn harness(poller_type: PollerType, opts: PollerOptions) -> Harness {
	let cache = Arc::new(MemCache::new());
	let (preproc, values) = Preprocessor::start(2).expect("pool start");
	let (avail_tx, avail) = availability_channel();
	let (rtc, rtc_rx) = rtc_channel();
	let poller = Poller::new(
		poller_type,
		opts,
		cache.clone(),
		preproc.clone(),
		avail_tx,
		rtc_rx,
	)
	.expect("poller init");
	Harness {
		cache,
		preproc,
		values,
		avail,
		rtc,
		poller,
	}
}

async fn recv_value(rx: &channel::Receiver<ProcessedValue>) -> ProcessedValue {
	tokio::time::timeout(Duration::from_secs(10), rx.recv())
		.await
		.expect("timed out waiting for a processed value")
		.expect("processed value stream closed")
}

#[test_log::test(tokio::test)]
#[serial]
async fn clean_agent_poll() {
	let addr = fake_agent("1.23\n", Duration::ZERO).await;
	let h = harness(PollerType::Agent, PollerOptions::default());
	h.cache.insert(agent_item(42, interface(5, &addr)), 60);
	let run = tokio::spawn(h.poller.run());
	let value = recv_value(&h.values).await;
	assert_eq!(value.itemid, 42);
	assert_eq!(value.state, ItemState::Normal);
	assert_eq!(value.value, Some(Value::Str("1.23".to_string())));
	assert_eq!(value.error, None);
	h.rtc.send(RtcCommand::Shutdown).await.expect("rtc send");
	tokio::time::timeout(Duration::from_secs(10), run)
		.await
		.expect("poller did not stop")
		.expect("poller task")
		.expect("poller run");
	let log = h.cache.requeue_log();
	assert_eq!(log[0].0, 42);
	assert_eq!(log[0].2, ErrCode::Succeed);
	// A clean success on a healthy interface leaves no availability trace
	assert!(h.avail.try_recv().is_err());
	h.preproc.stop();
}

#[test_log::test(tokio::test)]
#[serial]
async fn shutdown_drains_in_flight_checks() {
	let addr = fake_agent("ok\n", Duration::from_millis(500)).await;
	let h = harness(PollerType::Agent, PollerOptions::default());
	for itemid in 1..=3 {
		h.cache.insert(agent_item(itemid, interface(itemid, &addr)), 60);
	}
	let run = tokio::spawn(h.poller.run());
	// Wait until the dispatch cycle has picked the items up
	while h.cache.poll_calls() == 0 {
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	h.rtc.send(RtcCommand::Shutdown).await.expect("rtc send");
	tokio::time::timeout(Duration::from_secs(10), run)
		.await
		.expect("poller did not stop")
		.expect("poller task")
		.expect("poller run");
	let calls_after_shutdown = h.cache.poll_calls();
	// Every in-flight check completed during the drain
	let log = h.cache.requeue_log();
	assert_eq!(log.len(), 3);
	assert!(log.iter().all(|(_, _, errcode)| *errcode == ErrCode::Succeed));
	for _ in 0..3 {
		let value = recv_value(&h.values).await;
		assert_eq!(value.state, ItemState::Normal);
	}
	// No further cache queries once the poller has terminated
	tokio::time::sleep(Duration::from_millis(100)).await;
	assert_eq!(h.cache.poll_calls(), calls_after_shutdown);
	h.preproc.stop();
}

#[test_log::test(tokio::test)]
#[serial]
async fn config_error_is_isolated_to_the_item() {
	let h = harness(PollerType::Agent, PollerOptions::default());
	let mut iface = interface(9, &"127.0.0.1:10050".parse().expect("addr"));
	iface.addr = String::new();
	h.cache.insert(agent_item(11, iface), 60);
	let run = tokio::spawn(h.poller.run());
	let value = recv_value(&h.values).await;
	assert_eq!(value.itemid, 11);
	assert_eq!(value.state, ItemState::NotSupported);
	assert_eq!(value.error.as_deref(), Some("item has no interface address"));
	h.rtc.send(RtcCommand::Shutdown).await.expect("rtc send");
	run.await.expect("poller task").expect("poller run");
	let log = h.cache.requeue_log();
	assert_eq!(log[0].0, 11);
	assert_eq!(log[0].2, ErrCode::ConfigError);
	// The interface map was never touched
	assert!(h.avail.try_recv().is_err());
	h.preproc.stop();
}

#[test_log::test(tokio::test)]
#[serial]
async fn timeout_opens_the_availability_error_window() {
	// An agent that never replies within the timeout
	let addr = fake_agent("late\n", Duration::from_secs(30)).await;
	let opts = PollerOptions {
		timeout: Duration::from_millis(200),
		..PollerOptions::default()
	};
	let h = harness(PollerType::Agent, opts);
	h.cache.insert(agent_item(7, interface(3, &addr)), 60);
	let run = tokio::spawn(h.poller.run());
	let value = recv_value(&h.values).await;
	assert_eq!(value.state, ItemState::NotSupported);
	let message = tokio::time::timeout(Duration::from_secs(10), h.avail.recv())
		.await
		.expect("timed out waiting for availability")
		.expect("availability channel closed");
	let diffs = message.unpack();
	assert_eq!(diffs.len(), 1);
	assert_eq!(diffs[0].interfaceid, 3);
	assert_ne!(diffs[0].errors_from, 0);
	h.rtc.send(RtcCommand::Shutdown).await.expect("rtc send");
	run.await.expect("poller task").expect("poller run");
	let log = h.cache.requeue_log();
	assert_eq!(log[0].2, ErrCode::TimeoutError);
	h.preproc.stop();
}

#[test]
fn requeue_vectors_stay_parallel_and_processing_returns_to_zero() {
	let h = harness(PollerType::Agent, PollerOptions::default());
	let mut poller = h.poller;
	poller.processing = 2;
	let addr = "192.0.2.1:10050".parse().expect("addr");
	poller.process_async_result(CheckCompletion {
		item: agent_item(1, interface(5, &addr)),
		errcode: ErrCode::TimeoutError,
		result: CheckResult::msg("timed out"),
	});
	poller.process_async_result(CheckCompletion {
		item: agent_item(2, interface(6, &addr)),
		errcode: ErrCode::Succeed,
		result: CheckResult::text("1"),
	});
	assert_eq!(poller.itemids.len(), 2);
	assert_eq!(poller.lastclocks.len(), 2);
	assert_eq!(poller.errcodes.len(), 2);
	assert_eq!(poller.processing, 0);
	assert_eq!(poller.processed, 2);
	h.preproc.stop();
}

#[test]
fn last_upsert_wins_per_interface() {
	let h = harness(PollerType::Agent, PollerOptions::default());
	let mut poller = h.poller;
	poller.processing = 2;
	let addr = "192.0.2.1:10050".parse().expect("addr");
	// Two items share one interface; the first times out
	poller.process_async_result(CheckCompletion {
		item: agent_item(1, interface(5, &addr)),
		errcode: ErrCode::TimeoutError,
		result: CheckResult::msg("timed out"),
	});
	// The second succeeds on a previously-failing interface snapshot
	let mut recovering = interface(5, &addr);
	recovering.errors_from = 100;
	poller.process_async_result(CheckCompletion {
		item: agent_item(2, recovering),
		errcode: ErrCode::Succeed,
		result: CheckResult::text("1"),
	});
	// One entry per interface per cycle, reflecting the last outcome
	assert_eq!(poller.interfaces.len(), 1);
	let status = poller.interfaces.values().next().expect("interface status");
	assert_eq!(status.errcode, ErrCode::Succeed);
	assert_eq!(status.itemid, 2);
	// Draining the map reactivates the interface and clears it
	poller.update_interfaces();
	assert!(poller.interfaces.is_empty());
	let message = h.avail.try_recv().expect("availability message");
	let diffs = message.unpack();
	assert_eq!(diffs.len(), 1);
	assert_eq!(diffs[0].available, Availability::Up);
	assert_eq!(diffs[0].errors_from, 0);
	h.preproc.stop();
}

#[test]
fn clean_success_keeps_the_interface_map_empty() {
	let h = harness(PollerType::Agent, PollerOptions::default());
	let mut poller = h.poller;
	poller.processing = 1;
	let addr = "192.0.2.1:10050".parse().expect("addr");
	poller.process_async_result(CheckCompletion {
		item: agent_item(1, interface(5, &addr)),
		errcode: ErrCode::Succeed,
		result: CheckResult::text("1"),
	});
	assert!(poller.interfaces.is_empty());
	h.preproc.stop();
}

#[test]
fn dispatch_cap_is_never_exceeded() {
	let addr = "127.0.0.1:10050".parse().expect("addr");
	let opts = PollerOptions {
		max_concurrent_checks: 3,
		..PollerOptions::default()
	};
	let h = harness(PollerType::Agent, opts);
	for itemid in 1..=10 {
		h.cache.insert(agent_item(itemid, interface(itemid, &addr)), 60);
	}
	let mut poller = h.poller;
	poller.processing = 2;
	let mut inflight = FuturesUnordered::new();
	poller.dispatch_cycle(&mut inflight);
	// Two checks already in flight leave room for exactly one more
	assert_eq!(inflight.len(), 1);
	assert_eq!(poller.processing, 3);
	h.preproc.stop();
}

#[test_log::test(tokio::test)]
#[serial]
#[cfg(feature = "http")]
async fn http_poll_round_trip() {
	let listener = TcpListener::bind("127.0.0.1:0").await.expect("listener");
	let addr = listener.local_addr().expect("listener address");
	tokio::spawn(async move {
		while let Ok((mut stream, _)) = listener.accept().await {
			tokio::spawn(async move {
				use tokio::io::AsyncReadExt;
				let mut buf = vec![0u8; 1024];
				stream.read(&mut buf).await.ok();
				let body = r#"{"status":"ok"}"#;
				let response = format!(
					"HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
					body.len()
				);
				stream.write_all(response.as_bytes()).await.ok();
			});
		}
	});
	let h = harness(PollerType::Http, PollerOptions::default());
	let mut item = agent_item(55, interface(4, &addr));
	item.item_type = ItemType::Http;
	item.url = format!("http://{addr}/health");
	item.status_codes = "200".to_string();
	h.cache.insert(item, 60);
	let run = tokio::spawn(h.poller.run());
	let value = recv_value(&h.values).await;
	assert_eq!(value.itemid, 55);
	assert_eq!(value.state, ItemState::Normal);
	assert_eq!(value.value, Some(Value::Str(r#"{"status":"ok"}"#.to_string())));
	h.rtc.send(RtcCommand::Shutdown).await.expect("rtc send");
	run.await.expect("poller task").expect("poller run");
	h.preproc.stop();
}

#[test_log::test(tokio::test)]
#[serial]
#[cfg(feature = "snmp")]
async fn snmp_poll_round_trip() {
	// A fake responder speaking the decoder-boundary datagram exchange
	let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.expect("socket");
	let addr = socket.local_addr().expect("socket address");
	tokio::spawn(async move {
		let mut buf = vec![0u8; 1024];
		while let Ok((received, peer)) = socket.recv_from(&mut buf).await {
			let request = String::from_utf8_lossy(&buf[..received]).to_string();
			let id = request.split_whitespace().nth(1).unwrap_or("0").to_string();
			socket.send_to(format!("VALUE {id} 24798").as_bytes(), peer).await.ok();
		}
	});
	let h = harness(PollerType::Snmp, PollerOptions::default());
	let mut iface = interface(8, &addr);
	iface.kind = InterfaceKind::Snmp;
	let mut item = agent_item(77, iface);
	item.item_type = ItemType::Snmp;
	item.snmp_oid = "1.3.6.1.2.1.1.3.0".to_string();
	item.snmp_community = "public".to_string();
	h.cache.insert(item, 60);
	let run = tokio::spawn(h.poller.run());
	let value = recv_value(&h.values).await;
	assert_eq!(value.itemid, 77);
	assert_eq!(value.state, ItemState::Normal);
	assert_eq!(value.value, Some(Value::Str("24798".to_string())));
	h.rtc.send(RtcCommand::Shutdown).await.expect("rtc send");
	run.await.expect("poller task").expect("poller run");
	h.preproc.stop();
}

#[test]
#[cfg(feature = "snmp")]
fn snmp_cache_reload_waits_for_the_drain() {
	let h = harness(PollerType::Snmp, PollerOptions::default());
	let mut poller = h.poller;
	poller.clear_snmp_cache = true;
	poller.processing = 1;
	let mut inflight = FuturesUnordered::new();
	// The cache cannot be cleared while checks are in flight
	assert_eq!(poller.dispatch_cycle(&mut inflight), 0);
	assert!(poller.clear_snmp_cache);
	assert_eq!(h.cache.poll_calls(), 0);
	// Once drained, the cache is cleared and dispatch resumes
	poller.processing = 0;
	poller.dispatch_cycle(&mut inflight);
	assert!(!poller.clear_snmp_cache);
	assert_eq!(h.cache.poll_calls(), 1);
	h.preproc.stop();
}
