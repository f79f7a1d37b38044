use crate::cfg::ConfigCache;
use crate::cnf;
use crate::err::Error;
use crate::ipc::RtcCommand;
use crate::itm::{Item, ItemType};
use crate::poll::result::{CheckError, CheckFuture};
use crate::poll::{agent, Poller};
use crate::val::{ItemState, Timespec};
use futures::stream::{FuturesUnordered, StreamExt};
use std::time::Duration;
use tokio::time::MissedTickBehavior;

const TARGET: &str = "sentinel::core::poll";

impl<C: ConfigCache> Poller<C> {
	/// Runs the poller until an RTC shutdown, then drains the in-flight
	/// checks before releasing the reactor resources.
	///
	/// The loop interleaves the reactor with the non-reactor work of each
	/// iteration: the requeue flush and the periodic status report.
	pub async fn run(mut self) -> Result<(), Error> {
		info!(
			target: TARGET,
			"{} poller #{} started", self.poller_type, self.opts.process_num
		);
		let mut ticker = tokio::time::interval(Duration::from_secs(cnf::DISPATCH_INTERVAL));
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
		let mut inflight: FuturesUnordered<CheckFuture> = FuturesUnordered::new();
		let mut last_stat = Timespec::now().sec;
		loop {
			tokio::select! {
				_ = ticker.tick() => {
					self.dispatch_cycle(&mut inflight);
				}
				Some(completion) = inflight.next(), if !inflight.is_empty() => {
					self.process_async_result(completion);
				}
				command = self.rtc.recv() => {
					match command {
						// A closed control channel terminates like a shutdown
						Ok(RtcCommand::Shutdown) | Err(_) => break,
						Ok(RtcCommand::SnmpCacheReload) => self.request_snmp_cache_reload(),
					}
				}
			}
			if self.requeue_items() {
				// The earliest next check is already due; skip the tick wait
				ticker.reset_immediately();
			}
			self.update_status(&mut last_stat);
		}
		self.drain(inflight).await;
		Ok(())
	}

	/// One dispatch cycle: take the due items from the configuration cache,
	/// dispatch each as an in-flight asynchronous check, short-circuit the
	/// synchronous failures, then flush the preprocessor and the interface
	/// map.
	pub(crate) fn dispatch_cycle(&mut self, inflight: &mut FuturesUnordered<CheckFuture>) -> usize {
		#[cfg(feature = "snmp")]
		if self.clear_snmp_cache {
			if self.processing != 0 {
				// The cache cannot be cleared under in-flight checks;
				// retry on the next tick once the drain completes
				self.finish_cycle();
				return 0;
			}
			super::snmp::clear_cache(self.opts.process_num);
			self.snmp_opts = super::snmp::SnmpOptions::default();
			self.clear_snmp_cache = false;
		}
		let now = Timespec::now();
		let mut items = self.cache.poller_items(
			self.poller_type,
			self.opts.timeout,
			&now,
			self.processing,
			self.opts.max_concurrent_checks,
		);
		let num = items.len();
		if num == 0 {
			self.finish_cycle();
			return 0;
		}
		debug!(target: TARGET, "dispatching {num} {} checks", self.poller_type);
		let prepared = self.cache.prepare_items(&mut items);
		let ts = Timespec::now();
		for (item, prepared) in items.into_iter().zip(prepared) {
			let dispatched = match prepared {
				Ok(()) => self.dispatch_item(item),
				Err(msg) => Err((item, CheckError::config(msg))),
			};
			match dispatched {
				Ok(future) => {
					inflight.push(future);
					self.processing += 1;
				}
				Err((item, e)) => {
					// A synchronous dispatch failure is reported and
					// requeued immediately, without touching the
					// interface map
					self.preproc.preprocess_item_value(
						item.itemid,
						item.hostid,
						item.value_type,
						item.flags,
						None,
						ts,
						ItemState::NotSupported,
						Some(e.msg),
					);
					self.itemids.push(item.itemid);
					self.lastclocks.push(ts.sec);
					self.errcodes.push(e.errcode);
				}
			}
		}
		self.queued += num as u64;
		self.finish_cycle();
		num
	}

	/// Dispatches one prepared item through the adapter of its type.
	fn dispatch_item(&self, item: Item) -> Result<CheckFuture, (Item, CheckError)> {
		match item.item_type {
			ItemType::Agent => agent::dispatch(item, self.opts.timeout, self.opts.source_ip),
			ItemType::Http => {
				#[cfg(feature = "http")]
				{
					match &self.http {
						Some(client) => super::http::dispatch(item, client, self.opts.timeout),
						None => Err((
							item,
							CheckError::unsupported(
								"HTTP checks are served by a dedicated poller type",
							),
						)),
					}
				}
				#[cfg(not(feature = "http"))]
				{
					Err((
						item,
						CheckError::unsupported(
							"Support for HTTP checks was not compiled in: missing HTTP client",
						),
					))
				}
			}
			ItemType::Snmp => {
				#[cfg(feature = "snmp")]
				{
					super::snmp::dispatch(
						item,
						self.opts.timeout,
						self.opts.source_ip,
						self.snmp_opts,
					)
				}
				#[cfg(not(feature = "snmp"))]
				{
					Err((
						item,
						CheckError::unsupported("Support for SNMP checks was not compiled in"),
					))
				}
			}
		}
	}

	/// The tail of every dispatch cycle: wake the preprocessor and drain
	/// the transient interface map.
	fn finish_cycle(&mut self) {
		self.preproc.flush();
		self.update_interfaces();
	}

	/// Flushes the requeue batch to the configuration cache. Returns true
	/// when the reported next check is already due.
	fn requeue_items(&mut self) -> bool {
		if self.itemids.is_empty() {
			return false;
		}
		let nextcheck = self.cache.requeue_items(
			&self.itemids,
			&self.lastclocks,
			&self.errcodes,
			self.poller_type,
		);
		debug!(target: TARGET, "requeued {} items", self.itemids.len());
		self.itemids.clear();
		self.lastclocks.clear();
		self.errcodes.clear();
		matches!(nextcheck, Some(n) if n <= Timespec::now().sec)
	}

	fn request_snmp_cache_reload(&mut self) {
		#[cfg(feature = "snmp")]
		if self.poller_type == super::PollerType::Snmp {
			self.clear_snmp_cache = true;
		}
	}

	/// Reports the dispatch counters at most once per status interval, then
	/// resets them.
	fn update_status(&mut self, last_stat: &mut i64) {
		let now = Timespec::now().sec;
		if now - *last_stat >= cnf::STAT_INTERVAL {
			debug!(
				target: TARGET,
				"{} poller #{}: got {} values, queued {} in {} sec",
				self.poller_type,
				self.opts.process_num,
				self.processed,
				self.queued,
				now - *last_stat
			);
			self.processed = 0;
			self.queued = 0;
			*last_stat = now;
		}
	}

	/// The shutdown drain: no new dispatches, but every in-flight check is
	/// allowed to complete and its result is processed before the handles
	/// are dropped.
	async fn drain(&mut self, mut inflight: FuturesUnordered<CheckFuture>) {
		debug!(
			target: TARGET,
			"{} poller #{} draining {} in-flight checks",
			self.poller_type,
			self.opts.process_num,
			inflight.len()
		);
		while let Some(completion) = inflight.next().await {
			self.process_async_result(completion);
		}
		self.requeue_items();
		self.finish_cycle();
		info!(
			target: TARGET,
			"{} poller #{} terminated", self.poller_type, self.opts.process_num
		);
	}
}
