use crate::itm::Item;
use crate::poll::PollerType;
use crate::val::{ErrCode, Timespec};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

const TARGET: &str = "sentinel::core::cfg";

/// The configuration cache a poller draws its work from.
///
/// The authoritative cache lives outside this crate; pollers consume it
/// through this trait. Implementations must hand out owned item snapshots
/// and accept requeue batches from the reactor thread.
pub trait ConfigCache: Send + Sync + 'static {
	/// Returns up to `cap - in_flight` items of the given poller type that
	/// are due at `now`, transferring ownership of the snapshots. Items
	/// without their own timeout inherit `timeout`.
	fn poller_items(
		&self,
		poller_type: PollerType,
		timeout: Duration,
		now: &Timespec,
		in_flight: usize,
		cap: usize,
	) -> Vec<Item>;

	/// Prepares items for dispatch, expanding macros in place. Returns one
	/// outcome per item; an error marks the item as misconfigured.
	fn prepare_items(&self, items: &mut [Item]) -> Vec<Result<(), String>>;

	/// Hands a finished batch back for rescheduling and returns the earliest
	/// next-check time of the poller type, if any item is queued.
	fn requeue_items(
		&self,
		itemids: &[u64],
		lastclocks: &[i64],
		errcodes: &[ErrCode],
		poller_type: PollerType,
	) -> Option<i64>;
}

struct Slot {
	item: Item,
	delay: i64,
	nextcheck: i64,
	polling: bool,
}

/// An in-memory configuration cache.
///
/// This is the default backend for embedders without an external cache and
/// the fixture the scenario tests run against. Scheduling is plain
/// next-check bookkeeping: an item is due when its next-check time has
/// passed and its interface is not temporarily disabled.
#[derive(Default)]
pub struct MemCache {
	slots: Mutex<HashMap<u64, Slot>>,
	poll_calls: AtomicUsize,
	requeued: Mutex<Vec<(u64, i64, ErrCode)>>,
}

impl MemCache {
	pub fn new() -> Self {
		MemCache::default()
	}

	/// Adds an item to the cache with the given polling delay in seconds.
	/// The item is due immediately.
	pub fn insert(&self, item: Item, delay: i64) {
		let mut slots = lock(&self.slots);
		slots.insert(
			item.itemid,
			Slot {
				item,
				delay,
				nextcheck: 0,
				polling: false,
			},
		);
	}

	/// How many times items were handed out to a poller.
	pub fn poll_calls(&self) -> usize {
		self.poll_calls.load(Ordering::Acquire)
	}

	/// The requeue log as `(itemid, lastclock, errcode)` tuples, in arrival order.
	pub fn requeue_log(&self) -> Vec<(u64, i64, ErrCode)> {
		lock(&self.requeued).clone()
	}
}

// Poisoned locks are recovered; cache operations stay infallible
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ConfigCache for MemCache {
	fn poller_items(
		&self,
		poller_type: PollerType,
		_timeout: Duration,
		now: &Timespec,
		in_flight: usize,
		cap: usize,
	) -> Vec<Item> {
		self.poll_calls.fetch_add(1, Ordering::AcqRel);
		let num = cap.saturating_sub(in_flight);
		let mut out = Vec::new();
		let mut slots = lock(&self.slots);
		for slot in slots.values_mut() {
			if out.len() >= num {
				break;
			}
			if slot.polling || poller_type != PollerType::from(slot.item.item_type) {
				continue;
			}
			if slot.nextcheck > now.sec || slot.item.interface.disable_until > now.sec {
				continue;
			}
			slot.polling = true;
			out.push(slot.item.clone());
		}
		trace!(target: TARGET, "Handing out {} items to {} poller", out.len(), poller_type);
		out
	}

	fn prepare_items(&self, items: &mut [Item]) -> Vec<Result<(), String>> {
		items
			.iter_mut()
			.map(|item| {
				// Expand the supported host macros into the effective key
				let mut key = item.key_orig.clone();
				key = key.replace("{HOST.HOST}", &item.host);
				key = key.replace("{HOST.CONN}", &item.interface.addr);
				if key.contains("{HOST.") {
					return Err(format!("cannot expand macros in item key \"{}\"", item.key_orig));
				}
				item.key = key;
				Ok(())
			})
			.collect()
	}

	fn requeue_items(
		&self,
		itemids: &[u64],
		lastclocks: &[i64],
		errcodes: &[ErrCode],
		poller_type: PollerType,
	) -> Option<i64> {
		let mut slots = lock(&self.slots);
		let mut log = lock(&self.requeued);
		for ((itemid, lastclock), errcode) in itemids.iter().zip(lastclocks).zip(errcodes) {
			log.push((*itemid, *lastclock, *errcode));
			if let Some(slot) = slots.get_mut(itemid) {
				slot.polling = false;
				slot.nextcheck = lastclock + slot.delay;
			}
		}
		// Report the earliest pending next-check of this poller type
		slots
			.values()
			.filter(|s| !s.polling && poller_type == PollerType::from(s.item.item_type))
			.map(|s| s.nextcheck)
			.min()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::itm::{Availability, Interface, InterfaceKind, ItemType};

	const TIMEOUT: Duration = Duration::from_secs(3);

	fn interface() -> Interface {
		Interface {
			interfaceid: 1,
			kind: InterfaceKind::Agent,
			addr: "127.0.0.1".to_string(),
			port: 10050,
			available: Availability::Up,
			errors_from: 0,
			disable_until: 0,
		}
	}

	#[test]
	fn due_items_are_handed_out_once() {
		let cache = MemCache::new();
		let mut item = Item::new(1, 10, "web-1", interface());
		item.item_type = ItemType::Agent;
		item.key_orig = "agent.ping".to_string();
		cache.insert(item, 60);
		let now = Timespec::new(100);
		let batch = cache.poller_items(PollerType::Agent, TIMEOUT, &now, 0, 10);
		assert_eq!(batch.len(), 1);
		// The item is in flight until requeued
		assert!(cache.poller_items(PollerType::Agent, TIMEOUT, &now, 0, 10).is_empty());
		cache.requeue_items(&[1], &[100], &[ErrCode::Succeed], PollerType::Agent);
		assert!(cache.poller_items(PollerType::Agent, TIMEOUT, &now, 0, 10).is_empty());
		let later = Timespec::new(161);
		assert_eq!(cache.poller_items(PollerType::Agent, TIMEOUT, &later, 0, 10).len(), 1);
	}

	#[test]
	fn capacity_reduced_by_in_flight_checks() {
		let cache = MemCache::new();
		for id in 1..=5 {
			let mut item = Item::new(id, 10, "web-1", interface());
			item.key_orig = "agent.ping".to_string();
			cache.insert(item, 60);
		}
		let now = Timespec::new(100);
		assert_eq!(cache.poller_items(PollerType::Agent, TIMEOUT, &now, 3, 4).len(), 1);
	}

	#[test]
	fn macro_expansion() {
		let cache = MemCache::new();
		let mut items = vec![Item::new(1, 10, "web-1", interface())];
		items[0].key_orig = "net.tcp.service[{HOST.CONN}]".to_string();
		let prepared = cache.prepare_items(&mut items);
		assert!(prepared[0].is_ok());
		assert_eq!(items[0].key, "net.tcp.service[127.0.0.1]");
		items[0].key_orig = "vfs.fs.size[{HOST.NAME}]".to_string();
		let prepared = cache.prepare_items(&mut items);
		assert!(prepared[0].is_err());
	}
}
