//! The asynchronous check poller: a single-threaded cooperative reactor
//! that dispatches outbound checks, tracks interface availability and hands
//! raw values to the preprocessor.

pub mod avail;

pub(crate) mod agent;
pub(crate) mod dns;
#[cfg(feature = "http")]
pub(crate) mod http;
#[cfg(feature = "snmp")]
pub(crate) mod snmp;

mod reactor;
mod result;

#[cfg(test)]
mod tests;

pub use result::CheckCompletion;

use crate::cfg::ConfigCache;
use crate::cnf;
use crate::err::Error;
use crate::ipc::{AvailabilitySender, RtcCommand};
use crate::itm::ItemType;
use crate::poll::avail::InterfaceStatus;
use crate::pre::Preprocessor;
use crate::val::ErrCode;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

/// The check protocol family a poller serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerType {
	Agent,
	Http,
	Snmp,
}

impl From<ItemType> for PollerType {
	fn from(item_type: ItemType) -> Self {
		match item_type {
			ItemType::Agent => PollerType::Agent,
			ItemType::Http => PollerType::Http,
			ItemType::Snmp => PollerType::Snmp,
		}
	}
}

impl fmt::Display for PollerType {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			PollerType::Agent => f.write_str("agent"),
			PollerType::Http => f.write_str("http agent"),
			PollerType::Snmp => f.write_str("snmp"),
		}
	}
}

/// Poller tunables, passed by value at construction and never mutated
/// afterwards.
#[derive(Debug, Clone)]
pub struct PollerOptions {
	/// Per-check network timeout.
	pub timeout: Duration,
	/// Optional local address outbound connections are bound to.
	pub source_ip: Option<IpAddr>,
	/// How long an unavailable interface is skipped.
	pub unavailable_delay: i64,
	/// How long a reachable interface is skipped after a network error.
	pub unreachable_delay: i64,
	/// How long consecutive errors may accumulate before an interface is
	/// marked unavailable.
	pub unreachable_period: i64,
	/// The in-flight check cap of this poller.
	pub max_concurrent_checks: usize,
	/// The poller's process number, for logging and cache bookkeeping.
	pub process_num: usize,
}

impl Default for PollerOptions {
	fn default() -> Self {
		PollerOptions {
			timeout: Duration::from_secs(*cnf::TIMEOUT),
			source_ip: None,
			unavailable_delay: *cnf::UNAVAILABLE_DELAY,
			unreachable_delay: *cnf::UNREACHABLE_DELAY,
			unreachable_period: *cnf::UNREACHABLE_PERIOD,
			max_concurrent_checks: *cnf::MAX_CONCURRENT_CHECKS_PER_POLLER,
			process_num: 1,
		}
	}
}

/// One poller: reactor state, dispatch counters, the requeue batch and the
/// transient per-cycle interface map.
pub struct Poller<C: ConfigCache> {
	pub(crate) poller_type: PollerType,
	pub(crate) opts: PollerOptions,
	pub(crate) cache: Arc<C>,
	pub(crate) preproc: Preprocessor,
	pub(crate) avail: AvailabilitySender,
	pub(crate) rtc: channel::Receiver<RtcCommand>,
	/// The shared HTTP client playing the role of the multi-handle.
	#[cfg(feature = "http")]
	pub(crate) http: Option<reqwest::Client>,
	/// In-flight dispatched checks with no completion yet.
	pub(crate) processing: usize,
	/// Completions handled since the last status report.
	pub(crate) processed: u64,
	/// Items queued for dispatch since the last status report.
	pub(crate) queued: u64,
	pub(crate) itemids: Vec<u64>,
	pub(crate) lastclocks: Vec<i64>,
	pub(crate) errcodes: Vec<ErrCode>,
	pub(crate) interfaces: HashMap<u64, InterfaceStatus>,
	#[cfg(feature = "snmp")]
	pub(crate) clear_snmp_cache: bool,
	#[cfg(feature = "snmp")]
	pub(crate) snmp_opts: snmp::SnmpOptions,
}

impl<C: ConfigCache> Poller<C> {
	/// Constructs a poller over its external collaborators. HTTP pollers
	/// get the shared client here; a client construction failure is fatal
	/// to startup.
	pub fn new(
		poller_type: PollerType,
		opts: PollerOptions,
		cache: Arc<C>,
		preproc: Preprocessor,
		avail: AvailabilitySender,
		rtc: channel::Receiver<RtcCommand>,
	) -> Result<Self, Error> {
		#[cfg(feature = "http")]
		let http = match poller_type {
			PollerType::Http => Some(
				reqwest::Client::builder()
					.build()
					.map_err(|e| Error::ReactorInit(e.to_string()))?,
			),
			_ => None,
		};
		Ok(Poller {
			poller_type,
			opts,
			cache,
			preproc,
			avail,
			rtc,
			#[cfg(feature = "http")]
			http,
			processing: 0,
			processed: 0,
			queued: 0,
			itemids: Vec::new(),
			lastclocks: Vec::new(),
			errcodes: Vec::new(),
			interfaces: HashMap::new(),
			#[cfg(feature = "snmp")]
			clear_snmp_cache: false,
			#[cfg(feature = "snmp")]
			snmp_opts: snmp::SnmpOptions::default(),
		})
	}
}
