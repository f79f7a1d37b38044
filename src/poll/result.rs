use crate::cfg::ConfigCache;
use crate::ipc::{self, AvailabilityMessage};
use crate::itm::{Availability, Item};
use crate::poll::avail::{self, InterfaceStatus};
use crate::poll::Poller;
use crate::val::{CheckResult, ErrCode, ItemState, Timespec};
use std::future::Future;
use std::pin::Pin;

const TARGET: &str = "sentinel::core::poll";

/// The typed completion of one asynchronous check, delivered back to the
/// reactor that dispatched it.
#[derive(Debug)]
pub struct CheckCompletion {
	pub item: Item,
	pub errcode: ErrCode,
	pub result: CheckResult,
}

/// An in-flight check owned by the reactor.
pub(crate) type CheckFuture = Pin<Box<dyn Future<Output = CheckCompletion> + Send>>;

/// A check failure with its taxonomy code, raised either synchronously at
/// dispatch or from inside a check future.
#[derive(Debug)]
pub(crate) struct CheckError {
	pub errcode: ErrCode,
	pub msg: String,
}

impl CheckError {
	pub fn config(msg: impl Into<String>) -> Self {
		CheckError {
			errcode: ErrCode::ConfigError,
			msg: msg.into(),
		}
	}

	pub fn unsupported(msg: impl Into<String>) -> Self {
		CheckError {
			errcode: ErrCode::NotSupported,
			msg: msg.into(),
		}
	}

	pub fn network(msg: impl Into<String>) -> Self {
		CheckError {
			errcode: ErrCode::NetworkError,
			msg: msg.into(),
		}
	}

	pub fn timeout(msg: impl Into<String>) -> Self {
		CheckError {
			errcode: ErrCode::TimeoutError,
			msg: msg.into(),
		}
	}

	pub fn agent(msg: impl Into<String>) -> Self {
		CheckError {
			errcode: ErrCode::AgentError,
			msg: msg.into(),
		}
	}
}

/// Builds a completion from the outcome of a check exchange.
pub(crate) fn completion(item: Item, outcome: Result<String, CheckError>) -> CheckCompletion {
	match outcome {
		Ok(text) => CheckCompletion {
			item,
			errcode: ErrCode::Succeed,
			result: CheckResult::text(text),
		},
		Err(e) => CheckCompletion {
			item,
			errcode: e.errcode,
			result: CheckResult::msg(e.msg),
		},
	}
}

impl<C: ConfigCache> Poller<C> {
	/// The common result-handling path every per-protocol completion funnels
	/// into: availability bookkeeping, preprocessor hand-off and requeue
	/// accounting.
	pub(crate) fn process_async_result(&mut self, mut completion: CheckCompletion) {
		let ts = Timespec::now();
		let item = &mut completion.item;
		trace!(
			target: TARGET,
			"processing result for key \"{}\" on host \"{}\" ({})",
			item.key, item.host, completion.errcode
		);
		// A clean success on a currently-up interface with no pending
		// errors needs no availability bookkeeping
		if completion.errcode != ErrCode::Succeed
			|| item.interface.available != Availability::Up
			|| item.interface.errors_from != 0
		{
			let status = self
				.interfaces
				.entry(item.interface.interfaceid)
				.or_insert_with(|| InterfaceStatus::new(item.interface.clone()));
			status.errcode = completion.errcode;
			status.itemid = item.itemid;
			status.host = item.host.clone();
			status.key_orig = std::mem::take(&mut item.key_orig);
			status.error = None;
		}
		if completion.errcode == ErrCode::Succeed {
			self.preproc.preprocess_item_value(
				item.itemid,
				item.hostid,
				item.value_type,
				item.flags,
				completion.result.value.take(),
				ts,
				ItemState::Normal,
				None,
			);
		} else {
			self.preproc.preprocess_item_value(
				item.itemid,
				item.hostid,
				item.value_type,
				item.flags,
				None,
				ts,
				ItemState::NotSupported,
				completion.result.msg.clone(),
			);
			// The message ownership transfers into the interface status
			if let Some(status) = self.interfaces.get_mut(&item.interface.interfaceid) {
				status.error = completion.result.msg.take();
			}
		}
		self.itemids.push(item.itemid);
		self.lastclocks.push(ts.sec);
		self.errcodes.push(completion.errcode);
		self.processing = self.processing.saturating_sub(1);
		self.processed += 1;
		trace!(target: TARGET, "finished processing itemid {}", item.itemid);
	}

	/// Drains the transient interface map through the availability state
	/// machine and publishes the collected diff records as one IPC message.
	pub(crate) fn update_interfaces(&mut self) {
		if self.interfaces.is_empty() {
			return;
		}
		debug!(target: TARGET, "updating {} interface states", self.interfaces.len());
		let ts = Timespec::now();
		let mut diffs = Vec::new();
		for (_, mut status) in self.interfaces.drain() {
			match status.errcode {
				ErrCode::Succeed | ErrCode::NotSupported | ErrCode::AgentError => {
					avail::activate_item_interface(
						&mut status.interface,
						status.itemid,
						&status.host,
						&mut diffs,
					);
				}
				ErrCode::NetworkError | ErrCode::GatewayError | ErrCode::TimeoutError => {
					avail::deactivate_item_interface(
						&ts,
						&mut status,
						self.opts.unavailable_delay,
						self.opts.unreachable_period,
						self.opts.unreachable_delay,
						&mut diffs,
					);
				}
				// Per-item problem, no interface state change
				ErrCode::ConfigError => {}
				// Aborted by a signal, silent
				ErrCode::SigError => {}
			}
		}
		if !diffs.is_empty() {
			ipc::availability_send(&self.avail, AvailabilityMessage::pack(&diffs));
		}
	}
}
