use crate::ipc::InterfaceDiff;
use crate::itm::{Availability, Interface};
use crate::val::{ErrCode, Timespec};

const TARGET: &str = "sentinel::core::poll::avail";

/// The per-cycle aggregation of the latest check outcome for one interface.
///
/// At most one entry exists per interface per dispatch cycle; when several
/// items touch the same interface, the last upsert wins and is treated as
/// representative of the interface during that tick.
#[derive(Debug)]
pub struct InterfaceStatus {
	pub interface: Interface,
	pub errcode: ErrCode,
	pub itemid: u64,
	pub host: String,
	pub key_orig: String,
	pub error: Option<String>,
}

impl InterfaceStatus {
	pub fn new(interface: Interface) -> Self {
		InterfaceStatus {
			interface,
			errcode: ErrCode::Succeed,
			itemid: 0,
			host: String::new(),
			key_orig: String::new(),
			error: None,
		}
	}
}

fn push_diff(diffs: &mut Vec<InterfaceDiff>, interface: &Interface, error: &str) {
	diffs.push(InterfaceDiff {
		interfaceid: interface.interfaceid,
		available: interface.available,
		errors_from: interface.errors_from,
		disable_until: interface.disable_until,
		error: error.to_string(),
	});
}

/// Restores an interface after a recognized check outcome, clearing the
/// error window. Does nothing when the interface is already up with no
/// pending errors.
pub fn activate_item_interface(
	interface: &mut Interface,
	itemid: u64,
	host: &str,
	diffs: &mut Vec<InterfaceDiff>,
) {
	if interface.available == Availability::Up && interface.errors_from == 0 {
		return;
	}
	info!(
		target: TARGET,
		"resuming {:?} checks on host \"{host}\" (itemid {itemid}): connection restored",
		interface.kind
	);
	interface.available = Availability::Up;
	interface.errors_from = 0;
	interface.disable_until = 0;
	push_diff(diffs, interface, "");
}

/// Pushes an interface further down the unavailability hysteresis after a
/// transient transport failure.
///
/// The first error opens the error window; while the window is shorter than
/// `unreachable_period` the interface is only skipped for
/// `unreachable_delay` seconds at a time; once the window reaches the
/// period, the interface is marked unavailable and skipped for
/// `unavailable_delay` seconds.
#[allow(clippy::too_many_arguments)]
pub fn deactivate_item_interface(
	ts: &Timespec,
	status: &mut InterfaceStatus,
	unavailable_delay: i64,
	unreachable_period: i64,
	unreachable_delay: i64,
	diffs: &mut Vec<InterfaceDiff>,
) {
	let interface = &mut status.interface;
	let error = status.error.as_deref().unwrap_or("");
	if interface.errors_from == 0 {
		interface.errors_from = ts.sec;
		interface.disable_until = ts.sec + unreachable_delay;
		warn!(
			target: TARGET,
			"{:?} item \"{}\" on host \"{}\" failed: first network error, wait for {} seconds",
			interface.kind, status.key_orig, status.host, unreachable_delay
		);
	} else if ts.sec - interface.errors_from >= unreachable_period {
		if interface.available != Availability::Down {
			warn!(
				target: TARGET,
				"temporarily disabling {:?} checks on host \"{}\": interface unavailable",
				interface.kind, status.host
			);
		}
		interface.available = Availability::Down;
		interface.disable_until = ts.sec + unavailable_delay;
	} else {
		interface.disable_until = ts.sec + unreachable_delay;
		warn!(
			target: TARGET,
			"{:?} item \"{}\" on host \"{}\" failed: another network error, wait for {} seconds",
			interface.kind, status.key_orig, status.host, unreachable_delay
		);
	}
	push_diff(diffs, interface, error);
}
