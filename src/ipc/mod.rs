use crate::itm::Availability;
use serde::{Deserialize, Serialize};

const TARGET: &str = "sentinel::core::ipc";

/// Opcode of the availability message sent once per dispatch cycle.
pub const AVAILABILITY_REQUEST: u32 = 1;

/// Administrative commands delivered over the runtime-control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtcCommand {
	/// Terminate the poller.
	Shutdown,
	/// Clear the SNMP engine cache; SNMP pollers only, deferred until the
	/// in-flight checks have drained.
	SnmpCacheReload,
}

/// One per-interface availability change produced by the state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceDiff {
	pub interfaceid: u64,
	pub available: Availability,
	pub errors_from: i64,
	pub disable_until: i64,
	pub error: String,
}

/// The availability message: an opcode and the serialized diff records.
#[derive(Debug, Clone)]
pub struct AvailabilityMessage {
	pub opcode: u32,
	pub data: Vec<u8>,
}

impl AvailabilityMessage {
	/// Packs the diff records of one dispatch cycle into a single buffer.
	pub fn pack(diffs: &[InterfaceDiff]) -> Self {
		// Serialization of plain numeric records cannot fail
		let data = bincode::serialize(diffs).unwrap_or_default();
		AvailabilityMessage {
			opcode: AVAILABILITY_REQUEST,
			data,
		}
	}

	/// Unpacks the diff records on the receiving side of the IPC.
	pub fn unpack(&self) -> Vec<InterfaceDiff> {
		bincode::deserialize(&self.data).unwrap_or_default()
	}
}

/// Sending side of the availability IPC.
pub type AvailabilitySender = channel::Sender<AvailabilityMessage>;

/// Receiving side of the availability IPC.
pub type AvailabilityReceiver = channel::Receiver<AvailabilityMessage>;

/// Creates the availability IPC pair.
pub fn availability_channel() -> (AvailabilitySender, AvailabilityReceiver) {
	channel::unbounded()
}

/// Creates the runtime-control channel pair.
pub fn rtc_channel() -> (channel::Sender<RtcCommand>, channel::Receiver<RtcCommand>) {
	channel::unbounded()
}

/// Sends an availability message, logging when the consumer is gone.
pub fn availability_send(sender: &AvailabilitySender, message: AvailabilityMessage) {
	if sender.try_send(message).is_err() {
		warn!(target: TARGET, "Availability consumer is not receiving updates");
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn diff_records_round_trip_through_one_buffer() {
		let diffs = vec![
			InterfaceDiff {
				interfaceid: 7,
				available: Availability::Down,
				errors_from: 100,
				disable_until: 465,
				error: "timed out".to_string(),
			},
			InterfaceDiff {
				interfaceid: 9,
				available: Availability::Up,
				errors_from: 0,
				disable_until: 0,
				error: String::new(),
			},
		];
		let message = AvailabilityMessage::pack(&diffs);
		assert_eq!(message.opcode, AVAILABILITY_REQUEST);
		assert_eq!(message.unpack(), diffs);
	}
}
