use crate::val::ValueType;
use serde::{Deserialize, Serialize};

/// The protocol an item is polled over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemType {
	Agent,
	Http,
	Snmp,
}

/// The protocol family of an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterfaceKind {
	Agent,
	Snmp,
}

/// The availability tri-state of an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Availability {
	Unknown,
	Up,
	Down,
}

/// An owned snapshot of a network interface through which items are polled.
///
/// The configuration cache owns the authoritative interface record; pollers
/// copy the fields they need at ingest time and never borrow into the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
	pub interfaceid: u64,
	pub kind: InterfaceKind,
	pub addr: String,
	pub port: u16,
	pub available: Availability,
	/// Timestamp of the first consecutive network error, or 0.
	pub errors_from: i64,
	/// The interface is skipped by item selection until this timestamp.
	pub disable_until: i64,
}

/// A single monitored data point definition, snapshotted for one dispatch.
///
/// Items are produced by the configuration cache when due, mutated only
/// during dispatch preparation (macro expansion) and released after result
/// processing.
#[derive(Debug, Clone)]
pub struct Item {
	pub itemid: u64,
	pub hostid: u64,
	pub host: String,
	pub interface: Interface,
	pub item_type: ItemType,
	pub value_type: ValueType,
	pub flags: u8,
	/// The effective item key after macro expansion.
	pub key: String,
	/// The original key text, kept for availability reporting.
	pub key_orig: String,
	/// HTTP items: the target URL.
	pub url: String,
	/// HTTP items: comma-separated list of acceptable status codes or ranges.
	pub status_codes: String,
	/// SNMP items: the object identifier to query.
	pub snmp_oid: String,
	/// SNMP items: the community string.
	pub snmp_community: String,
}

impl Item {
	/// Creates an item with the fields every protocol shares; the
	/// protocol-specific parameters start out empty.
	pub fn new(itemid: u64, hostid: u64, host: impl Into<String>, interface: Interface) -> Self {
		Item {
			itemid,
			hostid,
			host: host.into(),
			interface,
			item_type: ItemType::Agent,
			value_type: ValueType::Text,
			flags: 0,
			key: String::new(),
			key_orig: String::new(),
			url: String::new(),
			status_codes: String::new(),
			snmp_oid: String::new(),
			snmp_community: String::new(),
		}
	}
}
