use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// A wall-clock timestamp with second and nanosecond parts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timespec {
	pub sec: i64,
	pub ns: u32,
}

impl Timespec {
	/// Returns the current wall-clock time.
	pub fn now() -> Self {
		// A clock before the epoch is a deployment fault; clamp to zero
		let d = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
		Timespec {
			sec: d.as_secs() as i64,
			ns: d.subsec_nanos(),
		}
	}

	pub const fn new(sec: i64) -> Self {
		Timespec {
			sec,
			ns: 0,
		}
	}
}

/// A raw or preprocessed sample value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
	Str(String),
	Uint(u64),
	Float(f64),
}

impl Value {
	/// Renders the value as text, the form every preprocessing step starts from.
	pub fn as_text(&self) -> String {
		match self {
			Value::Str(v) => v.clone(),
			Value::Uint(v) => v.to_string(),
			Value::Float(v) => v.to_string(),
		}
	}
}

impl fmt::Display for Value {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			Value::Str(v) => f.write_str(v),
			Value::Uint(v) => write!(f, "{v}"),
			Value::Float(v) => write!(f, "{v}"),
		}
	}
}

/// The type a finished item value is normalized to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueType {
	Float,
	Character,
	Unsigned,
	#[default]
	Text,
}

/// Whether an item is collecting values normally or is not supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemState {
	Normal,
	NotSupported,
}

/// The per-item outcome of one check dispatch or completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrCode {
	/// A value was obtained.
	Succeed,
	/// The item is permanently invalid under the current configuration.
	NotSupported,
	/// The agent reported a protocol-level error.
	AgentError,
	/// Transient transport failure.
	NetworkError,
	/// An intermediate gateway failed the request.
	GatewayError,
	/// The check did not complete within the configured timeout.
	TimeoutError,
	/// Per-item misconfiguration.
	ConfigError,
	/// The check was aborted by a signal.
	SigError,
}

impl ErrCode {
	pub const fn as_str(&self) -> &'static str {
		match self {
			ErrCode::Succeed => "SUCCEED",
			ErrCode::NotSupported => "NOTSUPPORTED",
			ErrCode::AgentError => "AGENT_ERROR",
			ErrCode::NetworkError => "NETWORK_ERROR",
			ErrCode::GatewayError => "GATEWAY_ERROR",
			ErrCode::TimeoutError => "TIMEOUT_ERROR",
			ErrCode::ConfigError => "CONFIG_ERROR",
			ErrCode::SigError => "SIG_ERROR",
		}
	}
}

impl fmt::Display for ErrCode {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// The result slot a check adapter fills in: a value on success, an error
/// message otherwise. Message ownership transfers out of the result exactly
/// once during result handling.
#[derive(Debug, Clone, Default)]
pub struct CheckResult {
	pub value: Option<Value>,
	pub msg: Option<String>,
}

impl CheckResult {
	/// Creates a result holding a text value.
	pub fn text(value: impl Into<String>) -> Self {
		CheckResult {
			value: Some(Value::Str(value.into())),
			msg: None,
		}
	}

	/// Creates a result holding an error message.
	pub fn msg(msg: impl Into<String>) -> Self {
		CheckResult {
			value: None,
			msg: Some(msg.into()),
		}
	}
}

/// A raw item value handed to the preprocessor by a poller.
#[derive(Debug, Clone)]
pub struct ItemValue {
	pub itemid: u64,
	pub hostid: u64,
	pub value_type: ValueType,
	pub flags: u8,
	pub value: Option<Value>,
	pub ts: Timespec,
	pub state: ItemState,
	pub error: Option<String>,
}

/// A finished, preprocessed item value emitted to the consumer.
#[derive(Debug, Clone)]
pub struct ProcessedValue {
	pub itemid: u64,
	pub hostid: u64,
	pub value_type: ValueType,
	pub flags: u8,
	pub value: Option<Value>,
	pub ts: Timespec,
	pub state: ItemState,
	pub error: Option<String>,
}
