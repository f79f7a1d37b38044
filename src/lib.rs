#[macro_use]
extern crate tracing;

#[macro_use]
mod mac;

#[doc(hidden)]
pub mod cnf;
pub mod cfg;
pub mod err;
pub mod ipc;
pub mod itm;
pub mod poll;
pub mod pre;
pub mod val;

/// Channels for wiring the poller to its external collaborators
pub mod channels {
	pub use channel::bounded;
	pub use channel::unbounded;
	pub use channel::Receiver;
	pub use channel::Sender;
}
