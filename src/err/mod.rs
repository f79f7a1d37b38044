use thiserror::Error;

/// Errors returned by the data-collection core.
///
/// Per-check outcomes are not represented here; they travel as
/// [`ErrCode`](crate::val::ErrCode) values inside check completions.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
	/// The poller reactor could not be constructed.
	#[error("cannot initialize poller reactor: {0}")]
	ReactorInit(String),

	/// A preprocessing worker thread could not be started.
	#[error("cannot start preprocessing worker: {0}")]
	WorkerStart(String),

	/// The task queue signalling primitives failed irrecoverably.
	#[error("task queue signalling fault: {0}")]
	QueueWait(String),

	/// The preprocessing manager was asked to test a plan but the worker
	/// pool was already shut down.
	#[error("preprocessing pool is not running")]
	PoolStopped,

	/// A generic I/O error.
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
}
