//! Value preprocessing: a bounded worker pool over a shared task queue.
//!
//! Pollers hand raw values to the [`Preprocessor`] facade, which buffers
//! them until flushed, turns them into tasks and feeds the queue. Worker
//! threads execute the per-item transformation plans; a dispatcher thread
//! drains finished tasks, fans dependent-item values out and emits the
//! normalized results on an outbound channel.

pub mod exec;
pub mod queue;
pub mod task;

pub(crate) mod timekeeper;
pub(crate) mod worker;

#[cfg(test)]
mod tests;

pub use exec::{ExecResult, OnFail, OpHistory, Plan, Step, StepConf, StepOutcome};
pub use task::{Task, TestReply};

use crate::cnf;
use crate::err::Error;
use crate::pre::queue::TaskQueue;
use crate::pre::task::{DependentData, TestData, ValueData};
use crate::pre::timekeeper::Timekeeper;
use crate::pre::worker::Worker;
use crate::val::{ItemState, ItemValue, ProcessedValue, Timespec, Value, ValueType};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

const TARGET: &str = "sentinel::core::pre";

/// The preprocessing configuration of one item.
#[derive(Debug, Clone, Default)]
pub struct ItemPreproc {
	pub value_type: ValueType,
	pub plan: Plan,
	/// Items deriving their values from this item's result.
	pub dependents: Vec<u64>,
}

struct RegistryEntry {
	value_type: ValueType,
	plan: Arc<Plan>,
	history: Option<Arc<Mutex<exec::OpHistory>>>,
	dependents: Vec<u64>,
}

type Registry = Arc<Mutex<HashMap<u64, RegistryEntry>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Builds the task for one buffered value: items with dependents become
/// dependent batches, stateful plans become value-sequence tasks, the rest
/// are plain value tasks.
fn make_task(registry: &Registry, value: ItemValue) -> Task {
	let reg = lock(registry);
	let (plan, history, dependents) = match reg.get(&value.itemid) {
		Some(entry) => (entry.plan.clone(), entry.history.clone(), entry.dependents.clone()),
		None => (Arc::new(Plan::default()), None, Vec::new()),
	};
	drop(reg);
	let data = ValueData {
		itemid: value.itemid,
		hostid: value.hostid,
		value_type: value.value_type,
		flags: value.flags,
		plan,
		history,
		value: value.value,
		ts: value.ts,
		state: value.state,
		error: value.error,
		result: None,
	};
	if !dependents.is_empty() {
		Task::Dependent(DependentData {
			primary: data,
			dependents,
		})
	} else if data.plan.is_stateful() {
		Task::ValueSeq(data)
	} else {
		Task::Value(data)
	}
}

struct Dispatcher {
	stop: Arc<AtomicBool>,
	handle: Option<JoinHandle<()>>,
}

struct Inner {
	queue: Arc<TaskQueue>,
	registry: Registry,
	buffer: Mutex<Vec<ItemValue>>,
	timekeeper: Arc<Timekeeper>,
	workers: Mutex<Vec<Worker>>,
	dispatcher: Mutex<Option<Dispatcher>>,
	stopped: AtomicBool,
}

/// The preprocessing facade handed to pollers.
///
/// Cheap to clone; every clone drives the same pool.
#[derive(Clone)]
pub struct Preprocessor {
	inner: Arc<Inner>,
}

impl Preprocessor {
	/// Starts the worker pool and the dispatcher.
	///
	/// Returns the facade and the stream of finished values. A worker that
	/// fails to start rolls the whole pool back.
	pub fn start(
		workers_num: usize,
	) -> Result<(Preprocessor, channel::Receiver<ProcessedValue>), Error> {
		let queue = Arc::new(TaskQueue::new());
		let registry: Registry = Arc::new(Mutex::new(HashMap::new()));
		let timekeeper = Arc::new(Timekeeper::new(workers_num));
		let (out_tx, out_rx) = channel::unbounded();
		let mut workers = Vec::with_capacity(workers_num);
		for id in 1..=workers_num {
			match Worker::start(id, queue.clone(), timekeeper.clone()) {
				Ok(worker) => workers.push(worker),
				Err(e) => {
					// Roll back the workers started so far
					for worker in workers.iter() {
						worker.stop();
					}
					queue.shutdown();
					for worker in workers.iter_mut() {
						worker.join();
					}
					return Err(e);
				}
			}
		}
		let stop = Arc::new(AtomicBool::new(false));
		let spawned = {
			let queue = queue.clone();
			let registry = registry.clone();
			let stop = stop.clone();
			std::thread::Builder::new()
				.name("preproc-dispatcher".to_string())
				.spawn(move || dispatch_loop(queue, registry, out_tx, stop))
		};
		let dispatcher = match spawned {
			Ok(handle) => handle,
			Err(e) => {
				// Roll the workers back when the dispatcher cannot start
				for worker in workers.iter() {
					worker.stop();
				}
				queue.shutdown();
				for worker in workers.iter_mut() {
					worker.join();
				}
				return Err(Error::WorkerStart(e.to_string()));
			}
		};
		info!(target: TARGET, "Started preprocessing pool with {workers_num} workers");
		let inner = Inner {
			queue,
			registry,
			buffer: Mutex::new(Vec::new()),
			timekeeper,
			workers: Mutex::new(workers),
			dispatcher: Mutex::new(Some(Dispatcher {
				stop,
				handle: Some(dispatcher),
			})),
			stopped: AtomicBool::new(false),
		};
		Ok((
			Preprocessor {
				inner: Arc::new(inner),
			},
			out_rx,
		))
	}

	/// Starts the pool with the configured default worker count.
	pub fn start_default() -> Result<(Preprocessor, channel::Receiver<ProcessedValue>), Error> {
		Preprocessor::start(*cnf::PREPROC_WORKERS)
	}

	/// Registers or replaces the preprocessing configuration of an item.
	pub fn set_item(&self, itemid: u64, config: ItemPreproc) {
		let history = config
			.plan
			.is_stateful()
			.then(|| Arc::new(Mutex::new(exec::OpHistory::default())));
		lock(&self.inner.registry).insert(
			itemid,
			RegistryEntry {
				value_type: config.value_type,
				plan: Arc::new(config.plan),
				history,
				dependents: config.dependents,
			},
		);
	}

	/// Removes the preprocessing configuration of an item.
	pub fn delete_item(&self, itemid: u64) {
		lock(&self.inner.registry).remove(&itemid);
	}

	/// Buffers one raw item value until the next flush.
	#[allow(clippy::too_many_arguments)]
	pub fn preprocess_item_value(
		&self,
		itemid: u64,
		hostid: u64,
		value_type: ValueType,
		flags: u8,
		value: Option<Value>,
		ts: Timespec,
		state: ItemState,
		error: Option<String>,
	) {
		lock(&self.inner.buffer).push(ItemValue {
			itemid,
			hostid,
			value_type,
			flags,
			value,
			ts,
			state,
			error,
		});
	}

	/// Converts the buffered values into tasks and wakes the workers.
	pub fn flush(&self) {
		let values: Vec<ItemValue> = std::mem::take(&mut *lock(&self.inner.buffer));
		if values.is_empty() {
			return;
		}
		trace!(target: TARGET, "Flushing {} buffered values", values.len());
		for value in values {
			let task = make_task(&self.inner.registry, value);
			self.inner.queue.push_pending(task);
		}
	}

	/// Runs a plan against a single value, returning the main result and
	/// the per-step intermediate results for diagnostics.
	pub fn test(
		&self,
		plan: Plan,
		value: Value,
		value_type: ValueType,
		ts: Timespec,
	) -> Result<TestReply, Error> {
		if self.inner.stopped.load(Ordering::Acquire) {
			return Err(Error::PoolStopped);
		}
		let (reply_tx, reply_rx) = channel::bounded(1);
		self.inner.queue.push_pending(Task::Test(TestData {
			plan: Arc::new(plan),
			value,
			ts,
			value_type,
			reply: reply_tx,
			result: None,
		}));
		reply_rx.recv_blocking().map_err(|_| Error::PoolStopped)
	}

	/// The number of workers currently executing a task.
	pub fn busy_workers(&self) -> usize {
		self.inner.timekeeper.busy_count()
	}

	/// Stops the pool: workers drain their current task and exit, then the
	/// dispatcher drains the finished queue and exits.
	pub fn stop(&self) {
		if self.inner.stopped.swap(true, Ordering::AcqRel) {
			return;
		}
		let mut workers = lock(&self.inner.workers);
		for worker in workers.iter() {
			worker.stop();
		}
		self.inner.queue.shutdown();
		for worker in workers.iter_mut() {
			worker.join();
		}
		drop(workers);
		if let Some(mut dispatcher) = lock(&self.inner.dispatcher).take() {
			dispatcher.stop.store(true, Ordering::Release);
			if let Some(handle) = dispatcher.handle.take() {
				if handle.join().is_err() {
					error!(target: TARGET, "Preprocessing dispatcher panicked");
				}
			}
		}
		info!(target: TARGET, "Stopped preprocessing pool");
	}
}

fn dispatch_loop(
	queue: Arc<TaskQueue>,
	registry: Registry,
	out: channel::Sender<ProcessedValue>,
	stop: Arc<AtomicBool>,
) {
	debug!(target: TARGET, "Preprocessing dispatcher started");
	loop {
		if let Some(task) = queue.pop_finished() {
			handle_finished(&queue, &registry, &out, task);
			continue;
		}
		if stop.load(Ordering::Acquire) {
			break;
		}
		if let Err(e) = queue.wait_finished() {
			warn!(target: TARGET, "{e}");
			break;
		}
	}
	debug!(target: TARGET, "Preprocessing dispatcher stopped");
}

fn handle_finished(
	queue: &Arc<TaskQueue>,
	registry: &Registry,
	out: &channel::Sender<ProcessedValue>,
	task: Task,
) {
	match task {
		Task::Test(data) => {
			if let Some(reply) = data.result {
				// The tester may have given up waiting; nothing to do then
				data.reply.try_send(reply).ok();
			}
		}
		Task::Value(data) | Task::ValueSeq(data) => emit(out, data),
		Task::Dependent(data) => {
			let shared = data
				.primary
				.result
				.as_ref()
				.and_then(|r| r.value.clone());
			let hostid = data.primary.hostid;
			let flags = data.primary.flags;
			let ts = data.primary.ts;
			emit(out, data.primary);
			// Dependent items observe the primary's finalized value
			let Some(shared) = shared else { return };
			for itemid in data.dependents {
				let value_type = lock(registry)
					.get(&itemid)
					.map(|e| e.value_type)
					.unwrap_or(ValueType::Text);
				let task = make_task(
					registry,
					ItemValue {
						itemid,
						hostid,
						value_type,
						flags,
						value: Some(shared.clone()),
						ts,
						state: ItemState::Normal,
						error: None,
					},
				);
				queue.push_pending(task);
			}
		}
	}
}

fn emit(out: &channel::Sender<ProcessedValue>, data: ValueData) {
	let result = data.result.unwrap_or_default();
	let state = match (&data.state, &result.error) {
		(ItemState::NotSupported, _) | (_, Some(_)) => ItemState::NotSupported,
		_ => ItemState::Normal,
	};
	// A discarded sample produces no output at all
	if state == ItemState::Normal && result.value.is_none() {
		return;
	}
	let finished = ProcessedValue {
		itemid: data.itemid,
		hostid: data.hostid,
		value_type: data.value_type,
		flags: data.flags,
		value: result.value,
		ts: data.ts,
		state,
		error: result.error.or(data.error),
	};
	if out.try_send(finished).is_err() {
		debug!(target: TARGET, "Processed value consumer is gone");
	}
}
