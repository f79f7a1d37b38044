use crate::err::Error;
use crate::pre::task::Task;
use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

const TARGET: &str = "sentinel::core::pre::queue";

#[derive(Default)]
struct QueueState {
	/// Tasks ready to be picked up by a worker, in arrival order.
	pending: VecDeque<Task>,
	/// Completed tasks awaiting the dispatcher, FIFO relative to push order.
	finished: VecDeque<Task>,
	/// Per-item serialization: while an item has an entry here, exactly one
	/// of its value-sequence tasks is runnable or in flight; the rest wait
	/// in the entry's FIFO.
	sequences: HashMap<u64, VecDeque<Task>>,
	/// Live worker count maintained by register/deregister.
	workers: usize,
	/// Once set, the blocking waits return immediately.
	stopped: bool,
}

/// The preprocessing task queue shared by the worker pool and the dispatcher.
///
/// All operations lock internally and are infallible; only the blocking
/// waits can fail, and only on an irrecoverable signalling fault.
#[derive(Default)]
pub struct TaskQueue {
	state: Mutex<QueueState>,
	/// Signalled when a task becomes runnable.
	new_task: Condvar,
	/// Signalled when a task finishes or the last worker deregisters.
	finished: Condvar,
}

impl TaskQueue {
	pub fn new() -> Self {
		TaskQueue::default()
	}

	fn lock(&self) -> MutexGuard<'_, QueueState> {
		// Poisoned locks are recovered; queue operations stay infallible
		self.state.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// Enqueues a new task. Value-sequence tasks of an item with an active
	/// sequence join that sequence instead of becoming runnable.
	pub fn push_pending(&self, task: Task) {
		let mut state = self.lock();
		if let Task::ValueSeq(_) = task {
			let itemid = task.itemid();
			if let Some(waiting) = state.sequences.get_mut(&itemid) {
				trace!(target: TARGET, "Queueing task behind the active sequence of item {itemid}");
				waiting.push_back(task);
				return;
			}
			state.sequences.insert(itemid, VecDeque::new());
		}
		state.pending.push_back(task);
		drop(state);
		self.new_task.notify_one();
	}

	/// Takes one runnable task, transferring ownership to the caller.
	pub fn pop_new(&self) -> Option<Task> {
		self.lock().pending.pop_front()
	}

	/// Returns a completed task and advances the item sequence it belongs
	/// to, exposing the next waiting task of that item if there is one.
	pub fn push_finished(&self, task: Task) {
		let mut state = self.lock();
		let mut notify_new = false;
		if let Task::ValueSeq(_) = task {
			let itemid = task.itemid();
			match state.sequences.get_mut(&itemid).and_then(|w| w.pop_front()) {
				Some(next) => {
					state.pending.push_back(next);
					notify_new = true;
				}
				None => {
					// The sequence has drained; retire it
					state.sequences.remove(&itemid);
				}
			}
		}
		state.finished.push_back(task);
		drop(state);
		if notify_new {
			self.new_task.notify_one();
		}
		self.finished.notify_one();
	}

	/// Drains one completed task on the dispatcher side.
	pub fn pop_finished(&self) -> Option<Task> {
		self.lock().finished.pop_front()
	}

	/// Blocks the calling worker until new work may be available or the
	/// queue shuts down. Re-checks under the lock so a wakeup between
	/// `pop_new` and this call is never lost.
	pub fn wait(&self) -> Result<(), Error> {
		let state = self.lock();
		if state.stopped || !state.pending.is_empty() {
			return Ok(());
		}
		self.new_task
			.wait(state)
			.map(|_| ())
			.map_err(|_| Error::QueueWait("task queue condition wait failed".to_string()))
	}

	/// Blocks the dispatcher until a task finishes, the pool drains or the
	/// queue shuts down.
	pub fn wait_finished(&self) -> Result<(), Error> {
		let state = self.lock();
		if state.stopped || !state.finished.is_empty() {
			return Ok(());
		}
		self.finished
			.wait(state)
			.map(|_| ())
			.map_err(|_| Error::QueueWait("task queue condition wait failed".to_string()))
	}

	/// Puts the queue into shutdown mode and wakes every waiter.
	pub fn shutdown(&self) {
		self.lock().stopped = true;
		self.new_task.notify_all();
		self.finished.notify_all();
	}

	pub fn register_worker(&self) {
		self.lock().workers += 1;
	}

	/// The last deregistering worker wakes any waiter so teardown can
	/// observe the drained pool.
	pub fn deregister_worker(&self) {
		let mut state = self.lock();
		state.workers = state.workers.saturating_sub(1);
		let last = state.workers == 0;
		drop(state);
		if last {
			self.finished.notify_all();
		}
	}

	/// The number of currently registered workers.
	pub fn workers(&self) -> usize {
		self.lock().workers
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::pre::exec::Plan;
	use crate::pre::task::ValueData;
	use crate::val::{ItemState, Timespec, Value, ValueType};
	use std::sync::Arc;

	fn seq_task(itemid: u64, sec: i64) -> Task {
		Task::ValueSeq(ValueData {
			itemid,
			hostid: 1,
			value_type: ValueType::Text,
			flags: 0,
			plan: Arc::new(Plan::default()),
			history: None,
			value: Some(Value::Uint(sec as u64)),
			ts: Timespec::new(sec),
			state: ItemState::Normal,
			error: None,
			result: None,
		})
	}

	#[test]
	fn one_runnable_task_per_item_sequence() {
		let queue = TaskQueue::new();
		queue.push_pending(seq_task(9, 1));
		queue.push_pending(seq_task(9, 2));
		queue.push_pending(seq_task(9, 3));
		// Only the sequence head is runnable
		let first = queue.pop_new().expect("head task");
		assert!(queue.pop_new().is_none());
		// Finishing the head exposes the next task of the item
		queue.push_finished(first);
		let second = queue.pop_new().expect("second task");
		assert!(queue.pop_new().is_none());
		queue.push_finished(second);
		let third = queue.pop_new().expect("third task");
		queue.push_finished(third);
		// The sequence retires once drained
		assert!(queue.pop_new().is_none());
		assert!(queue.lock().sequences.is_empty());
	}

	#[test]
	fn finished_preserves_push_order() {
		let queue = TaskQueue::new();
		queue.push_pending(seq_task(1, 1));
		queue.push_pending(seq_task(2, 2));
		let a = queue.pop_new().expect("task");
		let b = queue.pop_new().expect("task");
		queue.push_finished(b);
		queue.push_finished(a);
		assert_eq!(queue.pop_finished().map(|t| t.itemid()), Some(2));
		assert_eq!(queue.pop_finished().map(|t| t.itemid()), Some(1));
		assert!(queue.pop_finished().is_none());
	}

	#[test]
	fn independent_items_are_both_runnable() {
		let queue = TaskQueue::new();
		queue.push_pending(seq_task(1, 1));
		queue.push_pending(seq_task(2, 1));
		assert!(queue.pop_new().is_some());
		assert!(queue.pop_new().is_some());
	}

	#[test]
	fn worker_registration_counts() {
		let queue = TaskQueue::new();
		queue.register_worker();
		queue.register_worker();
		assert_eq!(queue.workers(), 2);
		queue.deregister_worker();
		queue.deregister_worker();
		assert_eq!(queue.workers(), 0);
	}
}
