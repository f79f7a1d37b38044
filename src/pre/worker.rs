use crate::err::Error;
use crate::pre::exec::ExecContext;
use crate::pre::queue::TaskQueue;
use crate::pre::timekeeper::Timekeeper;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

const TARGET: &str = "sentinel::core::pre::worker";

/// One preprocessing worker thread.
///
/// Worker ids are 1-based and stable for the worker's lifetime; they index
/// into the timekeeper. Stopping is cooperative: the worker exits after
/// draining its current task.
pub(crate) struct Worker {
	id: usize,
	stop: Arc<AtomicBool>,
	handle: Option<JoinHandle<()>>,
}

impl Worker {
	/// Spawns the worker thread. A failed spawn fails pool initialization.
	pub fn start(
		id: usize,
		queue: Arc<TaskQueue>,
		timekeeper: Arc<Timekeeper>,
	) -> Result<Worker, Error> {
		let stop = Arc::new(AtomicBool::new(false));
		let thread_stop = stop.clone();
		let handle = std::thread::Builder::new()
			.name(format!("preproc-worker-{id}"))
			.spawn(move || entry(id, queue, timekeeper, thread_stop))
			.map_err(|e| Error::WorkerStart(e.to_string()))?;
		Ok(Worker {
			id,
			stop,
			handle: Some(handle),
		})
	}

	pub fn stop(&self) {
		self.stop.store(true, Ordering::Release);
	}

	pub fn join(&mut self) {
		if let Some(handle) = self.handle.take() {
			if handle.join().is_err() {
				error!(target: TARGET, "Preprocessing worker #{} panicked", self.id);
			}
		}
	}
}

fn entry(id: usize, queue: Arc<TaskQueue>, timekeeper: Arc<Timekeeper>, stop: Arc<AtomicBool>) {
	debug!(target: TARGET, "Preprocessing worker #{id} started");
	let mut ctx = ExecContext::default();
	queue.register_worker();
	while !stop.load(Ordering::Acquire) {
		if let Some(mut task) = queue.pop_new() {
			timekeeper.busy(id - 1);
			trace!(target: TARGET, "[{id}] processing task for item {}", task.itemid());
			task.execute(&mut ctx);
			timekeeper.idle(id - 1);
			queue.push_finished(task);
			continue;
		}
		if let Err(e) = queue.wait() {
			warn!(target: TARGET, "[{id}] {e}");
			break;
		}
	}
	queue.deregister_worker();
	debug!(target: TARGET, "Preprocessing worker #{id} stopped");
}
