use std::sync::atomic::{AtomicU8, Ordering};

const IDLE: u8 = 0;
const BUSY: u8 = 1;

/// Per-worker busy/idle accounting, indexed by worker id minus one.
///
/// Workers flip their slot around task execution; the pool exposes the
/// aggregate for status reporting.
pub struct Timekeeper {
	states: Vec<AtomicU8>,
}

impl Timekeeper {
	pub fn new(workers: usize) -> Self {
		Timekeeper {
			states: (0..workers).map(|_| AtomicU8::new(IDLE)).collect(),
		}
	}

	pub fn busy(&self, index: usize) {
		if let Some(state) = self.states.get(index) {
			state.store(BUSY, Ordering::Release);
		}
	}

	pub fn idle(&self, index: usize) {
		if let Some(state) = self.states.get(index) {
			state.store(IDLE, Ordering::Release);
		}
	}

	/// The number of workers currently executing a task.
	pub fn busy_count(&self) -> usize {
		self.states.iter().filter(|s| s.load(Ordering::Acquire) == BUSY).count()
	}
}
