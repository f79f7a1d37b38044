use crate::pre::exec::{self, ExecContext, ExecResult, OpHistory, Plan, StepOutcome};
use crate::val::{ItemState, Timespec, Value, ValueType};
use std::sync::{Arc, Mutex, PoisonError};

/// The payload shared by value, value-sequence and dependent tasks: one raw
/// sample, the plan to run over it, and the result slot filled by a worker.
#[derive(Debug)]
pub struct ValueData {
	pub itemid: u64,
	pub hostid: u64,
	pub value_type: ValueType,
	pub flags: u8,
	pub plan: Arc<Plan>,
	/// Stateful steps keep their per-item state here.
	pub history: Option<Arc<Mutex<OpHistory>>>,
	pub value: Option<Value>,
	pub ts: Timespec,
	pub state: ItemState,
	pub error: Option<String>,
	/// Filled in by the executing worker.
	pub result: Option<ExecResult>,
}

impl ValueData {
	/// Runs the plan over the sample, storing the outcome in the result slot.
	/// Unsupported samples pass through carrying their error.
	pub(crate) fn run(&mut self, ctx: &mut ExecContext) {
		let result = match (&self.state, self.value.take()) {
			(ItemState::Normal, Some(value)) => {
				let history = self.history.clone();
				let mut guard = history
					.as_ref()
					.map(|h| h.lock().unwrap_or_else(PoisonError::into_inner));
				let (result, _) = exec::execute(
					ctx,
					&self.plan,
					guard.as_deref_mut(),
					value,
					self.ts,
					self.value_type,
					false,
				);
				result
			}
			_ => ExecResult {
				value: None,
				error: self.error.clone(),
			},
		};
		self.result = Some(result);
	}
}

/// The payload of a one-shot plan test: results are reported back over the
/// reply channel together with the per-step intermediate values.
#[derive(Debug)]
pub struct TestData {
	pub plan: Arc<Plan>,
	pub value: Value,
	pub ts: Timespec,
	pub value_type: ValueType,
	pub reply: channel::Sender<TestReply>,
	pub result: Option<TestReply>,
}

/// The diagnostic outcome of a test task.
#[derive(Debug, Clone)]
pub struct TestReply {
	pub result: ExecResult,
	pub steps: Vec<StepOutcome>,
}

impl TestData {
	pub(crate) fn run(&mut self, ctx: &mut ExecContext) {
		let mut history = OpHistory::default();
		let (result, steps) = exec::execute(
			ctx,
			&self.plan,
			Some(&mut history),
			self.value.clone(),
			self.ts,
			self.value_type,
			true,
		);
		self.result = Some(TestReply {
			result,
			steps,
		});
	}
}

/// The payload of a dependent-item batch: the primary value computation and
/// the items deriving their values from its result.
#[derive(Debug)]
pub struct DependentData {
	pub primary: ValueData,
	pub dependents: Vec<u64>,
}

/// A unit of preprocessing work.
///
/// Value-sequence tasks of one item are serialized by the queue; the other
/// shapes execute in arrival order without further constraints.
#[derive(Debug)]
pub enum Task {
	Test(TestData),
	Value(ValueData),
	ValueSeq(ValueData),
	Dependent(DependentData),
}

impl Task {
	/// The item a task belongs to; test tasks have no item.
	pub fn itemid(&self) -> u64 {
		match self {
			Task::Test(_) => 0,
			Task::Value(d) | Task::ValueSeq(d) => d.itemid,
			Task::Dependent(d) => d.primary.itemid,
		}
	}

	pub(crate) fn execute(&mut self, ctx: &mut ExecContext) {
		match self {
			Task::Test(d) => d.run(ctx),
			Task::Value(d) | Task::ValueSeq(d) => d.run(ctx),
			// The dependents share the primary result computed here once
			Task::Dependent(d) => d.primary.run(ctx),
		}
	}
}
