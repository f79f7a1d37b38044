use crate::pre::{ItemPreproc, OnFail, Plan, Preprocessor, Step, StepConf};
use crate::val::{ItemState, ProcessedValue, Timespec, Value, ValueType};
use std::time::Duration;

async fn recv(rx: &channel::Receiver<ProcessedValue>) -> ProcessedValue {
	tokio::time::timeout(Duration::from_secs(5), rx.recv())
		.await
		.expect("timed out waiting for a processed value")
		.expect("processed value stream closed")
}

fn stateful_plan() -> Plan {
	Plan::new(vec![StepConf::new(Step::ThrottleDiscardUnchanged)])
}

#[test_log::test(tokio::test)]
async fn sequence_tasks_finish_in_push_order() {
	let (preproc, rx) = Preprocessor::start(4).expect("pool start");
	preproc.set_item(
		9,
		ItemPreproc {
			value_type: ValueType::Unsigned,
			plan: stateful_plan(),
			dependents: Vec::new(),
		},
	);
	for sec in 1..=3 {
		preproc.preprocess_item_value(
			9,
			1,
			ValueType::Unsigned,
			0,
			Some(Value::Uint(sec as u64)),
			Timespec::new(sec),
			ItemState::Normal,
			None,
		);
	}
	preproc.flush();
	for sec in 1..=3 {
		let finished = recv(&rx).await;
		assert_eq!(finished.itemid, 9);
		assert_eq!(finished.ts, Timespec::new(sec));
		assert_eq!(finished.value, Some(Value::Uint(sec as u64)));
	}
	preproc.stop();
}

#[test_log::test(tokio::test)]
async fn dependent_shares_the_primary_result() {
	let (preproc, rx) = Preprocessor::start(4).expect("pool start");
	preproc.set_item(
		10,
		ItemPreproc {
			value_type: ValueType::Unsigned,
			plan: Plan::new(vec![StepConf::new(Step::Multiplier(2.0))]),
			dependents: vec![20],
		},
	);
	preproc.set_item(
		20,
		ItemPreproc {
			value_type: ValueType::Unsigned,
			plan: Plan::default(),
			dependents: Vec::new(),
		},
	);
	preproc.preprocess_item_value(
		10,
		1,
		ValueType::Unsigned,
		0,
		Some(Value::Str("5".to_string())),
		Timespec::new(100),
		ItemState::Normal,
		None,
	);
	preproc.flush();
	// The primary computation ran exactly once: a second run would double again
	let primary = recv(&rx).await;
	assert_eq!(primary.itemid, 10);
	assert_eq!(primary.value, Some(Value::Uint(10)));
	let dependent = recv(&rx).await;
	assert_eq!(dependent.itemid, 20);
	assert_eq!(dependent.value, primary.value);
	assert_eq!(dependent.ts, primary.ts);
	preproc.stop();
}

#[test_log::test(tokio::test)]
async fn unsupported_values_pass_through_with_their_error() {
	let (preproc, rx) = Preprocessor::start(1).expect("pool start");
	preproc.preprocess_item_value(
		11,
		1,
		ValueType::Text,
		0,
		None,
		Timespec::new(100),
		ItemState::NotSupported,
		Some("no such key".to_string()),
	);
	preproc.flush();
	let finished = recv(&rx).await;
	assert_eq!(finished.itemid, 11);
	assert_eq!(finished.state, ItemState::NotSupported);
	assert_eq!(finished.error.as_deref(), Some("no such key"));
	assert_eq!(finished.value, None);
	preproc.stop();
}

#[test_log::test(tokio::test)]
async fn step_errors_mark_the_value_not_supported() {
	let (preproc, rx) = Preprocessor::start(2).expect("pool start");
	preproc.set_item(
		12,
		ItemPreproc {
			value_type: ValueType::Float,
			plan: Plan::new(vec![StepConf::new(Step::InRange {
				min: 0.0,
				max: 1.0,
			})]),
			dependents: Vec::new(),
		},
	);
	preproc.preprocess_item_value(
		12,
		1,
		ValueType::Float,
		0,
		Some(Value::Str("7".to_string())),
		Timespec::new(100),
		ItemState::Normal,
		None,
	);
	preproc.flush();
	let finished = recv(&rx).await;
	assert_eq!(finished.state, ItemState::NotSupported);
	assert!(finished.error.is_some());
	preproc.stop();
}

#[test_log::test(tokio::test)]
async fn discarded_samples_produce_no_output() {
	let (preproc, rx) = Preprocessor::start(1).expect("pool start");
	preproc.set_item(
		13,
		ItemPreproc {
			value_type: ValueType::Unsigned,
			plan: stateful_plan(),
			dependents: Vec::new(),
		},
	);
	for sec in [1, 2] {
		preproc.preprocess_item_value(
			13,
			1,
			ValueType::Unsigned,
			0,
			Some(Value::Uint(4)),
			Timespec::new(sec),
			ItemState::Normal,
			None,
		);
	}
	preproc.flush();
	// Only the first sample survives the throttle
	let finished = recv(&rx).await;
	assert_eq!(finished.ts, Timespec::new(1));
	assert!(tokio::time::timeout(Duration::from_millis(300), rx.recv()).await.is_err());
	preproc.stop();
}

#[test]
fn test_task_reports_intermediate_results() {
	let (preproc, _rx) = Preprocessor::start(2).expect("pool start");
	let plan = Plan::new(vec![
		StepConf::new(Step::RTrim("\n".to_string())),
		StepConf::new(Step::Multiplier(10.0)),
	]);
	let reply = preproc
		.test(plan, Value::Str("4.2\n".to_string()), ValueType::Float, Timespec::new(1))
		.expect("test reply");
	assert_eq!(reply.steps.len(), 2);
	assert_eq!(reply.steps[0].result.value, Some(Value::Str("4.2".to_string())));
	assert_eq!(reply.result.value, Some(Value::Float(42.0)));
	preproc.stop();
}

#[test]
fn failed_step_with_discard_handler_reports_discard() {
	let (preproc, _rx) = Preprocessor::start(1).expect("pool start");
	let plan = Plan::new(vec![StepConf {
		step: Step::Multiplier(2.0),
		on_fail: OnFail::Discard,
	}]);
	let reply = preproc
		.test(plan, Value::Str("not a number".to_string()), ValueType::Text, Timespec::new(1))
		.expect("test reply");
	assert_eq!(reply.result.value, None);
	assert_eq!(reply.result.error, None);
	preproc.stop();
}

#[test_log::test(tokio::test)]
async fn stop_is_honored_within_one_wait_cycle() {
	let (preproc, _rx) = Preprocessor::start(3).expect("pool start");
	// Give the workers a moment to block on the empty queue
	tokio::time::sleep(Duration::from_millis(50)).await;
	let stopped = tokio::task::spawn_blocking(move || preproc.stop());
	tokio::time::timeout(Duration::from_secs(5), stopped)
		.await
		.expect("workers did not stop in time")
		.expect("stop task failed");
}
