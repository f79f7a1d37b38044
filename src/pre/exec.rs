use crate::val::{Timespec, Value, ValueType};
use regex::Regex;
use std::collections::HashMap;

/// Character data is truncated to this length when normalized.
const CHARACTER_VALUE_LEN: usize = 255;

/// A single preprocessing transformation.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
	/// Multiply a numeric value by a constant.
	Multiplier(f64),
	/// Strip the given characters from the left side.
	LTrim(String),
	/// Strip the given characters from the right side.
	RTrim(String),
	/// Strip the given characters from both sides.
	Trim(String),
	/// Extract a value with a regular expression; `\N` group references in
	/// the output template are substituted from the match.
	RegexSub {
		pattern: String,
		output: String,
	},
	/// Replace every occurrence of a substring.
	Replace {
		search: String,
		replace: String,
	},
	/// Extract a field by a dotted JSON path, e.g. `$.data[0].value`.
	JsonPath(String),
	/// Emit the difference from the previous sample.
	DeltaValue,
	/// Emit the per-second rate of change from the previous sample.
	DeltaSpeed,
	/// Discard the sample when it equals the previous one.
	ThrottleDiscardUnchanged,
	/// Discard unchanged samples unless the heartbeat interval has elapsed.
	ThrottleTimedValue {
		heartbeat: i64,
	},
	/// Fail when the numeric value falls outside the range.
	InRange {
		min: f64,
		max: f64,
	},
	/// Convert a boolean word to 1 or 0.
	Bool2Dec,
	/// Convert an octal string to decimal.
	Oct2Dec,
	/// Convert a hexadecimal string to decimal.
	Hex2Dec,
}

impl Step {
	pub const fn name(&self) -> &'static str {
		match self {
			Step::Multiplier(_) => "multiplier",
			Step::LTrim(_) => "ltrim",
			Step::RTrim(_) => "rtrim",
			Step::Trim(_) => "trim",
			Step::RegexSub {
				..
			} => "regsub",
			Step::Replace {
				..
			} => "replace",
			Step::JsonPath(_) => "jsonpath",
			Step::DeltaValue => "delta_value",
			Step::DeltaSpeed => "delta_speed",
			Step::ThrottleDiscardUnchanged => "throttle_unchanged",
			Step::ThrottleTimedValue {
				..
			} => "throttle_timed",
			Step::InRange {
				..
			} => "in_range",
			Step::Bool2Dec => "bool2dec",
			Step::Oct2Dec => "oct2dec",
			Step::Hex2Dec => "hex2dec",
		}
	}

	/// Whether the step keeps state between samples of the same item.
	pub const fn is_stateful(&self) -> bool {
		matches!(
			self,
			Step::DeltaValue
				| Step::DeltaSpeed
				| Step::ThrottleDiscardUnchanged
				| Step::ThrottleTimedValue {
					..
				}
		)
	}
}

/// What to do when a step fails.
#[derive(Debug, Clone, PartialEq)]
pub enum OnFail {
	/// Attach the step error to the result.
	Default,
	/// Discard the value.
	Discard,
	/// Continue with a replacement value.
	SetValue(Value),
	/// Attach a custom error to the result.
	SetError(String),
}

/// One configured step with its error handler.
#[derive(Debug, Clone, PartialEq)]
pub struct StepConf {
	pub step: Step,
	pub on_fail: OnFail,
}

impl StepConf {
	pub fn new(step: Step) -> Self {
		StepConf {
			step,
			on_fail: OnFail::Default,
		}
	}
}

/// An ordered preprocessing plan for one item.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
	pub steps: Vec<StepConf>,
}

impl Plan {
	pub fn new(steps: Vec<StepConf>) -> Self {
		Plan {
			steps,
		}
	}

	/// A stateful plan must observe samples in collection order.
	pub fn is_stateful(&self) -> bool {
		self.steps.iter().any(|s| s.step.is_stateful())
	}
}

/// Per-item state carried between samples by stateful steps.
#[derive(Debug, Default)]
pub struct OpHistory {
	/// Previous numeric sample and its timestamp, for the delta steps.
	delta: Option<(f64, Timespec)>,
	/// Previous sample text and the time it was last passed on, for the
	/// throttling steps.
	throttle: Option<(String, i64)>,
}

/// Reusable per-worker scratch: compiled regular expressions survive across
/// tasks keyed by their pattern text.
#[derive(Default)]
pub struct ExecContext {
	regexes: HashMap<String, Regex>,
}

impl ExecContext {
	fn regex(&mut self, pattern: &str) -> Result<&Regex, String> {
		if !self.regexes.contains_key(pattern) {
			let re = Regex::new(pattern)
				.map_err(|e| format!("invalid regular expression \"{pattern}\": {e}"))?;
			self.regexes.insert(pattern.to_string(), re);
		}
		Ok(&self.regexes[pattern])
	}
}

/// The outcome of a plan execution: a value, a discarded sample (no value,
/// no error), or an error.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecResult {
	pub value: Option<Value>,
	pub error: Option<String>,
}

impl ExecResult {
	pub fn value(value: Value) -> Self {
		ExecResult {
			value: Some(value),
			error: None,
		}
	}

	pub fn error(error: impl Into<String>) -> Self {
		ExecResult {
			value: None,
			error: Some(error.into()),
		}
	}

	pub const fn discarded() -> Self {
		ExecResult {
			value: None,
			error: None,
		}
	}
}

/// The intermediate outcome of a single step, recorded for test tasks.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
	pub step: &'static str,
	pub result: ExecResult,
}

/// Executes a preprocessing plan over one sample.
///
/// Returns the final result normalized to `value_type` and, when
/// `record_steps` is set, the per-step intermediate results for diagnostics.
pub fn execute(
	ctx: &mut ExecContext,
	plan: &Plan,
	history: Option<&mut OpHistory>,
	value: Value,
	ts: Timespec,
	value_type: ValueType,
	record_steps: bool,
) -> (ExecResult, Vec<StepOutcome>) {
	let mut steps = Vec::new();
	let mut hist = history;
	let mut current = value;
	for conf in plan.steps.iter() {
		let applied = apply(ctx, &conf.step, current.clone(), ts, hist.as_deref_mut());
		let outcome = match applied {
			Ok(Some(next)) => {
				current = next;
				None
			}
			Ok(None) => Some(ExecResult::discarded()),
			Err(e) => match &conf.on_fail {
				OnFail::Default => Some(ExecResult::error(e)),
				OnFail::Discard => Some(ExecResult::discarded()),
				OnFail::SetValue(v) => {
					current = v.clone();
					None
				}
				OnFail::SetError(msg) => Some(ExecResult::error(msg.clone())),
			},
		};
		if record_steps {
			steps.push(StepOutcome {
				step: conf.step.name(),
				result: outcome.clone().unwrap_or_else(|| ExecResult::value(current.clone())),
			});
		}
		if let Some(result) = outcome {
			return (result, steps);
		}
	}
	let result = match convert(current, value_type) {
		Ok(v) => ExecResult::value(v),
		Err(e) => ExecResult::error(e),
	};
	(result, steps)
}

fn parse_num(value: &Value) -> Result<f64, String> {
	match value {
		Value::Uint(v) => Ok(*v as f64),
		Value::Float(v) => Ok(*v),
		Value::Str(v) => v
			.trim()
			.parse::<f64>()
			.map_err(|_| format!("value \"{v}\" is not numeric")),
	}
}

fn apply(
	ctx: &mut ExecContext,
	step: &Step,
	value: Value,
	ts: Timespec,
	history: Option<&mut OpHistory>,
) -> Result<Option<Value>, String> {
	match step {
		Step::Multiplier(m) => {
			let v = parse_num(&value)?;
			Ok(Some(Value::Float(v * m)))
		}
		Step::LTrim(chars) => {
			let text = value.as_text();
			Ok(Some(Value::Str(text.trim_start_matches(|c| chars.contains(c)).to_string())))
		}
		Step::RTrim(chars) => {
			let text = value.as_text();
			Ok(Some(Value::Str(text.trim_end_matches(|c| chars.contains(c)).to_string())))
		}
		Step::Trim(chars) => {
			let text = value.as_text();
			Ok(Some(Value::Str(text.trim_matches(|c| chars.contains(c)).to_string())))
		}
		Step::RegexSub {
			pattern,
			output,
		} => {
			let re = ctx.regex(pattern)?;
			let text = value.as_text();
			let caps = re
				.captures(&text)
				.ok_or_else(|| format!("pattern \"{pattern}\" does not match the value"))?;
			// Substitute \N group references in the output template
			let mut out = String::with_capacity(output.len());
			let mut chars = output.chars().peekable();
			while let Some(c) = chars.next() {
				if c == '\\' {
					if let Some(d) = chars.peek().and_then(|d| d.to_digit(10)) {
						chars.next();
						if let Some(group) = caps.get(d as usize) {
							out.push_str(group.as_str());
						}
						continue;
					}
				}
				out.push(c);
			}
			Ok(Some(Value::Str(out)))
		}
		Step::Replace {
			search,
			replace,
		} => {
			let text = value.as_text();
			Ok(Some(Value::Str(text.replace(search.as_str(), replace))))
		}
		Step::JsonPath(path) => {
			let text = value.as_text();
			let json: serde_json::Value = serde_json::from_str(&text)
				.map_err(|e| format!("cannot parse value as JSON: {e}"))?;
			let found = json_path(&json, path)?;
			let out = match found {
				serde_json::Value::String(s) => s.clone(),
				other => other.to_string(),
			};
			Ok(Some(Value::Str(out)))
		}
		Step::DeltaValue => {
			let v = parse_num(&value)?;
			let history = history.ok_or("item has no preprocessing history")?;
			let previous = history.delta.replace((v, ts));
			match previous {
				// The first sample has nothing to diff against
				None => Ok(None),
				// A counter reset would produce a negative delta
				Some((prev, _)) if prev > v => Ok(None),
				Some((prev, _)) => Ok(Some(Value::Float(v - prev))),
			}
		}
		Step::DeltaSpeed => {
			let v = parse_num(&value)?;
			let history = history.ok_or("item has no preprocessing history")?;
			let previous = history.delta.replace((v, ts));
			match previous {
				None => Ok(None),
				Some((prev, _)) if prev > v => Ok(None),
				Some((_, prev_ts)) if ts.sec <= prev_ts.sec => Ok(None),
				Some((prev, prev_ts)) => {
					Ok(Some(Value::Float((v - prev) / (ts.sec - prev_ts.sec) as f64)))
				}
			}
		}
		Step::ThrottleDiscardUnchanged => {
			let text = value.as_text();
			let history = history.ok_or("item has no preprocessing history")?;
			match &history.throttle {
				Some((prev, _)) if *prev == text => Ok(None),
				_ => {
					history.throttle = Some((text, ts.sec));
					Ok(Some(value))
				}
			}
		}
		Step::ThrottleTimedValue {
			heartbeat,
		} => {
			let text = value.as_text();
			let history = history.ok_or("item has no preprocessing history")?;
			match &history.throttle {
				Some((prev, last)) if *prev == text && ts.sec - last < *heartbeat => Ok(None),
				_ => {
					history.throttle = Some((text, ts.sec));
					Ok(Some(value))
				}
			}
		}
		Step::InRange {
			min,
			max,
		} => {
			let v = parse_num(&value)?;
			if v < *min || v > *max {
				return Err(format!("value {v} is outside the range [{min}, {max}]"));
			}
			Ok(Some(value))
		}
		Step::Bool2Dec => {
			let text = value.as_text();
			match text.trim().to_ascii_lowercase().as_str() {
				"true" | "t" | "yes" | "y" | "on" | "up" | "ok" | "1" => {
					Ok(Some(Value::Uint(1)))
				}
				"false" | "f" | "no" | "n" | "off" | "down" | "err" | "0" => {
					Ok(Some(Value::Uint(0)))
				}
				_ => Err(format!("value \"{text}\" is not boolean")),
			}
		}
		Step::Oct2Dec => {
			let text = value.as_text();
			let v = u64::from_str_radix(text.trim(), 8)
				.map_err(|_| format!("value \"{text}\" is not octal"))?;
			Ok(Some(Value::Uint(v)))
		}
		Step::Hex2Dec => {
			let text = value.as_text();
			let digits = text.trim().trim_start_matches("0x").trim_start_matches("0X");
			let v = u64::from_str_radix(digits, 16)
				.map_err(|_| format!("value \"{text}\" is not hexadecimal"))?;
			Ok(Some(Value::Uint(v)))
		}
	}
}

/// Walks a dotted JSON path of the `$.a.b[0].c` form.
fn json_path<'a>(
	json: &'a serde_json::Value,
	path: &str,
) -> Result<&'a serde_json::Value, String> {
	let mut current = json;
	let trimmed = path.trim_start_matches('$').trim_start_matches('.');
	if trimmed.is_empty() {
		return Ok(current);
	}
	for token in trimmed.split('.') {
		// Each token is a key optionally followed by [index] accessors
		let (key, rest) = match token.find('[') {
			Some(pos) => (&token[..pos], &token[pos..]),
			None => (token, ""),
		};
		if !key.is_empty() {
			current = current
				.get(key)
				.ok_or_else(|| format!("JSON path \"{path}\": no element \"{key}\""))?;
		}
		for index in rest.split('[').filter(|s| !s.is_empty()) {
			let index = index
				.trim_end_matches(']')
				.parse::<usize>()
				.map_err(|_| format!("JSON path \"{path}\": invalid index"))?;
			current = current
				.get(index)
				.ok_or_else(|| format!("JSON path \"{path}\": no element [{index}]"))?;
		}
	}
	Ok(current)
}

/// Normalizes the final value of a plan to the item value type.
fn convert(value: Value, value_type: ValueType) -> Result<Value, String> {
	match value_type {
		ValueType::Text => Ok(Value::Str(value.as_text())),
		ValueType::Character => {
			let mut text = value.as_text();
			if text.len() > CHARACTER_VALUE_LEN {
				// Truncate on a character boundary
				let mut end = CHARACTER_VALUE_LEN;
				while !text.is_char_boundary(end) {
					end -= 1;
				}
				text.truncate(end);
			}
			Ok(Value::Str(text))
		}
		ValueType::Float => {
			let v = parse_num(&value)
				.map_err(|_| format!("value \"{value}\" cannot be converted to a float"))?;
			Ok(Value::Float(v))
		}
		ValueType::Unsigned => match value {
			Value::Uint(v) => Ok(Value::Uint(v)),
			other => {
				let text = other.as_text();
				if let Ok(v) = text.trim().parse::<u64>() {
					return Ok(Value::Uint(v));
				}
				// Accept integral floating-point representations
				match text.trim().parse::<f64>() {
					Ok(f) if f >= 0.0 && f.fract() == 0.0 && f <= u64::MAX as f64 => {
						Ok(Value::Uint(f as u64))
					}
					_ => Err(format!(
						"value \"{text}\" cannot be converted to an unsigned integer"
					)),
				}
			}
		},
	}
}
