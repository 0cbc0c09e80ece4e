#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde_json::Value;

use crate::AdapterError;

/// Per-adapter configuration store.
///
/// Values are free-form JSON scalars/objects keyed by string. A value that
/// is absent, null, or an empty string counts as unset: the `*_or`
/// accessors fall back to their default for all three, and
/// `validate_required` rejects all three.
#[derive(Debug, Clone)]
pub struct ConfigStore {
	values: BTreeMap<String, Value>,
	required: &'static [&'static str],
}

impl ConfigStore {
	pub fn new(required: &'static [&'static str]) -> Self {
		Self {
			values: BTreeMap::new(),
			required,
		}
	}

	/// Declared required key set.
	pub fn required_keys(&self) -> &'static [&'static str] {
		self.required
	}

	/// Set a single key.
	pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
		self.values.insert(key.into(), value.into());
		self
	}

	/// Batch form: iterate a JSON object's entries and set each in turn.
	/// Non-object values are ignored.
	pub fn merge(&mut self, values: Value) -> &mut Self {
		if let Value::Object(map) = values {
			for (key, value) in map {
				self.set(key, value);
			}
		}
		self
	}

	pub fn get(&self, key: &str) -> Option<&Value> {
		self.values.get(key)
	}

	fn effective(&self, key: &str) -> Option<&Value> {
		match self.values.get(key) {
			None | Some(Value::Null) => None,
			Some(Value::String(s)) if s.trim().is_empty() => None,
			Some(v) => Some(v),
		}
	}

	/// String accessor; falls back when the key is unset *or* holds an
	/// empty string.
	pub fn get_str_or(&self, key: &str, default: &str) -> String {
		match self.effective(key) {
			Some(Value::String(s)) => s.clone(),
			Some(v) => v.to_string(),
			None => default.to_string(),
		}
	}

	/// Optional string accessor with the same unset semantics.
	pub fn get_str(&self, key: &str) -> Option<String> {
		match self.effective(key) {
			Some(Value::String(s)) => Some(s.clone()),
			Some(v) => Some(v.to_string()),
			None => None,
		}
	}

	pub fn get_u64_or(&self, key: &str, default: u64) -> u64 {
		match self.effective(key) {
			Some(Value::Number(n)) => n.as_u64().unwrap_or(default),
			Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
			_ => default,
		}
	}

	pub fn get_bool_or(&self, key: &str, default: bool) -> bool {
		match self.effective(key) {
			Some(Value::Bool(b)) => *b,
			Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
			_ => default,
		}
	}

	/// Fail fast when any declared required key is absent or empty.
	pub fn validate_required(&self) -> Result<(), AdapterError> {
		for key in self.required {
			if self.effective(key).is_none() {
				return Err(AdapterError::Config { key: (*key).to_string() });
			}
		}
		Ok(())
	}
}
