use std::collections::HashMap;

/// Ordered multimap of URL parameters captured across a request
///
/// Key order is first-insertion order, which for a matched request equals
/// the left-to-right order of parametric and wildcard segments in the
/// pattern, across any depth of mounted sub-routers. Repeated keys keep
/// every value; [`get`](UrlParams::get) returns the most recent one.
///
/// # Examples
///
/// ```
/// use nuages::UrlParams;
///
/// let mut params = UrlParams::default();
/// params.add("id", "42");
/// params.add("*", "v1/ping");
/// params.add("id", "7");
///
/// assert_eq!(params.keys(), &["id".to_string(), "*".to_string()]);
/// assert_eq!(params.get("id"), Some("7"));
/// assert_eq!(params.get_all("id"), &["42".to_string(), "7".to_string()]);
/// ```
#[derive(Debug, Default, Clone)]
pub struct UrlParams {
	keys: Vec<String>,
	map: HashMap<String, Vec<String>>,
}

impl UrlParams {
	pub fn new() -> Self {
		Self::default()
	}

	/// Append a parameter, preserving first-insertion key order.
	pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) {
		let key = key.into();
		let values = self.map.entry(key.clone()).or_default();
		if values.is_empty() {
			self.keys.push(key);
		}
		values.push(value.into());
	}

	/// The most recently captured value for `key`.
	pub fn get(&self, key: &str) -> Option<&str> {
		self.map
			.get(key)
			.and_then(|values| values.last())
			.map(String::as_str)
	}

	/// Every captured value for `key`, oldest first.
	pub fn get_all(&self, key: &str) -> &[String] {
		self.map.get(key).map(Vec::as_slice).unwrap_or(&[])
	}

	/// Distinct keys in first-insertion order.
	pub fn keys(&self) -> &[String] {
		&self.keys
	}

	pub fn len(&self) -> usize {
		self.keys.len()
	}

	pub fn is_empty(&self) -> bool {
		self.keys.is_empty()
	}

	pub fn clear(&mut self) {
		self.keys.clear();
		self.map.clear();
	}

	/// Snapshot as a plain map of value lists.
	pub fn dict(&self) -> HashMap<String, Vec<String>> {
		self.map.clone()
	}
}

/// Transient capture buffer used during a single tree walk
///
/// Values are pushed as parametric and wildcard segments match and popped
/// on backtracking; the keys are appended from the matched endpoint's
/// parameter list once a terminal node is reached.
#[derive(Debug, Default, Clone)]
pub struct RouteParams {
	pub keys: Vec<String>,
	pub values: Vec<String>,
}

impl RouteParams {
	pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) {
		self.keys.push(key.into());
		self.values.push(value.into());
	}

	pub fn clear(&mut self) {
		self.keys.clear();
		self.values.clear();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_key_order_is_first_insertion() {
		let mut params = UrlParams::new();
		params.add("a", "1");
		params.add("b", "2");
		params.add("a", "3");
		params.add("c", "4");

		assert_eq!(
			params.keys(),
			&["a".to_string(), "b".to_string(), "c".to_string()]
		);
	}

	#[test]
	fn test_get_returns_last_value() {
		let mut params = UrlParams::new();
		params.add("id", "1");
		params.add("id", "2");

		assert_eq!(params.get("id"), Some("2"));
		assert_eq!(params.get_all("id"), &["1".to_string(), "2".to_string()]);
	}

	#[test]
	fn test_missing_key() {
		let params = UrlParams::new();
		assert_eq!(params.get("nope"), None);
		assert!(params.get_all("nope").is_empty());
	}

	#[test]
	fn test_clear_resets_observable_state() {
		let mut params = UrlParams::new();
		params.add("id", "1");
		params.clear();

		assert!(params.is_empty());
		assert_eq!(params.get("id"), None);
	}
}
