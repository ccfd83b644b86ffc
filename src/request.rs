use crate::error::{RouterError, RouterResult};
use bytes::Bytes;
use hyper::header::{HeaderName, HeaderValue};
use hyper::{HeaderMap, Method, Uri, Version};
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Extensions key under which the pre-rewrite URL is stashed.
///
/// The spelling is load-bearing: existing instrumentation reads this
/// exact byte sequence.
pub const ORIGINAL_URL_KEY: &str = "origianal_url";

/// String-keyed storage for arbitrary data attached to a request
///
/// This is the request's logical context: middlewares stash values under
/// protocol-level keys and downstream handlers read them back. Clones
/// share the underlying storage.
#[derive(Clone, Default)]
pub struct Extensions {
	map: Arc<Mutex<HashMap<String, Box<dyn Any + Send + Sync>>>>,
}

impl std::fmt::Debug for Extensions {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Extensions").finish_non_exhaustive()
	}
}

impl Extensions {
	pub fn new() -> Self {
		Self::default()
	}

	/// Insert a value under `key`, replacing any previous entry.
	///
	/// # Examples
	///
	/// ```
	/// use nuages::Extensions;
	///
	/// let extensions = Extensions::new();
	/// extensions.insert("trace_id", 42u64);
	/// assert_eq!(extensions.get::<u64>("trace_id"), Some(42));
	/// ```
	pub fn insert<T: Send + Sync + 'static>(&self, key: impl Into<String>, value: T) {
		let mut map = self.map.lock().unwrap_or_else(|e| e.into_inner());
		map.insert(key.into(), Box::new(value));
	}

	/// Get a cloned value of type `T` stored under `key`.
	pub fn get<T>(&self, key: &str) -> Option<T>
	where
		T: Clone + Send + Sync + 'static,
	{
		let map = self.map.lock().unwrap_or_else(|e| e.into_inner());
		map.get(key)
			.and_then(|boxed| boxed.downcast_ref::<T>())
			.cloned()
	}

	pub fn contains(&self, key: &str) -> bool {
		let map = self.map.lock().unwrap_or_else(|e| e.into_inner());
		map.contains_key(key)
	}

	pub fn remove<T>(&self, key: &str) -> Option<T>
	where
		T: Send + Sync + 'static,
	{
		let mut map = self.map.lock().unwrap_or_else(|e| e.into_inner());
		let boxed = map.remove(key)?;
		match boxed.downcast::<T>() {
			Ok(value) => Some(*value),
			Err(boxed) => {
				// Reinstate on type mismatch to prevent value loss
				map.insert(key.to_string(), boxed);
				None
			}
		}
	}

	pub fn clear(&self) {
		let mut map = self.map.lock().unwrap_or_else(|e| e.into_inner());
		map.clear();
	}
}

/// HTTP request as seen by the routing kernel
///
/// The transport adapter constructs one per incoming request; the kernel
/// never reads the body, it only routes on method and path and threads
/// the rest through to handlers.
#[derive(Clone, Debug)]
pub struct Request {
	pub method: Method,
	pub uri: Uri,
	pub version: Version,
	pub headers: HeaderMap,
	pub body: Bytes,
	/// Attached logical context, shared across clones.
	pub extensions: Extensions,
}

impl Request {
	/// Start building a request.
	///
	/// # Examples
	///
	/// ```
	/// use nuages::Request;
	/// use hyper::Method;
	///
	/// let request = Request::builder()
	///     .method(Method::GET)
	///     .uri("/users/42")
	///     .build()
	///     .unwrap();
	///
	/// assert_eq!(request.method, Method::GET);
	/// assert_eq!(request.path(), "/users/42");
	/// ```
	pub fn builder() -> RequestBuilder {
		RequestBuilder::default()
	}

	pub fn path(&self) -> &str {
		self.uri.path()
	}

	/// A request header as a string, if present and valid UTF-8.
	pub fn header(&self, name: &str) -> Option<&str> {
		self.headers.get(name).and_then(|v| v.to_str().ok())
	}
}

/// Builder for [`Request`] instances
pub struct RequestBuilder {
	method: Method,
	uri: Option<Uri>,
	version: Version,
	headers: HeaderMap,
	body: Bytes,
	uri_error: Option<String>,
	header_error: Option<String>,
}

impl Default for RequestBuilder {
	fn default() -> Self {
		Self {
			method: Method::GET,
			uri: None,
			version: Version::HTTP_11,
			headers: HeaderMap::new(),
			body: Bytes::new(),
			uri_error: None,
			header_error: None,
		}
	}
}

impl RequestBuilder {
	pub fn method(mut self, method: Method) -> Self {
		self.method = method;
		self
	}

	pub fn uri<T>(mut self, uri: T) -> Self
	where
		T: TryInto<Uri>,
		T::Error: std::fmt::Display,
	{
		match uri.try_into() {
			Ok(uri) => self.uri = Some(uri),
			Err(e) => self.uri_error = Some(format!("invalid uri: {}", e)),
		}
		self
	}

	pub fn version(mut self, version: Version) -> Self {
		self.version = version;
		self
	}

	pub fn headers(mut self, headers: HeaderMap) -> Self {
		self.headers = headers;
		self
	}

	/// Append a single header.
	pub fn header(mut self, name: &str, value: &str) -> Self {
		match (
			name.parse::<HeaderName>(),
			HeaderValue::from_str(value),
		) {
			(Ok(name), Ok(value)) => {
				self.headers.append(name, value);
			}
			_ => {
				self.header_error = Some(format!("invalid header '{}: {}'", name, value));
			}
		}
		self
	}

	pub fn body(mut self, body: impl Into<Bytes>) -> Self {
		self.body = body.into();
		self
	}

	pub fn build(self) -> RouterResult<Request> {
		if let Some(err) = self.uri_error {
			return Err(RouterError::Request(err));
		}
		if let Some(err) = self.header_error {
			return Err(RouterError::Request(err));
		}
		let uri = self
			.uri
			.ok_or_else(|| RouterError::Request("missing uri".to_string()))?;
		Ok(Request {
			method: self.method,
			uri,
			version: self.version,
			headers: self.headers,
			body: self.body,
			extensions: Extensions::new(),
		})
	}
}

/// Stash the request's current URL as the original, pre-rewrite URL.
pub fn set_original_url(request: &Request) {
	request
		.extensions
		.insert(ORIGINAL_URL_KEY, request.uri.clone());
}

/// Stash the current URL only when no original has been recorded yet.
pub fn set_original_url_if_unset(request: &Request) {
	if !request.extensions.contains(ORIGINAL_URL_KEY) {
		set_original_url(request);
	}
}

/// The stashed pre-rewrite URL, falling back to the request's URL.
pub fn original_url(request: &Request) -> Uri {
	request
		.extensions
		.get::<Uri>(ORIGINAL_URL_KEY)
		.unwrap_or_else(|| request.uri.clone())
}

/// Build a header map from name/value pairs.
///
/// # Examples
///
/// ```
/// use nuages::header_map;
///
/// let headers = header_map(&[("accept", "application/json")]);
/// assert_eq!(headers.get("accept").unwrap(), "application/json");
/// ```
pub fn header_map(pairs: &[(&str, &str)]) -> HeaderMap {
	let mut headers = HeaderMap::with_capacity(pairs.len());
	for (name, value) in pairs {
		if let (Ok(name), Ok(value)) = (name.parse::<HeaderName>(), HeaderValue::from_str(value)) {
			headers.insert(name, value);
		}
	}
	headers
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_builder_requires_uri() {
		let err = Request::builder().build().unwrap_err();
		assert!(matches!(err, RouterError::Request(_)));
	}

	#[test]
	fn test_builder_captures_uri_error() {
		let err = Request::builder().uri("http://[broken").build().unwrap_err();
		assert!(matches!(err, RouterError::Request(_)));
	}

	#[test]
	fn test_extensions_shared_across_clones() {
		let request = Request::builder().uri("/a").build().unwrap();
		let clone = request.clone();
		request.extensions.insert("seen", true);

		assert_eq!(clone.extensions.get::<bool>("seen"), Some(true));
	}

	#[test]
	fn test_original_url_round_trip() {
		let request = Request::builder().uri("/before").build().unwrap();
		set_original_url(&request);

		let mut rewritten = request.clone();
		rewritten.uri = "/after".parse().unwrap();

		assert_eq!(original_url(&rewritten).path(), "/before");
	}

	#[test]
	fn test_original_url_falls_back_to_request_uri() {
		let request = Request::builder().uri("/only").build().unwrap();
		assert_eq!(original_url(&request).path(), "/only");
	}

	#[test]
	fn test_set_original_url_if_unset_keeps_first() {
		let request = Request::builder().uri("/first").build().unwrap();
		set_original_url_if_unset(&request);

		let mut rewritten = request.clone();
		rewritten.uri = "/second".parse().unwrap();
		set_original_url_if_unset(&rewritten);

		assert_eq!(original_url(&rewritten).path(), "/first");
	}
}
