use crate::handler::ContextHandler;
use crate::mux::Mux;
use crate::params::{RouteParams, UrlParams};
use crate::request::Request;
use hyper::Method;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

/// Observer notified whenever a middleware replaces the request.
pub trait RequestObserver: Send + Sync {
	fn set_request(&self, request: &Request);
}

/// Observer notified with the chain cursor whenever a middleware
/// replaces the request mid-chain.
pub trait ChainRequestObserver: Send + Sync {
	fn set_request(&self, index: usize, request: &Request);
}

struct FnRequestObserver<F>(F);

impl<F> RequestObserver for FnRequestObserver<F>
where
	F: Fn(&Request) + Send + Sync,
{
	fn set_request(&self, request: &Request) {
		(self.0)(request)
	}
}

struct FnChainRequestObserver<F>(F);

impl<F> ChainRequestObserver for FnChainRequestObserver<F>
where
	F: Fn(usize, &Request) + Send + Sync,
{
	fn set_request(&self, index: usize, request: &Request) {
		(self.0)(index, request)
	}
}

/// Wrap a closure as a [`RequestObserver`].
pub fn request_observer<F>(f: F) -> Arc<dyn RequestObserver>
where
	F: Fn(&Request) + Send + Sync + 'static,
{
	Arc::new(FnRequestObserver(f))
}

/// Wrap a closure as a [`ChainRequestObserver`].
pub fn chain_request_observer<F>(f: F) -> Arc<dyn ChainRequestObserver>
where
	F: Fn(usize, &Request) + Send + Sync + 'static,
{
	Arc::new(FnChainRequestObserver(f))
}

/// Per-request routing state threaded through the dispatch stack
///
/// One context lives for the duration of a request, travels through every
/// nested sub-router, and is pooled for reuse once the top-level dispatch
/// completes. Middlewares may freely mutate the data bag, the handler
/// slot and the captured parameters.
#[derive(Default)]
pub struct RouteContext {
	/// Routing path override used during the tree search. A mounted
	/// sub-router receives its residual path here.
	pub route_path: String,

	/// Routing method override; empty derives from the request.
	pub route_method: Option<Method>,

	/// Patterns matched along the nested sub-router stack.
	pub route_patterns: Vec<String>,

	/// Parameters captured across the whole sub-router stack.
	pub url_params: UrlParams,

	/// The endpoint pattern matched by the current sub-router.
	pub(crate) route_pattern: String,

	/// Capture buffer for the current tree walk.
	pub(crate) route_params: RouteParams,

	/// Sticky hint: a node matched the path but not the method.
	pub(crate) method_not_allowed: bool,

	/// Selects the "current" entry of the data bag.
	pub default_value_key: String,

	data: HashMap<String, Box<dyn Any + Send + Sync>>,

	pub(crate) request_observers: HashMap<String, Arc<dyn RequestObserver>>,
	pub(crate) chain_request_observers: HashMap<String, Arc<dyn ChainRequestObserver>>,

	/// Terminal handler of the matched route.
	pub handler: Option<Arc<dyn ContextHandler>>,

	router_stack: Vec<Mux>,

	/// Request-scoped logger.
	pub log: Option<tracing::Span>,

	/// Extension matched by an API-scoped route, e.g. `json`.
	pub api_ext: Option<String>,
}

impl RouteContext {
	pub fn new() -> Self {
		Self::default()
	}

	/// Return the context to its initial state, keeping allocations for
	/// reuse.
	pub fn reset(&mut self) {
		self.route_path.clear();
		self.route_method = None;
		self.route_patterns.clear();
		self.url_params.clear();
		self.route_pattern.clear();
		self.route_params.clear();
		self.method_not_allowed = false;
		self.default_value_key.clear();
		self.data.clear();
		self.request_observers.clear();
		self.chain_request_observers.clear();
		self.handler = None;
		self.router_stack.clear();
		self.log = None;
		self.api_ext = None;
	}

	/// The captured value for a URL parameter, if any.
	///
	/// # Examples
	///
	/// ```
	/// use nuages::RouteContext;
	///
	/// let mut ctx = RouteContext::new();
	/// ctx.url_params.add("id", "42");
	/// assert_eq!(ctx.url_param("id"), Some("42"));
	/// ```
	pub fn url_param(&self, key: &str) -> Option<&str> {
		self.url_params.get(key)
	}

	/// The endpoint pattern matched by the current sub-router. Updates on
	/// every hop while the request descends through mounts.
	pub fn matched_pattern(&self) -> &str {
		&self.route_pattern
	}

	/// The canonical route pattern matched so far: the concatenated
	/// pattern stack with mount wildcards collapsed.
	///
	/// The value changes while the request descends through sub-routers,
	/// so middlewares that want the final pattern should read it after
	/// calling the next handler.
	pub fn route_pattern(&self) -> String {
		self.route_patterns.concat().replace("/*/", "/")
	}

	/// Whether the search matched a path without a method variant.
	pub fn is_method_not_allowed(&self) -> bool {
		self.method_not_allowed
	}

	pub(crate) fn push_router(&mut self, router: Mux) {
		self.router_stack.push(router);
	}

	pub(crate) fn pop_router(&mut self) {
		self.router_stack.pop();
	}

	/// The router currently dispatching this request.
	pub fn router(&self) -> Option<&Mux> {
		self.router_stack.last()
	}

	/// The stack of routers traversed so far, outermost first.
	pub fn routers(&self) -> &[Mux] {
		&self.router_stack
	}

	/// Store a value in the data bag under an explicit key.
	pub fn insert_data<T: Send + Sync + 'static>(&mut self, key: impl Into<String>, value: T) {
		self.data.insert(key.into(), Box::new(value));
	}

	/// Read a value of type `T` from the data bag.
	pub fn data<T: 'static>(&self, key: &str) -> Option<&T> {
		self.data.get(key).and_then(|boxed| boxed.downcast_ref())
	}

	pub fn remove_data(&mut self, key: &str) -> bool {
		self.data.remove(key).is_some()
	}

	/// Store the "current" value, addressed by `default_value_key`.
	pub fn set_value<T: Send + Sync + 'static>(&mut self, value: T) -> &mut Self {
		let key = self.default_value_key.clone();
		self.data.insert(key, Box::new(value));
		self
	}

	/// Read the "current" value as type `T`.
	pub fn value<T: 'static>(&self) -> Option<&T> {
		self.data(&self.default_value_key)
	}

	pub(crate) fn value_any(&self) -> Option<&(dyn Any + Send + Sync)> {
		self.data
			.get(&self.default_value_key)
			.map(|boxed| boxed.as_ref())
	}

	/// Register an observer for request replacement.
	pub fn add_request_observer(
		&mut self,
		key: impl Into<String>,
		observer: Arc<dyn RequestObserver>,
	) {
		self.request_observers.insert(key.into(), observer);
	}

	/// Register a chain-aware observer for request replacement.
	pub fn add_chain_request_observer(
		&mut self,
		key: impl Into<String>,
		observer: Arc<dyn ChainRequestObserver>,
	) {
		self.chain_request_observers.insert(key.into(), observer);
	}
}

impl std::fmt::Debug for RouteContext {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RouteContext")
			.field("route_path", &self.route_path)
			.field("route_method", &self.route_method)
			.field("route_patterns", &self.route_patterns)
			.field("url_params", &self.url_params)
			.field("method_not_allowed", &self.method_not_allowed)
			.field("api_ext", &self.api_ext)
			.finish_non_exhaustive()
	}
}

/// Freelist of routing contexts reused across requests.
#[derive(Default)]
pub(crate) struct ContextPool {
	free: Mutex<Vec<Box<RouteContext>>>,
}

impl ContextPool {
	pub(crate) fn get(&self) -> Box<RouteContext> {
		self.free
			.lock()
			.pop()
			.unwrap_or_else(|| Box::new(RouteContext::new()))
	}

	pub(crate) fn put(&self, mut ctx: Box<RouteContext>) {
		ctx.reset();
		self.free.lock().push(ctx);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_reset_restores_fresh_state() {
		let mut ctx = RouteContext::new();
		ctx.route_path = "/x".to_string();
		ctx.route_method = Some(Method::POST);
		ctx.route_patterns.push("/x".to_string());
		ctx.url_params.add("id", "1");
		ctx.route_params.add("id", "1");
		ctx.method_not_allowed = true;
		ctx.default_value_key = "k".to_string();
		ctx.insert_data("k", 1u8);
		ctx.api_ext = Some("json".to_string());

		ctx.reset();

		let fresh = RouteContext::new();
		assert_eq!(ctx.route_path, fresh.route_path);
		assert_eq!(ctx.route_method, fresh.route_method);
		assert_eq!(ctx.route_patterns, fresh.route_patterns);
		assert!(ctx.url_params.is_empty());
		assert!(!ctx.method_not_allowed);
		assert_eq!(ctx.default_value_key, fresh.default_value_key);
		assert!(ctx.data::<u8>("k").is_none());
		assert_eq!(ctx.api_ext, fresh.api_ext);
	}

	#[test]
	fn test_default_value_key_selects_current_entry() {
		let mut ctx = RouteContext::new();
		ctx.set_value("anonymous".to_string());
		assert_eq!(ctx.value::<String>().unwrap(), "anonymous");

		ctx.default_value_key = "user".to_string();
		ctx.set_value(7u32);
		assert_eq!(ctx.value::<u32>(), Some(&7));

		ctx.default_value_key.clear();
		assert_eq!(ctx.value::<String>().unwrap(), "anonymous");
	}

	#[test]
	fn test_route_pattern_collapses_mount_wildcards() {
		let mut ctx = RouteContext::new();
		ctx.route_patterns.push("/api/*".to_string());
		ctx.route_patterns.push("/v1/ping".to_string());
		assert_eq!(ctx.route_pattern(), "/api/v1/ping");
	}

	#[test]
	fn test_pool_reuses_contexts() {
		let pool = ContextPool::default();
		let mut ctx = pool.get();
		ctx.route_path = "/x".to_string();
		pool.put(ctx);

		let reused = pool.get();
		assert!(reused.route_path.is_empty());
	}
}
