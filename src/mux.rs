use crate::chain::chain;
use crate::context::{ContextPool, RouteContext};
use crate::error::{RouterError, RouterResult};
use crate::handler::{
	default_method_not_allowed_handler, default_not_found_handler, ContextHandler,
};
use crate::log::{default_error_handler, default_log_requests, ErrorHandler, LogRequestsHandler};
use crate::method::MethodKind;
use crate::middleware::{DuplicationPolicy, Middleware, MiddlewareStack};
use crate::request::{original_url, Request};
use crate::response::ResponseWriter;
use crate::tree::{PatternTree, RouteDescriptor, RouteMatch, StoredHandler};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use hyper::{HeaderMap, Method, StatusCode, Uri};
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

/// Hook wrapping the tree-dispatch step of one router. Receives the main
/// routing handler and the request triple.
pub type RouteHandlerHook = Arc<
	dyn for<'a> Fn(
			Arc<dyn ContextHandler>,
			&'a mut ResponseWriter,
			&'a mut Request,
			&'a mut RouteContext,
		) -> BoxFuture<'a, RouterResult<()>>
		+ Send
		+ Sync,
>;

/// Composable HTTP request multiplexer
///
/// A `Mux` owns a radix pattern tree and three middleware stacks:
/// pre-route interceptors, post-match handler interceptors, and the
/// middleware stack proper. Routers compose through [`with`](Mux::with)
/// (inline middleware groups sharing the tree), [`group`](Mux::group),
/// [`route`](Mux::route) and [`mount`](Mux::mount) (sub-routers resolved
/// through a residual path). Cloning a `Mux` yields another handle to the
/// same router.
///
/// Registration is not synchronized against dispatch: define routes and
/// middlewares before serving traffic. The dispatch handler is built
/// lazily on the first request and memoized; after that the middleware
/// stacks are sealed.
///
/// # Examples
///
/// ```
/// use nuages::{context_handler_fn, Mux};
///
/// let mux = Mux::new();
/// mux.get("/users/{id}", context_handler_fn(|w, _r, ctx| {
///     let id = ctx.url_param("id").unwrap_or("").to_string();
///     w.write(format!("user {id}"));
///     Ok(())
/// }));
///
/// let api = mux.route("/api", |r| {
///     r.get("/ping", context_handler_fn(|w, _r, _ctx| {
///         w.write("pong");
///         Ok(())
///     }));
/// });
/// assert_eq!(api.prefix(), "/api");
/// ```
#[derive(Clone)]
pub struct Mux {
	inner: Arc<MuxInner>,
}

struct MuxInner {
	name: RwLock<String>,
	prefix: RwLock<String>,

	tree: Arc<PatternTree>,

	interceptors: Mutex<MiddlewareStack>,
	handler_interceptors: Mutex<MiddlewareStack>,
	middlewares: Mutex<MiddlewareStack>,
	interceptor_policy: Mutex<DuplicationPolicy>,
	handler_interceptor_policy: Mutex<DuplicationPolicy>,

	// Inline routers share the parent's tree and wrap endpoints with
	// their own chain at registration time.
	inline: bool,
	parent: RwLock<Option<Weak<MuxInner>>>,

	// Memoized dispatch handler: interceptors ++ middlewares around the
	// routing step. Single-flight, double-checked.
	handler: OnceCell<Arc<dyn ContextHandler>>,

	pool: ContextPool,

	not_found: RwLock<Option<Arc<dyn ContextHandler>>>,
	method_not_allowed: RwLock<Option<Arc<dyn ContextHandler>>>,
	route_handler: RwLock<Option<RouteHandlerHook>>,

	log_requests: AtomicBool,
	log_handler: RwLock<Option<LogRequestsHandler>>,
	intercept_errors: AtomicBool,
	error_handler: RwLock<Option<ErrorHandler>>,
	debug: AtomicBool,

	// Scoped registration state; see `api`, `headers`, `overrides`.
	api: AtomicBool,
	headers: RwLock<Option<HeaderMap>>,
	overrides: AtomicBool,
	api_extensions: RwLock<Vec<String>>,

	arg: RwLock<Option<Arc<dyn Any + Send + Sync>>>,
}

/// Wrapper dispatching into a mounted handler or sub-router
///
/// Computes the residual path from the tail wildcard capture and installs
/// it as the routing-path override before delegating, so the mounted
/// handler resolves the remainder against its own tree.
pub struct MountHandler {
	inner: Arc<dyn ContextHandler>,
	mux: Option<Mux>,
}

impl MountHandler {
	pub(crate) fn new(inner: Arc<dyn ContextHandler>, mux: Option<Mux>) -> Self {
		Self { inner, mux }
	}

	/// The mounted sub-router, when the target is one.
	pub fn sub_router(&self) -> Option<&Mux> {
		self.mux.as_ref()
	}

	// Residual path for the mounted handler: "/" plus the tail capture.
	pub(crate) fn next_route_path(ctx: &RouteContext) -> String {
		let keys = &ctx.route_params.keys;
		let values = &ctx.route_params.values;
		let mut path = String::from("/");
		if let Some(last) = keys.len().checked_sub(1) {
			if keys[last] == "*" && values.len() > last {
				path.push_str(&values[last]);
			}
		}
		path
	}
}

#[async_trait]
impl ContextHandler for MountHandler {
	async fn serve(
		&self,
		w: &mut ResponseWriter,
		r: &mut Request,
		ctx: &mut RouteContext,
	) -> RouterResult<()> {
		ctx.route_path = Self::next_route_path(ctx);
		self.inner.serve(w, r, ctx).await
	}
}

// The routing step itself, chained under the interceptor and middleware
// stacks by the lazy handler build.
struct RouteHttp {
	mux: Mux,
}

#[async_trait]
impl ContextHandler for RouteHttp {
	async fn serve(
		&self,
		w: &mut ResponseWriter,
		r: &mut Request,
		ctx: &mut RouteContext,
	) -> RouterResult<()> {
		self.mux.route_http(w, r, ctx).await
	}
}

struct HookHandler {
	hook: RouteHandlerHook,
	main: Arc<dyn ContextHandler>,
}

#[async_trait]
impl ContextHandler for HookHandler {
	async fn serve(
		&self,
		w: &mut ResponseWriter,
		r: &mut Request,
		ctx: &mut RouteContext,
	) -> RouterResult<()> {
		(self.hook)(self.main.clone(), w, r, ctx).await
	}
}

// "pattern/" stub installed by mount: defers to the parent's NotFound.
struct ParentNotFound {
	mux: Mux,
}

#[async_trait]
impl ContextHandler for ParentNotFound {
	async fn serve(
		&self,
		w: &mut ResponseWriter,
		r: &mut Request,
		ctx: &mut RouteContext,
	) -> RouterResult<()> {
		self.mux.not_found_handler().serve(w, r, ctx).await
	}
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
	if let Some(s) = payload.downcast_ref::<&str>() {
		(*s).to_string()
	} else if let Some(s) = payload.downcast_ref::<String>() {
		s.clone()
	} else {
		"handler panicked".to_string()
	}
}

impl Mux {
	/// A new router with an empty tree and fresh middleware stacks.
	pub fn new() -> Mux {
		Self::with_name("")
	}

	/// A new named router; the name shows up in logs and diagnostics.
	pub fn with_name(name: impl Into<String>) -> Mux {
		Mux {
			inner: Arc::new(MuxInner {
				name: RwLock::new(name.into()),
				prefix: RwLock::new(String::new()),
				tree: Arc::new(PatternTree::new()),
				interceptors: Mutex::new(MiddlewareStack::new("Interceptors", false)),
				handler_interceptors: Mutex::new(MiddlewareStack::new(
					"HandlerInterceptors",
					false,
				)),
				middlewares: Mutex::new(MiddlewareStack::new("Middlewares", true)),
				interceptor_policy: Mutex::new(DuplicationPolicy::Override),
				handler_interceptor_policy: Mutex::new(DuplicationPolicy::Override),
				inline: false,
				parent: RwLock::new(None),
				handler: OnceCell::new(),
				pool: ContextPool::default(),
				not_found: RwLock::new(None),
				method_not_allowed: RwLock::new(None),
				route_handler: RwLock::new(None),
				log_requests: AtomicBool::new(false),
				log_handler: RwLock::new(None),
				intercept_errors: AtomicBool::new(false),
				error_handler: RwLock::new(None),
				debug: AtomicBool::new(false),
				api: AtomicBool::new(false),
				headers: RwLock::new(None),
				overrides: AtomicBool::new(false),
				api_extensions: RwLock::new(vec!["json".to_string()]),
				arg: RwLock::new(None),
			}),
		}
	}

	fn new_inline(
		parent: &Mux,
		middlewares: MiddlewareStack,
		interceptors: MiddlewareStack,
		handler_interceptors: MiddlewareStack,
	) -> Mux {
		Mux {
			inner: Arc::new(MuxInner {
				name: RwLock::new(String::new()),
				prefix: RwLock::new(String::new()),
				tree: parent.inner.tree.clone(),
				interceptors: Mutex::new(interceptors),
				handler_interceptors: Mutex::new(handler_interceptors),
				middlewares: Mutex::new(middlewares),
				interceptor_policy: Mutex::new(DuplicationPolicy::Override),
				handler_interceptor_policy: Mutex::new(DuplicationPolicy::Override),
				inline: true,
				parent: RwLock::new(Some(Arc::downgrade(&parent.inner))),
				handler: OnceCell::new(),
				pool: ContextPool::default(),
				not_found: RwLock::new(None),
				method_not_allowed: RwLock::new(None),
				route_handler: RwLock::new(None),
				log_requests: AtomicBool::new(false),
				log_handler: RwLock::new(None),
				intercept_errors: AtomicBool::new(false),
				error_handler: RwLock::new(None),
				debug: AtomicBool::new(false),
				api: AtomicBool::new(false),
				headers: RwLock::new(None),
				overrides: AtomicBool::new(false),
				api_extensions: RwLock::new(parent.inner.api_extensions.read().clone()),
				arg: RwLock::new(None),
			}),
		}
	}

	// --- configuration -------------------------------------------------

	pub fn name(&self) -> String {
		self.inner.name.read().clone()
	}

	pub fn set_name(&self, name: impl Into<String>) -> &Self {
		*self.inner.name.write() = name.into();
		self
	}

	pub fn prefix(&self) -> String {
		self.inner.prefix.read().clone()
	}

	pub fn set_prefix(&self, prefix: impl Into<String>) {
		*self.inner.prefix.write() = prefix.into();
	}

	/// Enable the finish-line request log.
	pub fn log_requests(&self) -> &Self {
		self.inner.log_requests.store(true, Ordering::SeqCst);
		self
	}

	pub fn set_log_requests(&self, on: bool) {
		self.inner.log_requests.store(on, Ordering::SeqCst);
	}

	pub fn is_log_requests(&self) -> bool {
		self.inner.log_requests.load(Ordering::SeqCst)
	}

	pub fn set_log_handler(&self, handler: LogRequestsHandler) {
		*self.inner.log_handler.write() = Some(handler);
	}

	/// Recover handler failures and panics into 500 responses.
	pub fn intercept_errors(&self) -> &Self {
		self.inner.intercept_errors.store(true, Ordering::SeqCst);
		self
	}

	pub fn set_intercept_errors(&self, on: bool) {
		self.inner.intercept_errors.store(on, Ordering::SeqCst);
	}

	pub fn is_intercept_errors(&self) -> bool {
		self.inner.intercept_errors.load(Ordering::SeqCst)
	}

	pub fn set_error_handler(&self, handler: ErrorHandler) {
		*self.inner.error_handler.write() = Some(handler);
	}

	/// Reveal failure detail in intercepted error responses.
	pub fn debug(&self) -> &Self {
		self.inner.debug.store(true, Ordering::SeqCst);
		self
	}

	pub fn set_debug(&self, on: bool) {
		self.inner.debug.store(on, Ordering::SeqCst);
	}

	pub fn is_debug(&self) -> bool {
		self.inner.debug.load(Ordering::SeqCst)
	}

	pub fn api_extensions(&self) -> Vec<String> {
		self.inner.api_extensions.read().clone()
	}

	pub fn set_api_extensions(&self, extensions: Vec<String>) {
		*self.inner.api_extensions.write() = extensions;
	}

	/// Install a hook around the tree-dispatch step.
	pub fn set_route_handler(&self, hook: RouteHandlerHook) {
		*self.inner.route_handler.write() = Some(hook);
	}

	pub fn route_handler(&self) -> Option<RouteHandlerHook> {
		self.inner.route_handler.read().clone()
	}

	/// Attach an opaque per-router value.
	pub fn set_arg<T: Send + Sync + 'static>(&self, arg: T) {
		*self.inner.arg.write() = Some(Arc::new(arg));
	}

	pub fn arg<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
		self.inner
			.arg
			.read()
			.clone()
			.and_then(|arg| arg.downcast::<T>().ok())
	}

	pub fn is_arg_set(&self) -> bool {
		self.inner.arg.read().is_some()
	}

	pub fn clear_arg(&self) {
		*self.inner.arg.write() = None;
	}

	/// Whether multipart form bodies are acceptable for a method.
	pub fn accepts_multipart_form(&self, method: &Method) -> bool {
		*method == Method::POST || *method == Method::PUT
	}

	pub fn set_interceptor_policy(&self, policy: DuplicationPolicy) {
		*self.inner.interceptor_policy.lock() = policy;
	}

	pub fn set_handler_interceptor_policy(&self, policy: DuplicationPolicy) {
		*self.inner.handler_interceptor_policy.lock() = policy;
	}

	// --- middleware registration ---------------------------------------

	fn assert_unsealed(&self, what: &str) {
		if !self.inner.inline && self.inner.handler.get().is_some() {
			panic!("nuages: all {what} must be registered before the mux serves requests");
		}
	}

	/// Append middlewares to the middleware stack. Name collisions abort.
	pub fn use_middlewares<I>(&self, middlewares: I)
	where
		I: IntoIterator<Item = Middleware>,
	{
		self.assert_unsealed("middlewares");
		self.inner
			.middlewares
			.lock()
			.add(middlewares, DuplicationPolicy::Abort)
			.unwrap_or_else(|e| panic!("nuages: {e}"));
	}

	pub fn use_middleware(&self, middleware: Middleware) {
		self.use_middlewares([middleware]);
	}

	/// Append pre-route interceptors, which run before route resolution.
	pub fn intercept<I>(&self, interceptors: I)
	where
		I: IntoIterator<Item = Middleware>,
	{
		self.assert_unsealed("interceptors");
		let policy = *self.inner.interceptor_policy.lock();
		self.inner
			.interceptors
			.lock()
			.add(interceptors, policy)
			.unwrap_or_else(|e| panic!("nuages: {e}"));
	}

	/// Append post-match interceptors, which wrap matched endpoints.
	pub fn handler_intercept<I>(&self, interceptors: I)
	where
		I: IntoIterator<Item = Middleware>,
	{
		self.assert_unsealed("handler interceptors");
		let policy = *self.inner.handler_interceptor_policy.lock();
		self.inner
			.handler_interceptors
			.lock()
			.add(interceptors, policy)
			.unwrap_or_else(|e| panic!("nuages: {e}"));
	}

	/// Append post-match interceptors under an explicit one-off policy.
	pub fn handler_intercept_with_policy<I>(&self, policy: DuplicationPolicy, interceptors: I)
	where
		I: IntoIterator<Item = Middleware>,
	{
		let old = {
			let mut current = self.inner.handler_interceptor_policy.lock();
			std::mem::replace(&mut *current, policy)
		};
		self.handler_intercept(interceptors);
		*self.inner.handler_interceptor_policy.lock() = old;
	}

	pub fn get_middleware(&self, name: &str) -> Option<Arc<Middleware>> {
		self.inner.middlewares.lock().get(name)
	}

	pub fn get_interceptor(&self, name: &str) -> Option<Arc<Middleware>> {
		self.inner.interceptors.lock().get(name)
	}

	pub fn get_handler_interceptor(&self, name: &str) -> Option<Arc<Middleware>> {
		self.inner.handler_interceptors.lock().get(name)
	}

	/// The middleware stack contents, materialized order once built.
	pub fn middlewares(&self) -> Vec<Arc<Middleware>> {
		self.inner.middlewares.lock().all()
	}

	// --- route registration --------------------------------------------

	/// Register `handler` for `pattern` under every HTTP method.
	pub fn handle(&self, pattern: &str, handler: impl ContextHandler + 'static) {
		self.register(MethodKind::ALL, pattern, Arc::new(handler));
	}

	/// Register `handler` for one wire method.
	pub fn method(&self, method: Method, pattern: &str, handler: impl ContextHandler + 'static) {
		let Some(bit) = MethodKind::from_method(&method) else {
			panic!("nuages: {}", RouterError::MethodNotSupported(method.to_string()));
		};
		self.register(bit, pattern, Arc::new(handler));
	}

	/// Register `handler` under every real method bit set in `mask`.
	pub fn method_mask(
		&self,
		mask: MethodKind,
		pattern: &str,
		handler: impl ContextHandler + 'static,
	) {
		let handler: Arc<dyn ContextHandler> = Arc::new(handler);
		for bit in mask.iter_real() {
			self.register(bit, pattern, handler.clone());
		}
	}

	pub fn connect(&self, pattern: &str, handler: impl ContextHandler + 'static) {
		self.register(MethodKind::CONNECT, pattern, Arc::new(handler));
	}

	pub fn delete(&self, pattern: &str, handler: impl ContextHandler + 'static) {
		self.register(MethodKind::DELETE, pattern, Arc::new(handler));
	}

	pub fn get(&self, pattern: &str, handler: impl ContextHandler + 'static) {
		self.register(MethodKind::GET, pattern, Arc::new(handler));
	}

	pub fn head(&self, pattern: &str, handler: impl ContextHandler + 'static) {
		self.register(MethodKind::HEAD, pattern, Arc::new(handler));
	}

	pub fn options(&self, pattern: &str, handler: impl ContextHandler + 'static) {
		self.register(MethodKind::OPTIONS, pattern, Arc::new(handler));
	}

	pub fn patch(&self, pattern: &str, handler: impl ContextHandler + 'static) {
		self.register(MethodKind::PATCH, pattern, Arc::new(handler));
	}

	pub fn post(&self, pattern: &str, handler: impl ContextHandler + 'static) {
		self.register(MethodKind::POST, pattern, Arc::new(handler));
	}

	pub fn put(&self, pattern: &str, handler: impl ContextHandler + 'static) {
		self.register(MethodKind::PUT, pattern, Arc::new(handler));
	}

	pub fn trace(&self, pattern: &str, handler: impl ContextHandler + 'static) {
		self.register(MethodKind::TRACE, pattern, Arc::new(handler));
	}

	fn register(&self, mask: MethodKind, pattern: &str, handler: Arc<dyn ContextHandler>) {
		self.register_stored(mask, pattern, StoredHandler::Endpoint(handler), None)
			.unwrap_or_else(|e| panic!("nuages: {e}"));
	}

	fn register_stored(
		&self,
		mask: MethodKind,
		pattern: &str,
		stored: StoredHandler,
		subroutes: Option<Mux>,
	) -> RouterResult<()> {
		if pattern.is_empty() || !pattern.starts_with('/') {
			return Err(RouterError::bad_pattern(
				pattern,
				"routing pattern must begin with '/'",
			));
		}

		// Inline routers pre-wrap endpoints with their chain and become
		// servable through their own routing step.
		let stored = if self.inner.inline {
			let mux = self.clone();
			self.inner
				.handler
				.get_or_init(|| Arc::new(RouteHttp { mux }) as Arc<dyn ContextHandler>);
			match stored {
				StoredHandler::Endpoint(handler) => {
					StoredHandler::Endpoint(self.chain_endpoint(handler))
				}
				mount => mount,
			}
		} else {
			stored
		};

		let headers = self.inner.headers.read().clone();
		let overrides = self.inner.overrides.load(Ordering::SeqCst);

		if self.inner.api.load(Ordering::SeqCst) {
			for ext in self.api_extensions() {
				let variant = if pattern == "/" {
					format!("/.{ext}")
				} else {
					format!("{pattern}.{ext}")
				};
				self.inner.tree.insert(
					overrides,
					mask,
					&variant,
					stored.clone(),
					headers.clone(),
					subroutes.clone(),
				)?;
			}
		}
		self.inner
			.tree
			.insert(overrides, mask, pattern, stored, headers, subroutes)
	}

	// Compose interceptors ++ middlewares around an endpoint.
	fn chain_endpoint(&self, endpoint: Arc<dyn ContextHandler>) -> Arc<dyn ContextHandler> {
		let mut items = Vec::new();
		{
			let mut interceptors = self.inner.interceptors.lock();
			interceptors
				.build()
				.unwrap_or_else(|e| panic!("nuages: {e}"));
			items.extend(interceptors.items().iter().cloned());
		}
		{
			let mut middlewares = self.inner.middlewares.lock();
			middlewares
				.build()
				.unwrap_or_else(|e| panic!("nuages: {e}"));
			items.extend(middlewares.items().iter().cloned());
		}
		chain(items, endpoint)
	}

	// --- composition ---------------------------------------------------

	/// An inline child sharing this router's tree, with copied middleware
	/// stacks extended by `middlewares`. Handlers registered on it are
	/// pre-wrapped by its chain at insertion time.
	pub fn with<I>(&self, middlewares: I) -> Mux
	where
		I: IntoIterator<Item = Middleware>,
	{
		let (md, its, hits) = if self.inner.inline {
			(
				self.inner.middlewares.lock().copy(),
				self.inner.interceptors.lock().copy(),
				self.inner.handler_interceptors.lock().copy(),
			)
		} else {
			(
				MiddlewareStack::new("Middlewares", true),
				MiddlewareStack::new("Interceptors", false),
				MiddlewareStack::new("HandlerInterceptors", false),
			)
		};

		let child = Mux::new_inline(self, md, its, hits);
		child.use_middlewares(middlewares);
		child
	}

	/// An inline group with a fresh middleware scope.
	pub fn group(&self, f: impl FnOnce(&Mux)) -> Mux {
		let child = self.with(Vec::new());
		f(&child);
		child
	}

	/// Create a fresh router, configure it with `f`, and mount it at
	/// `pattern`.
	pub fn route(&self, pattern: &str, f: impl FnOnce(&Mux)) -> Mux {
		let sub = Mux::new();
		f(&sub);
		self.mount(pattern, sub.clone());
		sub
	}

	/// Mount a sub-router under `pattern`.
	///
	/// The mount registers stub endpoints at `pattern` and `pattern/` and
	/// a wildcard route at `pattern/*` whose tail capture becomes the
	/// sub-router's residual path. The sub-router inherits this router's
	/// NotFound and MethodNotAllowed handlers unless it has its own.
	pub fn mount(&self, pattern: &str, sub: Mux) {
		self.assert_mountable(pattern);

		if sub.inner.not_found.read().is_none() {
			if let Some(handler) = self.inner.not_found.read().clone() {
				sub.set_not_found_arc(handler);
			}
		}
		if sub.inner.method_not_allowed.read().is_none() {
			if let Some(handler) = self.inner.method_not_allowed.read().clone() {
				sub.set_method_not_allowed_arc(handler);
			}
		}

		sub.set_prefix(pattern);
		*sub.inner.parent.write() = Some(Arc::downgrade(&self.inner));

		let inner: Arc<dyn ContextHandler> = Arc::new(sub.clone());
		self.mount_target(pattern, inner, Some(sub));
	}

	/// Mount a plain handler under `pattern`; it receives the residual
	/// path through the routing context.
	pub fn mount_handler(&self, pattern: &str, handler: impl ContextHandler + 'static) {
		self.assert_mountable(pattern);
		self.mount_target(pattern, Arc::new(handler), None);
	}

	fn assert_mountable(&self, pattern: &str) {
		if self.inner.tree.find_pattern(&format!("{pattern}*"))
			|| self.inner.tree.find_pattern(&format!("{pattern}/*"))
		{
			panic!("nuages: attempting to mount a handler on an existing path '{pattern}'");
		}
	}

	fn mount_target(&self, pattern: &str, inner: Arc<dyn ContextHandler>, sub: Option<Mux>) {
		let mount = Arc::new(MountHandler::new(inner, sub.clone()));
		let mut pattern = pattern.to_string();

		if !pattern.ends_with('/') {
			self.register_stored(
				MethodKind::ALL | MethodKind::STUB,
				&pattern,
				StoredHandler::Mount(mount.clone()),
				None,
			)
			.unwrap_or_else(|e| panic!("nuages: {e}"));

			let fallback = ParentNotFound { mux: self.clone() };
			self.register_stored(
				MethodKind::ALL | MethodKind::STUB,
				&format!("{pattern}/"),
				StoredHandler::Endpoint(Arc::new(fallback)),
				None,
			)
			.unwrap_or_else(|e| panic!("nuages: {e}"));

			pattern.push('/');
		}

		let mut mask = MethodKind::ALL;
		if sub.is_some() {
			mask = mask | MethodKind::STUB;
		}
		self.register_stored(
			mask,
			&format!("{pattern}*"),
			StoredHandler::Mount(mount),
			sub,
		)
		.unwrap_or_else(|e| panic!("nuages: {e}"));
	}

	// --- scoped registration modes -------------------------------------

	/// Registrations inside `f` additionally install extension-annotated
	/// variants (`pattern.ext`) for every configured API extension.
	pub fn api(&self, f: impl FnOnce(&Mux)) {
		let old = self.inner.api.swap(true, Ordering::SeqCst);
		f(self);
		self.inner.api.store(old, Ordering::SeqCst);
	}

	/// Registrations inside `f` carry a required-header constraint.
	pub fn headers(&self, headers: HeaderMap, f: impl FnOnce(&Mux)) {
		let old = self.inner.headers.write().replace(headers);
		f(self);
		*self.inner.headers.write() = old;
	}

	/// Registrations inside `f` replace existing endpoints instead of
	/// failing on conflict.
	pub fn overrides(&self, f: impl FnOnce(&Mux)) {
		if self.inner.overrides.swap(true, Ordering::SeqCst) {
			f(self);
			return;
		}
		f(self);
		self.inner.overrides.store(false, Ordering::SeqCst);
	}

	// --- fallback handlers ---------------------------------------------

	/// Set the handler for unmatched paths. Propagates to mounted
	/// sub-routers that have none of their own.
	pub fn set_not_found(&self, handler: impl ContextHandler + 'static) {
		self.set_not_found_arc(Arc::new(handler));
	}

	fn set_not_found_arc(&self, handler: Arc<dyn ContextHandler>) {
		let (target, handler) = self.fallback_target(handler);
		*target.inner.not_found.write() = Some(handler.clone());
		for descriptor in target.routes() {
			if let Some(sub) = descriptor.subroutes {
				if sub.inner.not_found.read().is_none() {
					sub.set_not_found_arc(handler.clone());
				}
			}
		}
	}

	/// Set the handler for matched paths with no method variant.
	pub fn set_method_not_allowed(&self, handler: impl ContextHandler + 'static) {
		self.set_method_not_allowed_arc(Arc::new(handler));
	}

	fn set_method_not_allowed_arc(&self, handler: Arc<dyn ContextHandler>) {
		let (target, handler) = self.fallback_target(handler);
		*target.inner.method_not_allowed.write() = Some(handler.clone());
		for descriptor in target.routes() {
			if let Some(sub) = descriptor.subroutes {
				if sub.inner.method_not_allowed.read().is_none() {
					sub.set_method_not_allowed_arc(handler.clone());
				}
			}
		}
	}

	// Inline routers install fallbacks on their parent, wrapped by the
	// inline chain.
	fn fallback_target(
		&self,
		handler: Arc<dyn ContextHandler>,
	) -> (Mux, Arc<dyn ContextHandler>) {
		if self.inner.inline {
			if let Some(parent) = self.parent() {
				return (parent, self.chain_endpoint(handler));
			}
		}
		(self.clone(), handler)
	}

	pub fn not_found_handler(&self) -> Arc<dyn ContextHandler> {
		self.inner
			.not_found
			.read()
			.clone()
			.unwrap_or_else(default_not_found_handler)
	}

	pub fn method_not_allowed_handler(&self) -> Arc<dyn ContextHandler> {
		self.inner
			.method_not_allowed
			.read()
			.clone()
			.unwrap_or_else(default_method_not_allowed_handler)
	}

	fn parent(&self) -> Option<Mux> {
		self.inner
			.parent
			.read()
			.as_ref()
			.and_then(Weak::upgrade)
			.map(|inner| Mux { inner })
	}

	// --- introspection -------------------------------------------------

	/// Enumerate the registered routes of this router's tree.
	pub fn routes(&self) -> Vec<RouteDescriptor> {
		self.inner.tree.routes()
	}

	/// Search for a handler without executing it, descending into
	/// mounted sub-routers. The context accumulates captures as a real
	/// dispatch would.
	pub fn match_route(&self, ctx: &mut RouteContext, method: &Method, path: &str) -> bool {
		let Some(bit) = MethodKind::from_method(method) else {
			return false;
		};
		match self.inner.tree.find(ctx, bit, path) {
			Some(found) => {
				if let Some(sub) = found.subroutes {
					ctx.route_path = MountHandler::next_route_path(ctx);
					let residual = ctx.route_path.clone();
					return sub.match_route(ctx, method, &residual);
				}
				true
			}
			None => false,
		}
	}

	/// Resolve the handler a request would dispatch to, if any.
	pub fn find_handler(
		&self,
		method: &Method,
		path: &str,
		headers: Option<&HeaderMap>,
	) -> Option<Arc<dyn ContextHandler>> {
		let bit = MethodKind::from_method(method)?;
		let mut ctx = RouteContext::new();
		let found = self.inner.tree.find(&mut ctx, bit, path)?;
		let empty = HeaderMap::new();
		let stored = found.endpoint.find_variant(headers.unwrap_or(&empty))?;
		match stored {
			StoredHandler::Mount(mount) => match mount.sub_router() {
				Some(sub) => {
					let residual = MountHandler::next_route_path(&ctx);
					sub.find_handler(method, &residual, headers)
				}
				None => {
					let handler: Arc<dyn ContextHandler> = mount.clone();
					Some(handler)
				}
			},
			StoredHandler::Endpoint(handler) => Some(handler.clone()),
		}
	}

	// --- dispatch ------------------------------------------------------

	/// Serve one request with a pool-owned routing context.
	pub async fn serve(&self, w: &mut ResponseWriter, r: &mut Request) -> RouterResult<()> {
		let mut ctx = self.inner.pool.get();
		let result = self.serve_with_context(w, r, &mut ctx).await;
		self.inner.pool.put(ctx);
		result
	}

	/// Serve one request against a caller-supplied routing context.
	pub async fn serve_with_context(
		&self,
		w: &mut ResponseWriter,
		r: &mut Request,
		ctx: &mut RouteContext,
	) -> RouterResult<()> {
		let url = original_url(r);

		if ctx.log.is_none() {
			let host = r.header("host").unwrap_or("").to_string();
			ctx.log = Some(tracing::info_span!("request", host = %host));
		}

		ctx.push_router(self.clone());
		let result = self.dispatch(&url, w, r, ctx).await;
		ctx.pop_router();
		result
	}

	async fn dispatch(
		&self,
		url: &Uri,
		w: &mut ResponseWriter,
		r: &mut Request,
		ctx: &mut RouteContext,
	) -> RouterResult<()> {
		let handler = match self.inner.handler.get() {
			Some(handler) => handler.clone(),
			None if self.inner.inline => return Err(RouterError::NoHandlers),
			None => self.build_route_handler(),
		};

		if !self.is_log_requests() && !self.is_intercept_errors() {
			return handler.serve(w, r, ctx).await;
		}

		let begin = Instant::now();
		let result = if self.is_intercept_errors() {
			match AssertUnwindSafe(handler.serve(w, r, ctx)).catch_unwind().await {
				Ok(result) => result,
				Err(payload) => Err(RouterError::handler(panic_message(payload.as_ref()))),
			}
		} else {
			handler.serve(w, r, ctx).await
		};

		let result = match result {
			Err(err) if self.is_intercept_errors() => {
				match self.inner.error_handler.read().clone() {
					Some(custom) => custom(url, self.is_debug(), w, r, ctx, begin, &err),
					None => default_error_handler(url, self.is_debug(), w, r, ctx, begin, &err),
				}
				Ok(())
			}
			other => other,
		};

		if self.is_log_requests() {
			match self.inner.log_handler.read().clone() {
				Some(custom) => custom(url, w, r, ctx, begin),
				None => default_log_requests(url, w, r, ctx, begin),
			}
		}

		result
	}

	// Build the memoized dispatch handler: merge ancestor post-match
	// interceptors into this router's stack, build all three stacks, and
	// chain interceptors ++ middlewares around the routing step.
	fn build_route_handler(&self) -> Arc<dyn ContextHandler> {
		self.inner
			.handler
			.get_or_init(|| {
				let mux = self.clone();
				let mut handler: Arc<dyn ContextHandler> = Arc::new(RouteHttp { mux });
				if let Some(hook) = self.inner.route_handler.read().clone() {
					handler = Arc::new(HookHandler { hook, main: handler });
				}

				let mut levels: Vec<Vec<Arc<Middleware>>> = Vec::new();
				let mut cursor = Some(self.clone());
				while let Some(mux) = cursor {
					let level = mux.inner.handler_interceptors.lock().all();
					if !level.is_empty() {
						levels.push(level);
					}
					cursor = mux.parent();
				}
				let inherited: Vec<Arc<Middleware>> = levels
					.iter()
					.rev()
					.flat_map(|level| level.iter().cloned())
					.collect();
				{
					let mut hits = self.inner.handler_interceptors.lock();
					hits.add_shared(inherited, DuplicationPolicy::Skip)
						.unwrap_or_else(|e| panic!("nuages: {e}"));
					hits.build().unwrap_or_else(|e| panic!("nuages: {e}"));
				}

				self.chain_endpoint(handler)
			})
			.clone()
	}

	// The routing step: resolve path and method, search the tree, and
	// dispatch the match or the appropriate fallback.
	pub(crate) async fn route_http(
		&self,
		w: &mut ResponseWriter,
		r: &mut Request,
		ctx: &mut RouteContext,
	) -> RouterResult<()> {
		let route_path = if !ctx.route_path.is_empty() {
			ctx.route_path.clone()
		} else {
			r.uri.path().to_string()
		};

		if ctx.route_method.is_none() {
			ctx.route_method = Some(r.method.clone());
		}
		let method = ctx.route_method.clone().unwrap_or_else(|| r.method.clone());
		let Some(bit) = MethodKind::from_method(&method) else {
			return self.method_not_allowed_handler().serve(w, r, ctx).await;
		};

		if let Some(found) = self.inner.tree.find(ctx, bit, &route_path) {
			self.stamp_api_ext(ctx, &found.pattern);
			return self.dispatch_match(found, w, r, ctx).await;
		}

		// Extension rewrite: `…/name.ext` resolves against the `/.ext`
		// variant registered by API-scoped routes.
		for ext in self.api_extensions() {
			let marker = format!(".{ext}");
			if let Some(pos) = route_path.rfind(&marker) {
				let rewritten = format!("{}/.{}", &route_path[..pos], ext);
				if let Some(found) = self.inner.tree.find(ctx, bit, &rewritten) {
					ctx.api_ext = Some(ext.clone());
					return self.dispatch_match(found, w, r, ctx).await;
				}
			}
		}

		if ctx.method_not_allowed {
			self.method_not_allowed_handler().serve(w, r, ctx).await
		} else {
			self.not_found_handler().serve(w, r, ctx).await
		}
	}

	// A direct hit on an API-extension variant records the extension.
	fn stamp_api_ext(&self, ctx: &mut RouteContext, pattern: &str) {
		if ctx.api_ext.is_some() {
			return;
		}
		for ext in self.api_extensions() {
			let marker = format!(".{ext}");
			if let Some(base) = pattern.strip_suffix(&marker) {
				let base = if base.is_empty() { "/" } else { base };
				if self.inner.tree.find_pattern(base) {
					ctx.api_ext = Some(ext);
					return;
				}
			}
		}
	}

	async fn dispatch_match(
		&self,
		found: RouteMatch,
		w: &mut ResponseWriter,
		r: &mut Request,
		ctx: &mut RouteContext,
	) -> RouterResult<()> {
		let Some(stored) = found.endpoint.find_variant(&r.headers).cloned() else {
			w.write_header(StatusCode::BAD_REQUEST);
			return Ok(());
		};

		match stored {
			StoredHandler::Mount(mount) => mount.serve(w, r, ctx).await,
			StoredHandler::Endpoint(handler) => {
				ctx.handler = Some(handler.clone());
				let interceptors = {
					let mut hits = self.inner.handler_interceptors.lock();
					if hits.is_empty() {
						Vec::new()
					} else {
						hits.build()?;
						hits.items().to_vec()
					}
				};
				if interceptors.is_empty() {
					handler.serve(w, r, ctx).await
				} else {
					chain(interceptors, handler).serve(w, r, ctx).await
				}
			}
		}
	}
}

#[async_trait]
impl ContextHandler for Mux {
	async fn serve(
		&self,
		w: &mut ResponseWriter,
		r: &mut Request,
		ctx: &mut RouteContext,
	) -> RouterResult<()> {
		self.serve_with_context(w, r, ctx).await
	}
}

impl Default for Mux {
	fn default() -> Self {
		Self::new()
	}
}
