//! Composable, tree-based HTTP request multiplexer
//!
//! `nuages` is a routing and dispatch kernel: it parses a request path,
//! records URL parameters, and executes an end handler through an
//! ordered middleware chain. It owns no listener and no wire format; an
//! HTTP transport hands it `(writer, request)` pairs and reads the
//! response back out of the writer.
//!
//! The pieces:
//!
//! - a radix-trie pattern matcher keyed by (method bitmask, pattern),
//!   with parametric segments (`{name}`, `{name:regex}`) and a trailing
//!   wildcard (`*`);
//! - a middleware composition engine with named middlewares ordered by
//!   `before`/`after` constraints and anonymous middlewares trailing in
//!   insertion order;
//! - a recursive dispatch model threading a pooled [`RouteContext`]
//!   through nested sub-routers mounted at path prefixes.
//!
//! # Examples
//!
//! ```
//! use nuages::{context_handler_fn, Mux};
//!
//! let mux = Mux::new();
//! mux.get("/", context_handler_fn(|w, _r, _ctx| {
//!     w.write("root.");
//!     Ok(())
//! }));
//! mux.route("/users", |r| {
//!     r.get("/{id}", context_handler_fn(|w, _r, ctx| {
//!         let id = ctx.url_param("id").unwrap_or("").to_string();
//!         w.write(id);
//!         Ok(())
//!     }));
//! });
//! ```

mod chain;
mod context;
mod error;
mod handler;
mod log;
mod method;
mod middleware;
mod mux;
mod params;
mod request;
mod response;
mod tree;

pub use chain::{chain, ChainHandler, ChainOverrides, ChainRunner};
pub use context::{
	chain_request_observer, request_observer, ChainRequestObserver, RequestObserver, RouteContext,
};
pub use error::{RouterError, RouterResult};
pub use handler::{
	context_handler_fn, default_method_not_allowed_handler, default_not_found_handler,
	http_handler_fn, value_handler_fn, ContextHandler,
};
pub use log::{
	default_error_handler, default_log_requests, ErrorHandler, LogRequestsHandler,
	LOG_REQUEST_IGNORE,
};
pub use method::MethodKind;
pub use middleware::{
	middleware_fn, ChainMiddleware, DuplicationPolicy, Middleware, MiddlewareStack,
};
pub use mux::{MountHandler, Mux, RouteHandlerHook};
pub use params::{RouteParams, UrlParams};
pub use request::{
	header_map, original_url, set_original_url, set_original_url_if_unset, Extensions, Request,
	RequestBuilder, ORIGINAL_URL_KEY,
};
pub use response::ResponseWriter;
pub use tree::RouteDescriptor;
