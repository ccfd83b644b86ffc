use crate::context::RouteContext;
use crate::error::RouterResult;
use crate::handler::ContextHandler;
use crate::middleware::Middleware;
use crate::request::{Extensions, Request};
use crate::response::ResponseWriter;
use async_trait::async_trait;
use std::mem;
use std::sync::Arc;

/// Replacement values a middleware may install for the rest of the chain
///
/// Passed to [`ChainRunner::next_with`]; anything left `None` keeps the
/// current value. The installed values are live for the downstream
/// middlewares and the endpoint, then swapped out again and handed back
/// to the caller when `next_with` returns.
#[derive(Default)]
pub struct ChainOverrides {
	pub writer: Option<ResponseWriter>,
	pub request: Option<Request>,
	pub context: Option<RouteContext>,
	/// Replacement for the request's attached logical context. Applied as
	/// a request replacement, so request observers fire.
	pub extensions: Option<Extensions>,
}

impl ChainOverrides {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_writer(mut self, writer: ResponseWriter) -> Self {
		self.writer = Some(writer);
		self
	}

	pub fn with_request(mut self, request: Request) -> Self {
		self.request = Some(request);
		self
	}

	pub fn with_context(mut self, context: RouteContext) -> Self {
		self.context = Some(context);
		self
	}

	pub fn with_extensions(mut self, extensions: Extensions) -> Self {
		self.extensions = Some(extensions);
		self
	}
}

/// Execution state machine for one middleware chain
///
/// A runner threads the `(writer, request, context)` triple through the
/// materialized middleware sequence and the terminal endpoint. Each
/// middleware receives the runner and drives it:
///
/// - [`next`](ChainRunner::next) runs the remainder of the chain and the
///   endpoint, then restores the triple to what this middleware saw.
/// - [`pass`](ChainRunner::pass) asks the runner to re-enter the current
///   slot on the next loop turn instead of advancing, which lets a
///   middleware yield to another sub-router without consuming its slot.
/// - [`set_request`](ChainRunner::set_request) replaces the request and
///   notifies every observer registered on the routing context.
pub struct ChainRunner<'a> {
	middlewares: &'a [Arc<Middleware>],
	endpoint: &'a Arc<dyn ContextHandler>,
	index: usize,
	pass: bool,
	writer: &'a mut ResponseWriter,
	request: &'a mut Request,
	context: &'a mut RouteContext,
}

impl<'a> ChainRunner<'a> {
	pub(crate) fn new(
		middlewares: &'a [Arc<Middleware>],
		endpoint: &'a Arc<dyn ContextHandler>,
		writer: &'a mut ResponseWriter,
		request: &'a mut Request,
		context: &'a mut RouteContext,
	) -> Self {
		Self {
			middlewares,
			endpoint,
			index: 0,
			pass: false,
			writer,
			request,
			context,
		}
	}

	pub fn writer(&mut self) -> &mut ResponseWriter {
		self.writer
	}

	pub fn request(&self) -> &Request {
		self.request
	}

	pub fn context(&mut self) -> &mut RouteContext {
		self.context
	}

	/// Position of the next slot to run; slots before it have started.
	pub fn index(&self) -> usize {
		self.index
	}

	/// Request re-entry of the current slot instead of advancing.
	pub fn pass(&mut self) {
		self.pass = true;
	}

	/// Replace the request, firing every registered request observer.
	/// Returns the request that was current before the call.
	pub fn set_request(&mut self, request: Request) -> Request {
		let previous = mem::replace(self.request, request);
		for observer in self.context.request_observers.values() {
			observer.set_request(self.request);
		}
		let index = self.index;
		for observer in self.context.chain_request_observers.values() {
			observer.set_request(index, self.request);
		}
		previous
	}

	/// Run the rest of the chain and the endpoint.
	pub async fn next(&mut self) -> RouterResult<()> {
		self.next_with(ChainOverrides::default()).await.map(|_| ())
	}

	/// Run the rest of the chain with replacement values installed for
	/// its duration. On return the prior triple is restored and the
	/// override values are handed back, carrying whatever downstream
	/// mutated into them.
	pub async fn next_with(&mut self, overrides: ChainOverrides) -> RouterResult<ChainOverrides> {
		let ChainOverrides {
			writer,
			request,
			context,
			extensions,
		} = overrides;

		let saved_writer = writer.map(|w| mem::replace(self.writer, w));
		let mut saved_request = request.map(|r| self.set_request(r));
		if let Some(extensions) = extensions {
			let mut replacement = self.request.clone();
			replacement.extensions = extensions;
			let prior = self.set_request(replacement);
			if saved_request.is_none() {
				saved_request = Some(prior);
			}
		}
		let saved_context = context.map(|c| mem::replace(self.context, c));

		let old_pass = self.pass;
		self.pass = false;

		let mut result = Ok(());
		loop {
			if self.index < self.middlewares.len() {
				let middleware = self.middlewares[self.index].clone();
				self.index += 1;
				result = middleware.handler().clone().run(self).await;
			} else if self.index == self.middlewares.len() {
				self.index += 1;
				let endpoint = self.endpoint.clone();
				result = endpoint.serve(self.writer, self.request, self.context).await;
			}
			if result.is_err() {
				break;
			}
			if self.pass {
				self.pass = false;
			} else {
				break;
			}
		}
		self.pass = old_pass;

		let handed_back = ChainOverrides {
			writer: saved_writer.map(|old| mem::replace(self.writer, old)),
			request: saved_request.map(|old| mem::replace(self.request, old)),
			context: saved_context.map(|old| mem::replace(self.context, old)),
			extensions: None,
		};
		result.map(|_| handed_back)
	}
}

/// A materialized middleware sequence around a terminal endpoint
///
/// Itself a [`ContextHandler`], so chains nest: a chain can be the
/// endpoint of an outer chain, which is how pre-route interceptors wrap
/// the routing step and post-match interceptors wrap endpoints.
pub struct ChainHandler {
	middlewares: Vec<Arc<Middleware>>,
	endpoint: Arc<dyn ContextHandler>,
}

impl ChainHandler {
	pub fn new(middlewares: Vec<Arc<Middleware>>, endpoint: Arc<dyn ContextHandler>) -> Self {
		Self {
			middlewares,
			endpoint,
		}
	}
}

#[async_trait]
impl ContextHandler for ChainHandler {
	async fn serve(
		&self,
		w: &mut ResponseWriter,
		r: &mut Request,
		ctx: &mut RouteContext,
	) -> RouterResult<()> {
		ctx.handler = Some(self.endpoint.clone());
		let mut runner = ChainRunner::new(&self.middlewares, &self.endpoint, w, r, ctx);
		runner.next().await
	}
}

/// Compose middlewares around an endpoint, collapsing the empty chain.
pub fn chain(
	middlewares: Vec<Arc<Middleware>>,
	endpoint: Arc<dyn ContextHandler>,
) -> Arc<dyn ContextHandler> {
	if middlewares.is_empty() {
		return endpoint;
	}
	Arc::new(ChainHandler::new(middlewares, endpoint))
}
