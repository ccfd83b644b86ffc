use crate::context::RouteContext;
use crate::error::RouterResult;
use crate::request::Request;
use crate::response::ResponseWriter;
use async_trait::async_trait;
use hyper::StatusCode;
use std::any::Any;
use std::sync::Arc;

/// Handler capability for request dispatch
///
/// This is the core abstraction: endpoints, middleware chains, mount
/// wrappers and whole routers all implement it. The supplied references
/// stay valid for the duration of one dispatch; a handler writes its
/// response through `w` and reports failure through the result.
#[async_trait]
pub trait ContextHandler: Send + Sync {
	async fn serve(
		&self,
		w: &mut ResponseWriter,
		r: &mut Request,
		ctx: &mut RouteContext,
	) -> RouterResult<()>;
}

/// Blanket implementation for `Arc<T>` so `Arc<dyn ContextHandler>` is
/// itself a handler.
#[async_trait]
impl<T: ContextHandler + ?Sized> ContextHandler for Arc<T> {
	async fn serve(
		&self,
		w: &mut ResponseWriter,
		r: &mut Request,
		ctx: &mut RouteContext,
	) -> RouterResult<()> {
		(**self).serve(w, r, ctx).await
	}
}

struct ContextFnHandler<F>(F);

#[async_trait]
impl<F> ContextHandler for ContextFnHandler<F>
where
	F: Fn(&mut ResponseWriter, &mut Request, &mut RouteContext) -> RouterResult<()>
		+ Send
		+ Sync,
{
	async fn serve(
		&self,
		w: &mut ResponseWriter,
		r: &mut Request,
		ctx: &mut RouteContext,
	) -> RouterResult<()> {
		(self.0)(w, r, ctx)
	}
}

struct HttpFnHandler<F>(F);

#[async_trait]
impl<F> ContextHandler for HttpFnHandler<F>
where
	F: Fn(&mut ResponseWriter, &Request) -> RouterResult<()> + Send + Sync,
{
	async fn serve(
		&self,
		w: &mut ResponseWriter,
		r: &mut Request,
		_ctx: &mut RouteContext,
	) -> RouterResult<()> {
		(self.0)(w, r)
	}
}

struct ValueFnHandler<F>(F);

#[async_trait]
impl<F> ContextHandler for ValueFnHandler<F>
where
	F: Fn(Option<&(dyn Any + Send + Sync)>) -> RouterResult<()> + Send + Sync,
{
	async fn serve(
		&self,
		_w: &mut ResponseWriter,
		_r: &mut Request,
		ctx: &mut RouteContext,
	) -> RouterResult<()> {
		(self.0)(ctx.value_any())
	}
}

/// Adapt a context-aware closure `(w, r, ctx)` into a handler.
///
/// This is the richest of the fixed adapter shapes; handlers that need to
/// await should implement [`ContextHandler`] directly.
///
/// # Examples
///
/// ```
/// use nuages::{context_handler_fn, Mux};
///
/// let mux = Mux::new();
/// mux.get("/users/{id}", context_handler_fn(|w, _r, ctx| {
///     let id = ctx.url_param("id").unwrap_or("").to_string();
///     w.write(id);
///     Ok(())
/// }));
/// ```
pub fn context_handler_fn<F>(f: F) -> impl ContextHandler
where
	F: Fn(&mut ResponseWriter, &mut Request, &mut RouteContext) -> RouterResult<()>
		+ Send
		+ Sync
		+ 'static,
{
	ContextFnHandler(f)
}

/// Adapt a plain `(w, r)` closure into a handler.
pub fn http_handler_fn<F>(f: F) -> impl ContextHandler
where
	F: Fn(&mut ResponseWriter, &Request) -> RouterResult<()> + Send + Sync + 'static,
{
	HttpFnHandler(f)
}

/// Adapt a closure over the context's current value into a handler.
///
/// The closure receives the data-bag entry selected by the context's
/// `default_value_key`, the way value-shaped endpoints consume a payload
/// prepared by earlier middleware.
pub fn value_handler_fn<F>(f: F) -> impl ContextHandler
where
	F: Fn(Option<&(dyn Any + Send + Sync)>) -> RouterResult<()> + Send + Sync + 'static,
{
	ValueFnHandler(f)
}

pub(crate) struct DefaultNotFound;

#[async_trait]
impl ContextHandler for DefaultNotFound {
	async fn serve(
		&self,
		w: &mut ResponseWriter,
		_r: &mut Request,
		_ctx: &mut RouteContext,
	) -> RouterResult<()> {
		w.write_header(StatusCode::NOT_FOUND);
		w.write("404 page not found\n");
		Ok(())
	}
}

pub(crate) struct DefaultMethodNotAllowed;

#[async_trait]
impl ContextHandler for DefaultMethodNotAllowed {
	async fn serve(
		&self,
		w: &mut ResponseWriter,
		_r: &mut Request,
		_ctx: &mut RouteContext,
	) -> RouterResult<()> {
		w.write_header(StatusCode::METHOD_NOT_ALLOWED);
		Ok(())
	}
}

/// The stock 404 responder used when a router has no custom handler.
pub fn default_not_found_handler() -> Arc<dyn ContextHandler> {
	Arc::new(DefaultNotFound)
}

/// The stock 405 responder: status only, empty body.
pub fn default_method_not_allowed_handler() -> Arc<dyn ContextHandler> {
	Arc::new(DefaultMethodNotAllowed)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn parts() -> (ResponseWriter, Request, RouteContext) {
		(
			ResponseWriter::new(),
			Request::builder().uri("/x").build().unwrap(),
			RouteContext::new(),
		)
	}

	#[tokio::test]
	async fn test_context_fn_adapter() {
		let handler = context_handler_fn(|w, _r, ctx| {
			ctx.insert_data("seen", true);
			w.write("ok");
			Ok(())
		});
		let (mut w, mut r, mut ctx) = parts();

		handler.serve(&mut w, &mut r, &mut ctx).await.unwrap();

		assert_eq!(w.body(), b"ok");
		assert_eq!(ctx.data::<bool>("seen"), Some(&true));
	}

	#[tokio::test]
	async fn test_http_fn_adapter_ignores_context() {
		let handler = http_handler_fn(|w, r| {
			w.write(r.path());
			Ok(())
		});
		let (mut w, mut r, mut ctx) = parts();

		handler.serve(&mut w, &mut r, &mut ctx).await.unwrap();

		assert_eq!(w.body(), b"/x");
	}

	#[tokio::test]
	async fn test_value_fn_adapter_reads_current_value() {
		let handler = value_handler_fn(|value| {
			let n = value.and_then(|v| v.downcast_ref::<u32>()).copied();
			assert_eq!(n, Some(9));
			Ok(())
		});
		let (mut w, mut r, mut ctx) = parts();
		ctx.set_value(9u32);

		handler.serve(&mut w, &mut r, &mut ctx).await.unwrap();
	}

	#[tokio::test]
	async fn test_default_not_found() {
		let (mut w, mut r, mut ctx) = parts();
		default_not_found_handler()
			.serve(&mut w, &mut r, &mut ctx)
			.await
			.unwrap();
		assert_eq!(w.status(), StatusCode::NOT_FOUND);
	}

	#[tokio::test]
	async fn test_default_method_not_allowed_has_empty_body() {
		let (mut w, mut r, mut ctx) = parts();
		default_method_not_allowed_handler()
			.serve(&mut w, &mut r, &mut ctx)
			.await
			.unwrap();
		assert_eq!(w.status(), StatusCode::METHOD_NOT_ALLOWED);
		assert!(w.body().is_empty());
	}
}
