use crate::context::RouteContext;
use crate::error::RouterError;
use crate::request::Request;
use crate::response::ResponseWriter;
use hyper::{StatusCode, Uri};
use once_cell::sync::Lazy;
use regex::Regex;
use std::backtrace::Backtrace;
use std::sync::Arc;
use std::time::Instant;

/// Static asset paths skipped by the finish log unless they failed.
pub static LOG_REQUEST_IGNORE: Lazy<Regex> =
	Lazy::new(|| Regex::new(r"\.(css|js|jpg|png|ico|ttf|woff2?)$").expect("valid ignore regex"));

/// Callback invoked after every dispatch when request logging is on.
pub type LogRequestsHandler =
	Arc<dyn Fn(&Uri, &ResponseWriter, &Request, &RouteContext, Instant) + Send + Sync>;

/// Callback invoked with an intercepted dispatch failure.
pub type ErrorHandler = Arc<
	dyn Fn(&Uri, bool, &mut ResponseWriter, &Request, &RouteContext, Instant, &RouterError)
		+ Send
		+ Sync,
>;

// `GET -> POST` when a middleware overrode the routed method.
fn display_method(request: &Request, ctx: &RouteContext) -> String {
	match &ctx.route_method {
		Some(routed) if *routed != request.method => {
			format!("{} -> {}", request.method, routed)
		}
		_ => request.method.to_string(),
	}
}

/// Default finish-line logger.
///
/// Emits `Finish [METHOD] STATUS URL Took N.NNms`, skipping static asset
/// extensions unless the response failed.
pub fn default_log_requests(
	url: &Uri,
	w: &ResponseWriter,
	request: &Request,
	ctx: &RouteContext,
	begin: Instant,
) {
	if LOG_REQUEST_IGNORE.is_match(request.uri.path()) && w.status().as_u16() < 400 {
		return;
	}
	let _guard = ctx.log.as_ref().map(|span| span.enter());
	tracing::debug!(
		"Finish [{}] {} {} Took {:.2}ms",
		display_method(request, ctx),
		w.status().as_u16(),
		url,
		begin.elapsed().as_secs_f64() * 1000.0,
	);
}

/// Default error renderer for intercepted dispatch failures.
///
/// Writes a 500, always sends the failure and a captured backtrace to the
/// error sink, and reveals detail in the body only in debug mode.
pub fn default_error_handler(
	url: &Uri,
	debug: bool,
	w: &mut ResponseWriter,
	request: &Request,
	ctx: &RouteContext,
	begin: Instant,
	err: &RouterError,
) {
	w.set_status(StatusCode::INTERNAL_SERVER_ERROR);

	let stack = Backtrace::force_capture().to_string();
	{
		let _guard = ctx.log.as_ref().map(|span| span.enter());
		tracing::error!("Request failure: {err}\n{stack}");
	}

	if debug {
		w.write(format!("\nRequest failure: {err}\n"));
		w.write(&stack);
	} else {
		w.write("Request failure. See system administrator to solve it.");
	}

	let _guard = ctx.log.as_ref().map(|span| span.enter());
	tracing::debug!(
		"Finish [{}] {} {} Took {:.2}ms",
		display_method(request, ctx),
		w.status().as_u16(),
		url,
		begin.elapsed().as_secs_f64() * 1000.0,
	);
}
