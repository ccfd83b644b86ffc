// Dispatch behaviour of a single router: matching, captures, method
// fallback, API extension variants, header variants, error interception.

use async_trait::async_trait;
use hyper::{Method, StatusCode};
use nuages::{
	context_handler_fn, header_map, ChainMiddleware, ChainRunner, ContextHandler, Middleware,
	Mux, Request, ResponseWriter, RouteContext, RouterError, RouterResult,
};
use rstest::rstest;
use std::sync::Arc;

fn request(method: Method, path: &str) -> Request {
	Request::builder().method(method).uri(path).build().unwrap()
}

async fn dispatch(mux: &Mux, method: Method, path: &str) -> (StatusCode, String) {
	let mut w = ResponseWriter::new();
	let mut r = request(method, path);
	mux.serve(&mut w, &mut r).await.unwrap();
	let (status, _, body) = w.into_parts();
	(status, String::from_utf8_lossy(&body).to_string())
}

fn echo(body: &'static str) -> impl ContextHandler {
	context_handler_fn(move |w, _r, _ctx| {
		w.write(body);
		Ok(())
	})
}

#[tokio::test]
async fn test_get_with_param_invokes_handler() {
	let mux = Mux::new();
	mux.get(
		"/users/{id}",
		context_handler_fn(|w, _r, ctx| {
			let id = ctx.url_param("id").unwrap_or("").to_string();
			w.write(format!("user={id}"));
			Ok(())
		}),
	);

	let (status, body) = dispatch(&mux, Method::GET, "/users/42").await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(body, "user=42");
}

#[tokio::test]
async fn test_method_mismatch_yields_405_empty_body() {
	let mux = Mux::new();
	mux.get("/x", echo("x"));

	let (status, body) = dispatch(&mux, Method::POST, "/x").await;
	assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
	assert!(body.is_empty());
}

#[tokio::test]
async fn test_unmatched_path_yields_404() {
	let mux = Mux::new();
	mux.get("/x", echo("x"));

	let (status, _) = dispatch(&mux, Method::GET, "/missing").await;
	assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_custom_not_found_handler() {
	let mux = Mux::new();
	mux.get("/x", echo("x"));
	mux.set_not_found(context_handler_fn(|w, _r, _ctx| {
		w.write_header(StatusCode::NOT_FOUND);
		w.write("nothing here");
		Ok(())
	}));

	let (status, body) = dispatch(&mux, Method::GET, "/missing").await;
	assert_eq!(status, StatusCode::NOT_FOUND);
	assert_eq!(body, "nothing here");
}

#[tokio::test]
async fn test_handle_serves_every_method() {
	let mux = Mux::new();
	mux.handle("/any", echo("any"));

	for method in [Method::GET, Method::POST, Method::DELETE, Method::PATCH] {
		let (status, body) = dispatch(&mux, method, "/any").await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(body, "any");
	}
}

#[tokio::test]
async fn test_method_mask_registers_selected_bits() {
	use nuages::MethodKind;

	let mux = Mux::new();
	mux.method_mask(MethodKind::GET | MethodKind::POST, "/multi", echo("m"));

	assert_eq!(dispatch(&mux, Method::GET, "/multi").await.0, StatusCode::OK);
	assert_eq!(dispatch(&mux, Method::POST, "/multi").await.0, StatusCode::OK);
	assert_eq!(
		dispatch(&mux, Method::DELETE, "/multi").await.0,
		StatusCode::METHOD_NOT_ALLOWED
	);
}

#[tokio::test]
async fn test_unknown_wire_method_routes_to_method_not_allowed() {
	let mux = Mux::new();
	mux.get("/x", echo("x"));

	let propfind = Method::from_bytes(b"PROPFIND").unwrap();
	let (status, _) = dispatch(&mux, propfind, "/x").await;
	assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
}

#[rstest]
#[case("/users/{id}", "/users/42", &[("id", "42")])]
#[case("/users/{uid}/posts/{pid}", "/users/1/posts/9", &[("uid", "1"), ("pid", "9")])]
#[case("/items/{id:[0-9]+}", "/items/7", &[("id", "7")])]
#[case("/files/*", "/files/a/b.txt", &[("*", "a/b.txt")])]
#[tokio::test]
async fn test_url_params_ordered_left_to_right(
	#[case] pattern: &'static str,
	#[case] path: &str,
	#[case] expected: &[(&str, &str)],
) {
	let expected: Vec<(String, String)> = expected
		.iter()
		.map(|(k, v)| (k.to_string(), v.to_string()))
		.collect();
	let expected_keys: Vec<String> = expected.iter().map(|(k, _)| k.clone()).collect();

	let mux = Mux::new();
	let expected_clone = expected.clone();
	let expected_keys_clone = expected_keys.clone();
	mux.get(
		pattern,
		context_handler_fn(move |w, _r, ctx| {
			assert_eq!(ctx.url_params.keys(), expected_keys_clone.as_slice());
			for (key, value) in &expected_clone {
				assert_eq!(ctx.url_param(key), Some(value.as_str()));
			}
			w.write("ok");
			Ok(())
		}),
	);

	let (status, body) = dispatch(&mux, Method::GET, path).await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(body, "ok");
}

#[tokio::test]
#[should_panic(expected = "duplicate handler")]
async fn test_duplicate_registration_panics() {
	let mux = Mux::new();
	mux.get("/x", echo("a"));
	mux.get("/x", echo("b"));
}

#[tokio::test]
async fn test_overrides_scope_replaces_endpoint() {
	let mux = Mux::new();
	mux.get("/x", echo("old"));
	mux.overrides(|r| {
		r.get("/x", echo("new"));
	});

	let (_, body) = dispatch(&mux, Method::GET, "/x").await;
	assert_eq!(body, "new");
}

#[tokio::test]
#[should_panic(expected = "must begin with '/'")]
async fn test_pattern_without_leading_slash_panics() {
	let mux = Mux::new();
	mux.get("no-slash", echo("x"));
}

#[tokio::test]
async fn test_api_scope_serves_plain_and_extension_variant() {
	let mux = Mux::new();
	mux.api(|r| {
		r.get(
			"/items",
			context_handler_fn(|w, _r, ctx| {
				let ext = ctx.api_ext.clone().unwrap_or_default();
				w.write(format!("items ext={ext}"));
				Ok(())
			}),
		);
	});

	let (status, body) = dispatch(&mux, Method::GET, "/items").await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(body, "items ext=");

	let (status, body) = dispatch(&mux, Method::GET, "/items.json").await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(body, "items ext=json");
}

#[tokio::test]
async fn test_headers_scope_constrains_variant() {
	let mux = Mux::new();
	mux.headers(header_map(&[("accept", "application/json")]), |r| {
		r.get("/data", echo("json"));
	});

	// Matching header selects the variant.
	let mut w = ResponseWriter::new();
	let mut r = Request::builder()
		.method(Method::GET)
		.uri("/data")
		.header("accept", "application/json")
		.build()
		.unwrap();
	mux.serve(&mut w, &mut r).await.unwrap();
	assert_eq!(w.status(), StatusCode::OK);

	// No variant satisfied: 400 Bad Request.
	let (status, _) = dispatch(&mux, Method::GET, "/data").await;
	assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_header_variants_disambiguate_one_pattern() {
	let mux = Mux::new();
	mux.headers(header_map(&[("accept", "application/json")]), |r| {
		r.get("/content", echo("json"));
	});
	mux.get("/content", echo("fallback"));

	let mut w = ResponseWriter::new();
	let mut r = Request::builder()
		.method(Method::GET)
		.uri("/content")
		.header("accept", "application/json")
		.build()
		.unwrap();
	mux.serve(&mut w, &mut r).await.unwrap();
	let (_, _, body) = w.into_parts();
	assert_eq!(&body[..], b"json");

	let (_, body) = dispatch(&mux, Method::GET, "/content").await;
	assert_eq!(body, "fallback");
}

struct Failing;

#[async_trait]
impl ContextHandler for Failing {
	async fn serve(
		&self,
		_w: &mut ResponseWriter,
		_r: &mut Request,
		_ctx: &mut RouteContext,
	) -> RouterResult<()> {
		Err(RouterError::handler("boom"))
	}
}

struct Panicking;

#[async_trait]
impl ContextHandler for Panicking {
	async fn serve(
		&self,
		_w: &mut ResponseWriter,
		_r: &mut Request,
		_ctx: &mut RouteContext,
	) -> RouterResult<()> {
		panic!("handler exploded");
	}
}

#[tokio::test]
async fn test_intercepted_error_with_debug_renders_detail() {
	let mux = Mux::new();
	mux.intercept_errors().debug();
	mux.get("/fail", Failing);

	let (status, body) = dispatch(&mux, Method::GET, "/fail").await;
	assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
	assert!(body.contains("boom"));
}

#[tokio::test]
async fn test_intercepted_error_without_debug_is_generic() {
	let mux = Mux::new();
	mux.intercept_errors();
	mux.get("/fail", Failing);

	let (status, body) = dispatch(&mux, Method::GET, "/fail").await;
	assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
	assert!(!body.contains("boom"));
	assert!(body.contains("system administrator"));
}

#[tokio::test]
async fn test_intercepted_panic_becomes_500() {
	let mux = Mux::new();
	mux.intercept_errors().debug();
	mux.get("/panic", Panicking);

	let (status, body) = dispatch(&mux, Method::GET, "/panic").await;
	assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
	assert!(body.contains("handler exploded"));
}

#[tokio::test]
async fn test_uninterception_propagates_error() {
	let mux = Mux::new();
	mux.get("/fail", Failing);

	let mut w = ResponseWriter::new();
	let mut r = request(Method::GET, "/fail");
	let err = mux.serve(&mut w, &mut r).await.unwrap_err();
	assert!(matches!(err, RouterError::Handler(_)));
}

#[tokio::test]
async fn test_pooled_context_does_not_leak_between_requests() {
	let mux = Mux::new();
	mux.get(
		"/users/{id}",
		context_handler_fn(|w, _r, ctx| {
			w.write(format!("{}", ctx.url_params.len()));
			Ok(())
		}),
	);
	mux.get(
		"/plain",
		context_handler_fn(|w, _r, ctx| {
			w.write(format!("{}", ctx.url_params.len()));
			Ok(())
		}),
	);

	let (_, body) = dispatch(&mux, Method::GET, "/users/42").await;
	assert_eq!(body, "1");

	// The pooled context from the first request must come back clean.
	let (_, body) = dispatch(&mux, Method::GET, "/plain").await;
	assert_eq!(body, "0");
}

struct Tag(&'static str);

#[async_trait]
impl ChainMiddleware for Tag {
	async fn run(&self, chain: &mut ChainRunner<'_>) -> RouterResult<()> {
		chain.writer().write(self.0);
		chain.next().await
	}
}

#[tokio::test]
async fn test_named_ordering_with_anonymous_trailing() {
	// auth constrained before log; anonymous metrics trails.
	let mux = Mux::new();
	mux.use_middleware(Middleware::named("log", Tag("log;")));
	mux.use_middleware(Middleware::named("auth", Tag("auth;")).before(["log"]));
	mux.use_middleware(Middleware::new(Tag("metrics;")));
	mux.get("/x", echo("end"));

	let (_, body) = dispatch(&mux, Method::GET, "/x").await;
	assert_eq!(body, "auth;log;metrics;end");
}

#[tokio::test]
async fn test_with_wraps_only_inline_registrations() {
	let mux = Mux::new();
	mux.get("/plain", echo("plain"));
	mux.with([Middleware::new(Tag("inline;"))])
		.get("/wrapped", echo("wrapped"));

	let (_, body) = dispatch(&mux, Method::GET, "/plain").await;
	assert_eq!(body, "plain");

	let (_, body) = dispatch(&mux, Method::GET, "/wrapped").await;
	assert_eq!(body, "inline;wrapped");
}

#[tokio::test]
async fn test_group_scopes_middlewares() {
	let mux = Mux::new();
	mux.group(|g| {
		g.use_middleware(Middleware::new(Tag("scoped;")));
		g.get("/in", echo("in"));
	});
	mux.get("/out", echo("out"));

	let (_, body) = dispatch(&mux, Method::GET, "/in").await;
	assert_eq!(body, "scoped;in");

	let (_, body) = dispatch(&mux, Method::GET, "/out").await;
	assert_eq!(body, "out");
}

#[tokio::test]
#[should_panic(expected = "before the mux serves requests")]
async fn test_middleware_registration_after_first_request_panics() {
	let mux = Mux::new();
	mux.get("/x", echo("x"));

	let _ = dispatch(&mux, Method::GET, "/x").await;
	mux.use_middleware(Middleware::new(Tag("late;")));
}

#[tokio::test]
async fn test_find_handler_resolves_without_dispatch() {
	let mux = Mux::new();
	mux.get("/users/{id}", echo("user"));

	assert!(mux.find_handler(&Method::GET, "/users/42", None).is_some());
	assert!(mux.find_handler(&Method::POST, "/users/42", None).is_none());
	assert!(mux.find_handler(&Method::GET, "/missing", None).is_none());
}

#[tokio::test]
async fn test_routes_enumeration_lists_registered_patterns() {
	let mux = Mux::new();
	mux.get("/a", echo("a"));
	mux.post("/b/{id}", echo("b"));

	let routes = mux.routes();
	let patterns: Vec<_> = routes.iter().map(|r| r.pattern.as_str()).collect();
	assert!(patterns.contains(&"/a"));
	assert!(patterns.contains(&"/b/{id}"));
}

#[tokio::test]
async fn test_caller_supplied_context_observes_route_state() {
	let mux = Mux::new();
	mux.get("/users/{id}", echo("u"));

	let mut w = ResponseWriter::new();
	let mut r = request(Method::GET, "/users/7");
	let mut ctx = RouteContext::new();
	mux.serve_with_context(&mut w, &mut r, &mut ctx).await.unwrap();

	assert_eq!(ctx.url_param("id"), Some("7"));
	assert_eq!(ctx.route_pattern(), "/users/{id}");
	assert!(ctx.routers().is_empty());
}

#[tokio::test]
async fn test_route_method_override_redirects_search() {
	let mux = Mux::new();
	mux.post("/only-post", echo("posted"));

	let mut w = ResponseWriter::new();
	let mut r = request(Method::GET, "/only-post");
	let mut ctx = RouteContext::new();
	ctx.route_method = Some(Method::POST);
	mux.serve_with_context(&mut w, &mut r, &mut ctx).await.unwrap();

	let (status, _, body) = w.into_parts();
	assert_eq!(status, StatusCode::OK);
	assert_eq!(&body[..], b"posted");
}

fn routing_hook<'a>(
	main: Arc<dyn ContextHandler>,
	w: &'a mut ResponseWriter,
	r: &'a mut Request,
	ctx: &'a mut RouteContext,
) -> futures::future::BoxFuture<'a, RouterResult<()>> {
	Box::pin(async move {
		w.write("hook(");
		main.serve(w, r, ctx).await?;
		w.write(")");
		Ok(())
	})
}

#[tokio::test]
async fn test_route_handler_hook_wraps_dispatch() {
	let mux = Mux::new();
	mux.set_route_handler(Arc::new(routing_hook));
	mux.get("/x", echo("x"));

	let (_, body) = dispatch(&mux, Method::GET, "/x").await;
	assert_eq!(body, "hook(x)");
}

#[tokio::test]
async fn test_arg_slot_round_trip() {
	let mux = Mux::new();
	assert!(!mux.is_arg_set());

	mux.set_arg("tenant-a".to_string());
	assert!(mux.is_arg_set());
	assert_eq!(mux.arg::<String>().unwrap().as_str(), "tenant-a");
	assert!(mux.arg::<u32>().is_none());

	mux.clear_arg();
	assert!(!mux.is_arg_set());
}

#[tokio::test]
async fn test_configured_api_extensions() {
	let mux = Mux::new();
	mux.set_api_extensions(vec!["xml".to_string()]);
	mux.api(|r| {
		r.get(
			"/feed",
			context_handler_fn(|w, _r, ctx| {
				w.write(ctx.api_ext.clone().unwrap_or_default());
				Ok(())
			}),
		);
	});

	let (_, body) = dispatch(&mux, Method::GET, "/feed.xml").await;
	assert_eq!(body, "xml");

	let (status, _) = dispatch(&mux, Method::GET, "/feed.json").await;
	assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_value_handler_consumes_prepared_value() {
	use nuages::value_handler_fn;

	struct Prepare;

	#[async_trait]
	impl ChainMiddleware for Prepare {
		async fn run(&self, chain: &mut ChainRunner<'_>) -> RouterResult<()> {
			chain.context().set_value("prepared".to_string());
			chain.next().await
		}
	}

	let seen = Arc::new(std::sync::Mutex::new(String::new()));
	let seen_clone = seen.clone();

	let mux = Mux::new();
	mux.use_middleware(Middleware::new(Prepare));
	mux.get(
		"/v",
		value_handler_fn(move |value| {
			if let Some(s) = value.and_then(|v| v.downcast_ref::<String>()) {
				*seen_clone.lock().unwrap() = s.clone();
			}
			Ok(())
		}),
	);

	let _ = dispatch(&mux, Method::GET, "/v").await;
	assert_eq!(seen.lock().unwrap().as_str(), "prepared");
}
