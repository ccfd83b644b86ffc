use crate::chain::ChainRunner;
use crate::error::{RouterError, RouterResult};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;

/// Middleware capability invoked with the chain runner
///
/// A middleware decides whether and how to continue the chain: call
/// [`ChainRunner::next`] to run the rest of the sequence, mutate the
/// writer/request/context in place, or return early to short-circuit.
#[async_trait]
pub trait ChainMiddleware: Send + Sync {
	async fn run(&self, chain: &mut ChainRunner<'_>) -> RouterResult<()>;
}

struct FnChainMiddleware<F>(F);

#[async_trait]
impl<F> ChainMiddleware for FnChainMiddleware<F>
where
	F: for<'a, 'b> Fn(&'a mut ChainRunner<'b>) -> BoxFuture<'a, RouterResult<()>> + Send + Sync,
{
	async fn run(&self, chain: &mut ChainRunner<'_>) -> RouterResult<()> {
		(self.0)(chain).await
	}
}

/// Wrap a boxed-future closure as an anonymous [`Middleware`].
///
/// # Examples
///
/// ```
/// use nuages::{middleware_fn, ChainRunner};
///
/// let logger = middleware_fn(|chain: &mut ChainRunner<'_>| {
///     Box::pin(async move {
///         chain.next().await?;
///         Ok(())
///     })
/// });
/// assert!(logger.name().is_empty());
/// ```
pub fn middleware_fn<F>(f: F) -> Middleware
where
	F: for<'a, 'b> Fn(&'a mut ChainRunner<'b>) -> BoxFuture<'a, RouterResult<()>>
		+ Send
		+ Sync
		+ 'static,
{
	Middleware::new(FnChainMiddleware(f))
}

/// A middleware with an optional name and ordering constraints
///
/// `before` and `after` reference other *named* middlewares in the same
/// stack: `before = ["x"]` forces this middleware ahead of `x` in the
/// materialized sequence. References to unregistered names fail the
/// stack build.
#[derive(Clone)]
pub struct Middleware {
	name: String,
	handler: Arc<dyn ChainMiddleware>,
	before: Vec<String>,
	after: Vec<String>,
}

impl Middleware {
	/// An anonymous middleware. Anonymous entries keep insertion order
	/// and always run after the named ones.
	pub fn new(handler: impl ChainMiddleware + 'static) -> Self {
		Self {
			name: String::new(),
			handler: Arc::new(handler),
			before: Vec::new(),
			after: Vec::new(),
		}
	}

	/// A named middleware that can participate in ordering constraints.
	pub fn named(name: impl Into<String>, handler: impl ChainMiddleware + 'static) -> Self {
		Self {
			name: name.into(),
			handler: Arc::new(handler),
			before: Vec::new(),
			after: Vec::new(),
		}
	}

	/// Constrain this middleware to run before the given names.
	pub fn before<I, S>(mut self, names: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.before.extend(names.into_iter().map(Into::into));
		self
	}

	/// Constrain this middleware to run after the given names.
	pub fn after<I, S>(mut self, names: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.after.extend(names.into_iter().map(Into::into));
		self
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn is_anonymous(&self) -> bool {
		self.name.is_empty()
	}

	pub fn handler(&self) -> &Arc<dyn ChainMiddleware> {
		&self.handler
	}

	pub fn before_names(&self) -> &[String] {
		&self.before
	}

	pub fn after_names(&self) -> &[String] {
		&self.after
	}
}

/// Behaviour when a named middleware collides with an existing entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicationPolicy {
	/// Replace the existing entry.
	Override,
	/// Fail the registration.
	Abort,
	/// Keep the existing entry and drop the new one.
	Skip,
}

/// An ordered collection of middlewares with topological build
///
/// Named middlewares are toposorted by their `before`/`after` constraints;
/// anonymous middlewares (only accepted by stacks created with
/// `accept_anonymous`) trail in insertion order. [`build`] materializes
/// the sequence and is idempotent until the stack changes.
///
/// [`build`]: MiddlewareStack::build
pub struct MiddlewareStack {
	name: String,
	by_name: HashMap<String, Arc<Middleware>>,
	order: Vec<String>,
	anonymous: Vec<Arc<Middleware>>,
	items: Vec<Arc<Middleware>>,
	accept_anonymous: bool,
	built: bool,
}

impl MiddlewareStack {
	pub fn new(name: impl Into<String>, accept_anonymous: bool) -> Self {
		Self {
			name: name.into(),
			by_name: HashMap::new(),
			order: Vec::new(),
			anonymous: Vec::new(),
			items: Vec::new(),
			accept_anonymous,
			built: false,
		}
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	/// Logical number of entries, whether or not the stack is built.
	pub fn len(&self) -> usize {
		self.order.len() + self.anonymous.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Whether every given name is registered.
	pub fn has<I, S>(&self, names: I) -> bool
	where
		I: IntoIterator<Item = S>,
		S: AsRef<str>,
	{
		names
			.into_iter()
			.all(|n| self.by_name.contains_key(n.as_ref()))
	}

	pub fn get(&self, name: &str) -> Option<Arc<Middleware>> {
		self.by_name.get(name).cloned()
	}

	/// Add middlewares under the given duplication policy.
	pub fn add<I>(&mut self, items: I, policy: DuplicationPolicy) -> RouterResult<()>
	where
		I: IntoIterator<Item = Middleware>,
	{
		self.add_shared(items.into_iter().map(Arc::new).collect(), policy)
	}

	pub(crate) fn add_shared(
		&mut self,
		items: Vec<Arc<Middleware>>,
		policy: DuplicationPolicy,
	) -> RouterResult<()> {
		for md in items {
			if md.is_anonymous() {
				if !self.accept_anonymous {
					return Err(RouterError::AnonymousMiddleware {
						stack: self.name.clone(),
					});
				}
				self.anonymous.push(md);
				self.built = false;
				continue;
			}
			if self.by_name.contains_key(md.name()) {
				match policy {
					DuplicationPolicy::Abort => {
						return Err(RouterError::DuplicateHandler {
							pattern: format!("{}: middleware '{}'", self.name, md.name()),
						});
					}
					DuplicationPolicy::Skip => continue,
					DuplicationPolicy::Override => {
						self.by_name.insert(md.name().to_string(), md);
						self.built = false;
						continue;
					}
				}
			}
			self.order.push(md.name().to_string());
			self.by_name.insert(md.name().to_string(), md);
			self.built = false;
		}
		Ok(())
	}

	/// Materialize the ordered sequence: toposorted named middlewares
	/// followed by the anonymous ones.
	pub fn build(&mut self) -> RouterResult<()> {
		if self.built && self.items.len() == self.len() {
			return Ok(());
		}

		let sorted = self.toposort()?;

		self.items = Vec::with_capacity(self.len());
		for name in sorted {
			self.items.push(self.by_name[&name].clone());
		}
		self.items.extend(self.anonymous.iter().cloned());
		self.built = true;
		Ok(())
	}

	/// The materialized sequence. Empty until [`build`] runs.
	///
	/// [`build`]: MiddlewareStack::build
	pub fn items(&self) -> &[Arc<Middleware>] {
		&self.items
	}

	/// Every entry regardless of build state: named in insertion order,
	/// then anonymous.
	pub fn all(&self) -> Vec<Arc<Middleware>> {
		if self.built {
			return self.items.clone();
		}
		let mut all: Vec<_> = self
			.order
			.iter()
			.map(|name| self.by_name[name].clone())
			.collect();
		all.extend(self.anonymous.iter().cloned());
		all
	}

	/// Deep copy for inline and sub-router composition. Entries are
	/// shared, the collections are not.
	pub fn copy(&self) -> MiddlewareStack {
		MiddlewareStack {
			name: self.name.clone(),
			by_name: self.by_name.clone(),
			order: self.order.clone(),
			anonymous: self.anonymous.clone(),
			items: self.items.clone(),
			accept_anonymous: self.accept_anonymous,
			built: self.built,
		}
	}

	// Depth-first reverse-postorder over the constraint graph. Nodes are
	// visited in insertion order so unconstrained middlewares keep their
	// registration order.
	fn toposort(&self) -> RouterResult<Vec<String>> {
		let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();
		for name in &self.order {
			edges.entry(name).or_default();
		}
		for name in &self.order {
			let md = &self.by_name[name];
			let mut missing: Vec<String> = Vec::new();
			for to in md.before_names() {
				if self.by_name.contains_key(to) {
					edges.entry(name.as_str()).or_default().push(to.as_str());
				} else {
					missing.push(to.clone());
				}
			}
			for from in md.after_names() {
				if self.by_name.contains_key(from) {
					edges.entry(from.as_str()).or_default().push(name.as_str());
				} else {
					missing.push(from.clone());
				}
			}
			if !missing.is_empty() {
				return Err(RouterError::MiddlewareDependencyMissing {
					stack: self.name.clone(),
					name: name.clone(),
					refs: missing,
				});
			}
		}

		const UNSEEN: u8 = 0;
		const ACTIVE: u8 = 1;
		const DONE: u8 = 2;

		let mut state: HashMap<&str, u8> = HashMap::new();
		let mut post: Vec<String> = Vec::with_capacity(self.order.len());

		fn visit<'a>(
			node: &'a str,
			edges: &HashMap<&'a str, Vec<&'a str>>,
			state: &mut HashMap<&'a str, u8>,
			post: &mut Vec<String>,
		) -> bool {
			match state.get(node).copied().unwrap_or(UNSEEN) {
				DONE => return true,
				ACTIVE => return false,
				_ => {}
			}
			state.insert(node, ACTIVE);
			if let Some(next) = edges.get(node) {
				for &n in next {
					if !visit(n, edges, state, post) {
						return false;
					}
				}
			}
			state.insert(node, DONE);
			post.push(node.to_string());
			true
		}

		// Roots are taken in reverse insertion order so that the reversed
		// postorder keeps unconstrained middlewares in registration order.
		for name in self.order.iter().rev() {
			if !visit(name, &edges, &mut state, &mut post) {
				return Err(RouterError::MiddlewareCycle {
					stack: self.name.clone(),
				});
			}
		}

		post.reverse();
		Ok(post)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::chain::ChainRunner;

	struct Noop;

	#[async_trait]
	impl ChainMiddleware for Noop {
		async fn run(&self, chain: &mut ChainRunner<'_>) -> RouterResult<()> {
			chain.next().await
		}
	}

	fn names(stack: &MiddlewareStack) -> Vec<&str> {
		stack.items().iter().map(|m| m.name()).collect()
	}

	#[test]
	fn test_build_orders_by_constraints() {
		let mut stack = MiddlewareStack::new("Middlewares", true);
		stack
			.add(
				[
					Middleware::named("auth", Noop).before(["log"]),
					Middleware::named("log", Noop),
					Middleware::new(Noop),
				],
				DuplicationPolicy::Abort,
			)
			.unwrap();
		stack.build().unwrap();

		assert_eq!(names(&stack), vec!["auth", "log", ""]);
	}

	#[test]
	fn test_after_constraint() {
		let mut stack = MiddlewareStack::new("Middlewares", false);
		stack
			.add(
				[
					Middleware::named("metrics", Noop).after(["auth"]),
					Middleware::named("auth", Noop),
				],
				DuplicationPolicy::Abort,
			)
			.unwrap();
		stack.build().unwrap();

		assert_eq!(names(&stack), vec!["auth", "metrics"]);
	}

	#[test]
	fn test_unconstrained_keep_registration_order() {
		let mut stack = MiddlewareStack::new("Middlewares", false);
		stack
			.add(
				[
					Middleware::named("a", Noop),
					Middleware::named("b", Noop),
					Middleware::named("c", Noop),
				],
				DuplicationPolicy::Abort,
			)
			.unwrap();
		stack.build().unwrap();

		assert_eq!(names(&stack), vec!["a", "b", "c"]);
	}

	#[test]
	fn test_build_is_idempotent() {
		let mut stack = MiddlewareStack::new("Middlewares", true);
		stack
			.add(
				[
					Middleware::named("auth", Noop).before(["log"]),
					Middleware::named("log", Noop),
					Middleware::new(Noop),
				],
				DuplicationPolicy::Abort,
			)
			.unwrap();
		stack.build().unwrap();
		let first: Vec<String> = names(&stack).iter().map(|s| s.to_string()).collect();

		stack.build().unwrap();
		let second: Vec<String> = names(&stack).iter().map(|s| s.to_string()).collect();

		assert_eq!(first, second);
	}

	#[test]
	fn test_missing_dependency_is_fatal() {
		let mut stack = MiddlewareStack::new("Interceptors", false);
		stack
			.add(
				[Middleware::named("auth", Noop).before(["ghost"])],
				DuplicationPolicy::Abort,
			)
			.unwrap();

		let err = stack.build().unwrap_err();
		match err {
			RouterError::MiddlewareDependencyMissing { name, refs, .. } => {
				assert_eq!(name, "auth");
				assert_eq!(refs, vec!["ghost".to_string()]);
			}
			other => panic!("unexpected error: {other}"),
		}
	}

	#[test]
	fn test_cycle_is_fatal() {
		let mut stack = MiddlewareStack::new("Middlewares", false);
		stack
			.add(
				[
					Middleware::named("a", Noop).before(["b"]),
					Middleware::named("b", Noop).before(["a"]),
				],
				DuplicationPolicy::Abort,
			)
			.unwrap();

		assert!(matches!(
			stack.build(),
			Err(RouterError::MiddlewareCycle { .. })
		));
	}

	#[test]
	fn test_duplication_abort() {
		let mut stack = MiddlewareStack::new("Middlewares", false);
		stack
			.add([Middleware::named("auth", Noop)], DuplicationPolicy::Abort)
			.unwrap();

		let err = stack
			.add([Middleware::named("auth", Noop)], DuplicationPolicy::Abort)
			.unwrap_err();
		assert!(matches!(err, RouterError::DuplicateHandler { .. }));
	}

	#[test]
	fn test_duplication_skip_keeps_existing() {
		let mut stack = MiddlewareStack::new("Middlewares", false);
		let original = Middleware::named("auth", Noop).before(["log"]);
		stack.add([original], DuplicationPolicy::Abort).unwrap();
		stack
			.add([Middleware::named("auth", Noop)], DuplicationPolicy::Skip)
			.unwrap();

		assert_eq!(stack.len(), 1);
		assert_eq!(stack.get("auth").unwrap().before_names(), ["log"]);
	}

	#[test]
	fn test_duplication_override_replaces() {
		let mut stack = MiddlewareStack::new("Middlewares", false);
		stack
			.add(
				[Middleware::named("auth", Noop).before(["log"])],
				DuplicationPolicy::Abort,
			)
			.unwrap();
		stack
			.add([Middleware::named("auth", Noop)], DuplicationPolicy::Override)
			.unwrap();

		assert_eq!(stack.len(), 1);
		assert!(stack.get("auth").unwrap().before_names().is_empty());
	}

	#[test]
	fn test_anonymous_rejected_when_not_accepted() {
		let mut stack = MiddlewareStack::new("Interceptors", false);
		let err = stack
			.add([Middleware::new(Noop)], DuplicationPolicy::Abort)
			.unwrap_err();
		assert!(matches!(err, RouterError::AnonymousMiddleware { .. }));
	}

	#[test]
	fn test_copy_is_independent() {
		let mut stack = MiddlewareStack::new("Middlewares", true);
		stack
			.add([Middleware::named("auth", Noop)], DuplicationPolicy::Abort)
			.unwrap();

		let mut copied = stack.copy();
		copied
			.add([Middleware::named("extra", Noop)], DuplicationPolicy::Abort)
			.unwrap();

		assert!(copied.has(["auth", "extra"]));
		assert!(!stack.has(["extra"]));
	}
}
