use crate::context::RouteContext;
use crate::error::{RouterError, RouterResult};
use crate::handler::ContextHandler;
use crate::method::MethodKind;
use crate::mux::{MountHandler, Mux};
use hyper::HeaderMap;
use parking_lot::RwLock;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Segment kinds in matching precedence order: static edges win over
/// regex-constrained parameters, which win over plain parameters, which
/// win over the trailing wildcard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeKind {
	Static = 0,
	Regex = 1,
	Param = 2,
	Wildcard = 3,
}

/// Handler stored at a trie terminal. Mount wrappers keep their tag so
/// the dispatcher can hand them the residual path directly.
#[derive(Clone)]
pub(crate) enum StoredHandler {
	Endpoint(Arc<dyn ContextHandler>),
	Mount(Arc<MountHandler>),
}

/// One registered handler variant, optionally constrained by required
/// request headers.
#[derive(Clone)]
pub(crate) struct EndpointVariant {
	pub(crate) headers: Option<HeaderMap>,
	pub(crate) handler: StoredHandler,
}

/// Endpoint table entry for one method bucket of a terminal node.
#[derive(Clone)]
pub(crate) struct Endpoint {
	pub(crate) variants: Vec<EndpointVariant>,
	pub(crate) pattern: String,
	pub(crate) param_keys: Vec<String>,
	pub(crate) stub: bool,
}

impl Endpoint {
	/// Select the first variant whose header constraints the request
	/// satisfies. Unconstrained variants match anything.
	pub(crate) fn find_variant(&self, headers: &HeaderMap) -> Option<&StoredHandler> {
		for variant in &self.variants {
			match &variant.headers {
				None => return Some(&variant.handler),
				Some(required) => {
					let satisfied = required
						.iter()
						.all(|(name, value)| headers.get_all(name).iter().any(|v| v == value));
					if satisfied {
						return Some(&variant.handler);
					}
				}
			}
		}
		None
	}
}

/// Routing information for one registered pattern, used for traversal
/// and introspection.
#[derive(Clone)]
pub struct RouteDescriptor {
	pub pattern: String,
	pub methods: Vec<MethodKind>,
	pub subroutes: Option<Mux>,
}

/// A successful tree search.
pub(crate) struct RouteMatch {
	pub(crate) pattern: String,
	pub(crate) endpoint: Endpoint,
	pub(crate) subroutes: Option<Mux>,
}

struct Segment {
	kind: NodeKind,
	key: String,
	rex: String,
	tail: u8,
	start: usize,
	end: usize,
}

// Locate the next parametric or wildcard segment in `pattern`.
// `full` is the complete pattern, for error reporting.
fn pat_next_segment(pattern: &str, full: &str) -> RouterResult<Option<Segment>> {
	let brace = pattern.find('{');
	let star = pattern.find('*');
	if brace.is_none() && star.is_none() {
		return Ok(None);
	}

	if star.is_some_and(|s| brace.map_or(true, |b| s < b)) {
		let s = star.unwrap();
		if s != pattern.len() - 1 {
			return Err(RouterError::bad_pattern(
				full,
				"wildcard '*' must be the final segment",
			));
		}
		return Ok(Some(Segment {
			kind: NodeKind::Wildcard,
			key: "*".to_string(),
			rex: String::new(),
			tail: 0,
			start: s,
			end: pattern.len(),
		}));
	}

	let start = brace.unwrap();
	let bytes = pattern.as_bytes();
	let mut depth = 0usize;
	let mut close = None;
	for (i, &b) in bytes.iter().enumerate().skip(start) {
		match b {
			b'{' => depth += 1,
			b'}' => {
				depth -= 1;
				if depth == 0 {
					close = Some(i);
					break;
				}
			}
			_ => {}
		}
	}
	let Some(close) = close else {
		return Err(RouterError::bad_pattern(full, "unbalanced '{' in pattern"));
	};

	let inner = &pattern[start + 1..close];
	let (key, rex) = match inner.find(':') {
		Some(i) => (&inner[..i], &inner[i + 1..]),
		None => (inner, ""),
	};
	if key.is_empty() {
		return Err(RouterError::bad_pattern(full, "empty parameter name"));
	}

	let tail = if close + 1 < pattern.len() {
		bytes[close + 1]
	} else {
		b'/'
	};
	Ok(Some(Segment {
		kind: if rex.is_empty() {
			NodeKind::Param
		} else {
			NodeKind::Regex
		},
		key: key.to_string(),
		rex: rex.to_string(),
		tail,
		start,
		end: close + 1,
	}))
}

// The ordered parameter keys of a pattern; the wildcard contributes the
// literal "*".
fn pattern_param_keys(pattern: &str) -> RouterResult<Vec<String>> {
	let mut keys = Vec::new();
	let mut rest = pattern;
	while let Some(seg) = pat_next_segment(rest, pattern)? {
		keys.push(seg.key.clone());
		rest = &rest[seg.end..];
	}
	Ok(keys)
}

fn longest_common_prefix(a: &str, b: &str) -> usize {
	a.bytes().zip(b.bytes()).take_while(|(x, y)| x == y).count()
}

// Split a path at a parameter's terminator byte. The captured value must
// stay within one path segment.
fn split_at_tail(path: &str, tail: u8) -> Option<(&str, &str)> {
	match path.as_bytes().iter().position(|&b| b == tail) {
		Some(i) => Some((&path[..i], &path[i..])),
		None if tail == b'/' => Some((path, "")),
		None => None,
	}
}

fn headers_equal(a: &Option<HeaderMap>, b: &Option<HeaderMap>) -> bool {
	match (a, b) {
		(None, None) => true,
		(Some(a), Some(b)) => a == b,
		_ => false,
	}
}

struct Node {
	kind: NodeKind,
	label: u8,
	tail: u8,
	prefix: String,
	rex: Option<Regex>,
	endpoints: BTreeMap<u16, Endpoint>,
	subroutes: Option<Mux>,
	children: [Vec<Node>; 4],
}

impl Node {
	fn new_static(prefix: &str) -> Node {
		Node {
			kind: NodeKind::Static,
			label: prefix.as_bytes().first().copied().unwrap_or(0),
			tail: 0,
			prefix: prefix.to_string(),
			rex: None,
			endpoints: BTreeMap::new(),
			subroutes: None,
			children: Default::default(),
		}
	}

	// Walk or grow the trie along `search`, returning the terminal node
	// for the pattern. Splits compressed static edges as needed.
	fn insert(&mut self, search: &str, full: &str) -> RouterResult<&mut Node> {
		if search.is_empty() {
			return Ok(self);
		}

		let seg = pat_next_segment(search, full)?;

		if let Some(seg) = &seg {
			if seg.start == 0 {
				let idx = seg.kind as usize;
				let seg_source = &search[..seg.end];
				let existing = self.children[idx].iter().position(|c| match seg.kind {
					NodeKind::Wildcard => true,
					NodeKind::Param => c.tail == seg.tail,
					NodeKind::Regex => c.prefix == seg_source && c.tail == seg.tail,
					NodeKind::Static => false,
				});
				let pos = match existing {
					Some(pos) => pos,
					None => {
						let rex = if seg.kind == NodeKind::Regex {
							Some(Regex::new(&format!("^{}$", seg.rex)).map_err(|e| {
								RouterError::bad_pattern(
									full,
									format!("invalid parameter regex: {e}"),
								)
							})?)
						} else {
							None
						};
						self.children[idx].push(Node {
							kind: seg.kind,
							label: search.as_bytes()[0],
							tail: seg.tail,
							prefix: seg_source.to_string(),
							rex,
							endpoints: BTreeMap::new(),
							subroutes: None,
							children: Default::default(),
						});
						self.children[idx].len() - 1
					}
				};
				return self.children[idx][pos].insert(&search[seg.end..], full);
			}
		}

		let static_end = seg.as_ref().map_or(search.len(), |s| s.start);
		let head = &search[..static_end];
		let label = head.as_bytes()[0];

		let pos = self.children[NodeKind::Static as usize]
			.iter()
			.position(|c| c.label == label);
		let Some(pos) = pos else {
			self.children[0].push(Node::new_static(head));
			let pos = self.children[0].len() - 1;
			return self.children[0][pos].insert(&search[head.len()..], full);
		};

		let common = longest_common_prefix(head, &self.children[0][pos].prefix);
		if common == self.children[0][pos].prefix.len() {
			return self.children[0][pos].insert(&search[common..], full);
		}

		// Split the compressed edge at the divergence point.
		let mut old = self.children[0].remove(pos);
		let mut split = Node::new_static(&old.prefix[..common]);
		old.prefix = old.prefix[common..].to_string();
		old.label = old.prefix.as_bytes()[0];
		split.children[0].push(old);
		self.children[0].push(split);
		let pos = self.children[0].len() - 1;
		self.children[0][pos].insert(&search[common..], full)
	}

	fn set_endpoint(
		&mut self,
		overrides: bool,
		mask: MethodKind,
		pattern: &str,
		handler: StoredHandler,
		headers: Option<HeaderMap>,
		subroutes: Option<Mux>,
	) -> RouterResult<()> {
		let param_keys = pattern_param_keys(pattern)?;
		let stub = mask.is_stub();

		let buckets: Vec<u16> = if mask.contains(MethodKind::ALL) {
			vec![MethodKind::ALL.bits()]
		} else {
			mask.iter_real().map(|m| m.bits()).collect()
		};
		if buckets.is_empty() {
			return Err(RouterError::bad_pattern(pattern, "mask has no method bits"));
		}

		for bucket in buckets {
			let endpoint = self.endpoints.entry(bucket).or_insert_with(|| Endpoint {
				variants: Vec::new(),
				pattern: pattern.to_string(),
				param_keys: param_keys.clone(),
				stub,
			});
			match endpoint
				.variants
				.iter_mut()
				.find(|v| headers_equal(&v.headers, &headers))
			{
				Some(existing) => {
					if !overrides {
						return Err(RouterError::DuplicateHandler {
							pattern: pattern.to_string(),
						});
					}
					existing.handler = handler.clone();
				}
				None => endpoint.variants.push(EndpointVariant {
					headers: headers.clone(),
					handler: handler.clone(),
				}),
			}
		}

		if subroutes.is_some() {
			self.subroutes = subroutes;
		}
		Ok(())
	}

	fn find(&self, ctx: &mut RouteContext, bit: u16, path: &str) -> Option<RouteMatch> {
		if path.is_empty() {
			if let Some(m) = self.endpoint_match(ctx, bit) {
				return Some(m);
			}
			// A trailing wildcard may capture the empty remainder.
			if let Some(child) = self.children[NodeKind::Wildcard as usize].first() {
				ctx.route_params.values.push(String::new());
				if let Some(m) = child.endpoint_match(ctx, bit) {
					return Some(m);
				}
				ctx.route_params.values.pop();
			}
			return None;
		}

		let label = path.as_bytes()[0];
		if let Some(child) = self.children[NodeKind::Static as usize]
			.iter()
			.find(|c| c.label == label)
		{
			if path.as_bytes().starts_with(child.prefix.as_bytes()) {
				if let Some(m) = child.find(ctx, bit, &path[child.prefix.len()..]) {
					return Some(m);
				}
			}
		}

		for child in self.children[NodeKind::Regex as usize]
			.iter()
			.chain(self.children[NodeKind::Param as usize].iter())
		{
			let Some((value, rest)) = split_at_tail(path, child.tail) else {
				continue;
			};
			if value.is_empty() || value.as_bytes().contains(&b'/') {
				continue;
			}
			if child.kind == NodeKind::Regex {
				let constrained = child.rex.as_ref().is_some_and(|rex| rex.is_match(value));
				if !constrained {
					continue;
				}
			}
			ctx.route_params.values.push(value.to_string());
			if let Some(m) = child.find(ctx, bit, rest) {
				return Some(m);
			}
			ctx.route_params.values.pop();
		}

		if let Some(child) = self.children[NodeKind::Wildcard as usize].first() {
			ctx.route_params.values.push(path.to_string());
			if let Some(m) = child.endpoint_match(ctx, bit) {
				return Some(m);
			}
			ctx.route_params.values.pop();
		}

		None
	}

	// Terminal check: resolve the method bucket, falling back to ALL.
	// A path hit without a method bucket leaves the sticky hint.
	fn endpoint_match(&self, ctx: &mut RouteContext, bit: u16) -> Option<RouteMatch> {
		if self.endpoints.is_empty() {
			return None;
		}
		let endpoint = self
			.endpoints
			.get(&bit)
			.or_else(|| self.endpoints.get(&MethodKind::ALL.bits()));
		let Some(endpoint) = endpoint else {
			ctx.method_not_allowed = true;
			return None;
		};

		ctx.route_pattern = endpoint.pattern.clone();
		ctx.route_patterns.push(endpoint.pattern.clone());
		ctx.route_params
			.keys
			.extend(endpoint.param_keys.iter().cloned());

		let pairs: Vec<(String, String)> = ctx
			.route_params
			.keys
			.iter()
			.cloned()
			.zip(ctx.route_params.values.iter().cloned())
			.collect();
		for (key, value) in pairs {
			ctx.url_params.add(key, value);
		}

		Some(RouteMatch {
			pattern: endpoint.pattern.clone(),
			endpoint: endpoint.clone(),
			subroutes: self.subroutes.clone(),
		})
	}

	// Structural existence check: does this exact pattern text lead to a
	// registered node?
	fn find_pattern(&self, pattern: &str) -> bool {
		if pattern.is_empty() {
			return !self.endpoints.is_empty() || self.subroutes.is_some();
		}
		let seg = match pat_next_segment(pattern, pattern) {
			Ok(seg) => seg,
			Err(_) => return false,
		};

		if let Some(seg) = &seg {
			if seg.start == 0 {
				let idx = seg.kind as usize;
				let seg_source = &pattern[..seg.end];
				return self.children[idx].iter().any(|child| {
					let matches = match seg.kind {
						NodeKind::Wildcard => true,
						NodeKind::Param => child.tail == seg.tail,
						NodeKind::Regex => child.prefix == seg_source && child.tail == seg.tail,
						NodeKind::Static => false,
					};
					matches && child.find_pattern(&pattern[seg.end..])
				});
			}
		}

		let static_end = seg.as_ref().map_or(pattern.len(), |s| s.start);
		let head = &pattern[..static_end];
		let label = head.as_bytes()[0];
		let Some(child) = self.children[NodeKind::Static as usize]
			.iter()
			.find(|c| c.label == label)
		else {
			return false;
		};
		let common = longest_common_prefix(head, &child.prefix);
		if common == child.prefix.len() {
			child.find_pattern(&pattern[common..])
		} else {
			false
		}
	}

	fn collect_routes(&self, out: &mut Vec<RouteDescriptor>) {
		if !self.endpoints.is_empty() {
			let mut grouped: Vec<(String, Vec<MethodKind>, bool)> = Vec::new();
			for (bucket, endpoint) in &self.endpoints {
				let kind = MethodKind::REAL
					.into_iter()
					.find(|m| m.bits() == *bucket)
					.unwrap_or(MethodKind::ALL);
				match grouped.iter_mut().find(|(p, _, _)| p == &endpoint.pattern) {
					Some((_, methods, non_stub)) => {
						methods.push(kind);
						*non_stub |= !endpoint.stub;
					}
					None => grouped.push((endpoint.pattern.clone(), vec![kind], !endpoint.stub)),
				}
			}
			for (pattern, methods, non_stub) in grouped {
				if let Some(sub) = &self.subroutes {
					out.push(RouteDescriptor {
						pattern: pattern.trim_end_matches("/*").to_string(),
						methods,
						subroutes: Some(sub.clone()),
					});
				} else if non_stub {
					out.push(RouteDescriptor {
						pattern,
						methods,
						subroutes: None,
					});
				}
			}
		}
		for kids in &self.children {
			for child in kids {
				child.collect_routes(out);
			}
		}
	}
}

/// Radix trie of routing patterns keyed jointly by method bucket and
/// path, read-only under concurrent dispatch.
pub(crate) struct PatternTree {
	root: RwLock<Node>,
}

impl PatternTree {
	pub(crate) fn new() -> Self {
		Self {
			root: RwLock::new(Node::new_static("")),
		}
	}

	pub(crate) fn insert(
		&self,
		overrides: bool,
		mask: MethodKind,
		pattern: &str,
		handler: StoredHandler,
		headers: Option<HeaderMap>,
		subroutes: Option<Mux>,
	) -> RouterResult<()> {
		if !pattern.starts_with('/') {
			return Err(RouterError::bad_pattern(
				pattern,
				"routing pattern must begin with '/'",
			));
		}
		let mut root = self.root.write();
		let node = root.insert(pattern, pattern)?;
		node.set_endpoint(overrides, mask, pattern, handler, headers, subroutes)
	}

	/// Search the trie for `path` under a single method bit. Captures go
	/// into the context; on a path hit without the method, the context's
	/// sticky hint is set.
	pub(crate) fn find(
		&self,
		ctx: &mut RouteContext,
		method: MethodKind,
		path: &str,
	) -> Option<RouteMatch> {
		ctx.route_params.clear();
		self.root.read().find(ctx, method.bits(), path)
	}

	pub(crate) fn find_pattern(&self, pattern: &str) -> bool {
		self.root.read().find_pattern(pattern)
	}

	pub(crate) fn routes(&self) -> Vec<RouteDescriptor> {
		let mut out = Vec::new();
		self.root.read().collect_routes(&mut out);
		out
	}
}
