use thiserror::Error;

/// Error type for routing registration and dispatch failures
///
/// Registration-time violations (bad patterns, duplicate handlers,
/// unresolved middleware dependencies) are programmer errors: the public
/// registration methods on [`Mux`](crate::Mux) panic with the display
/// form of these variants. The fallible building blocks return them so
/// the conditions stay testable.
#[derive(Debug, Error)]
pub enum RouterError {
	/// A `(pattern, method, headers)` triple was registered twice without
	/// an overrides scope.
	#[error("duplicate handler for pattern '{pattern}'")]
	DuplicateHandler { pattern: String },

	/// Dispatch reached a router with no registered routes and no handler.
	#[error("attempting to route to a mux with no handlers")]
	NoHandlers,

	/// Syntactic or semantic pattern violation.
	#[error("invalid routing pattern '{pattern}': {message}")]
	BadPattern { pattern: String, message: String },

	/// A named middleware references a name that is not registered in its
	/// stack.
	#[error("{stack}: middleware dependency error: required by '{name}': {refs:?}")]
	MiddlewareDependencyMissing {
		stack: String,
		name: String,
		refs: Vec<String>,
	},

	/// The middleware ordering constraints could not be linearized.
	#[error("{stack}: topological middleware sort found a cycle")]
	MiddlewareCycle { stack: String },

	/// An anonymous middleware was added to a stack that only accepts
	/// named entries.
	#[error("{stack}: anonymous middleware is not accepted by this stack")]
	AnonymousMiddleware { stack: String },

	/// The HTTP method has no routing bit.
	#[error("http method '{0}' is not supported")]
	MethodNotSupported(String),

	/// A request could not be constructed.
	#[error("invalid request: {0}")]
	Request(String),

	/// A user handler failed (or panicked under error interception).
	#[error("handler failure: {0}")]
	Handler(String),
}

impl RouterError {
	/// Wrap an arbitrary handler failure message.
	pub fn handler(message: impl Into<String>) -> Self {
		RouterError::Handler(message.into())
	}

	pub(crate) fn bad_pattern(pattern: impl Into<String>, message: impl Into<String>) -> Self {
		RouterError::BadPattern {
			pattern: pattern.into(),
			message: message.into(),
		}
	}
}

/// Result type for routing operations
pub type RouterResult<T> = Result<T, RouterError>;
