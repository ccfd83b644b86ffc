use bytes::{Bytes, BytesMut};
use hyper::{HeaderMap, StatusCode};

/// Response writer with an observable status code
///
/// Handlers and middlewares write the response through this wrapper; the
/// dispatcher and the logging/error layers read the status back after the
/// fact. `write_header` is first-write-wins, mirroring how an HTTP
/// transport commits a status line exactly once.
///
/// # Examples
///
/// ```
/// use nuages::ResponseWriter;
/// use hyper::StatusCode;
///
/// let mut w = ResponseWriter::new();
/// w.write_header(StatusCode::CREATED);
/// w.write_header(StatusCode::NOT_FOUND); // ignored, already committed
/// w.write("created");
///
/// assert_eq!(w.status(), StatusCode::CREATED);
/// assert_eq!(w.body(), b"created");
/// ```
pub struct ResponseWriter {
	status: StatusCode,
	headers: HeaderMap,
	body: BytesMut,
	wrote_header: bool,
}

impl ResponseWriter {
	pub fn new() -> Self {
		Self {
			status: StatusCode::OK,
			headers: HeaderMap::new(),
			body: BytesMut::new(),
			wrote_header: false,
		}
	}

	/// The status observed so far. Defaults to 200 until a handler
	/// commits something else.
	pub fn status(&self) -> StatusCode {
		self.status
	}

	/// Commit the status line. The first call wins; later calls are
	/// ignored.
	pub fn write_header(&mut self, status: StatusCode) {
		if !self.wrote_header {
			self.status = status;
			self.wrote_header = true;
		}
	}

	/// Whether a status line has been committed.
	pub fn header_written(&self) -> bool {
		self.wrote_header
	}

	/// Overwrite the status even after it was committed. Reserved for the
	/// error-interception path, which must turn a half-written response
	/// into a 500.
	pub fn set_status(&mut self, status: StatusCode) {
		self.status = status;
		self.wrote_header = true;
	}

	/// Append body bytes, committing a 200 status if none was written.
	pub fn write(&mut self, data: impl AsRef<[u8]>) {
		if !self.wrote_header {
			self.write_header(StatusCode::OK);
		}
		self.body.extend_from_slice(data.as_ref());
	}

	pub fn headers(&self) -> &HeaderMap {
		&self.headers
	}

	pub fn headers_mut(&mut self) -> &mut HeaderMap {
		&mut self.headers
	}

	pub fn body(&self) -> &[u8] {
		&self.body
	}

	/// Consume the writer into transport-ready parts.
	pub fn into_parts(self) -> (StatusCode, HeaderMap, Bytes) {
		(self.status, self.headers, self.body.freeze())
	}
}

impl Default for ResponseWriter {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_default_status_is_ok() {
		let w = ResponseWriter::new();
		assert_eq!(w.status(), StatusCode::OK);
		assert!(!w.header_written());
	}

	#[test]
	fn test_first_write_header_wins() {
		let mut w = ResponseWriter::new();
		w.write_header(StatusCode::NOT_FOUND);
		w.write_header(StatusCode::OK);
		assert_eq!(w.status(), StatusCode::NOT_FOUND);
	}

	#[test]
	fn test_write_commits_ok() {
		let mut w = ResponseWriter::new();
		w.write("body");
		assert!(w.header_written());
		assert_eq!(w.status(), StatusCode::OK);
	}

	#[test]
	fn test_set_status_overrides_committed_header() {
		let mut w = ResponseWriter::new();
		w.write("partial");
		w.set_status(StatusCode::INTERNAL_SERVER_ERROR);
		assert_eq!(w.status(), StatusCode::INTERNAL_SERVER_ERROR);
	}

	#[test]
	fn test_into_parts() {
		let mut w = ResponseWriter::new();
		w.write_header(StatusCode::CREATED);
		w.write("a");
		w.write("b");
		let (status, _, body) = w.into_parts();
		assert_eq!(status, StatusCode::CREATED);
		assert_eq!(&body[..], b"ab");
	}
}
