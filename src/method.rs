use hyper::Method;
use std::ops::{BitAnd, BitOr, BitOrAssign};

/// Bitmask over the HTTP methods a route responds to
///
/// Besides the nine real methods there are two pseudo-bits: [`ALL`]
/// (the union of every real method) and [`STUB`] (marks an endpoint as a
/// mount stub rather than a user route). Lookups use the single bit of
/// the request method and fall back to the `ALL` bucket.
///
/// [`ALL`]: MethodKind::ALL
/// [`STUB`]: MethodKind::STUB
///
/// # Examples
///
/// ```
/// use nuages::MethodKind;
/// use hyper::Method;
///
/// let mask = MethodKind::GET | MethodKind::POST;
/// assert!(mask.contains(MethodKind::GET));
/// assert!(!mask.contains(MethodKind::DELETE));
/// assert_eq!(MethodKind::from_method(&Method::GET), Some(MethodKind::GET));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodKind(u16);

impl MethodKind {
	pub const CONNECT: MethodKind = MethodKind(1 << 0);
	pub const DELETE: MethodKind = MethodKind(1 << 1);
	pub const GET: MethodKind = MethodKind(1 << 2);
	pub const HEAD: MethodKind = MethodKind(1 << 3);
	pub const OPTIONS: MethodKind = MethodKind(1 << 4);
	pub const PATCH: MethodKind = MethodKind(1 << 5);
	pub const POST: MethodKind = MethodKind(1 << 6);
	pub const PUT: MethodKind = MethodKind(1 << 7);
	pub const TRACE: MethodKind = MethodKind(1 << 8);

	/// Union of every real HTTP method.
	pub const ALL: MethodKind = MethodKind(0b1_1111_1111);

	/// Marks a mount stub endpoint.
	pub const STUB: MethodKind = MethodKind(1 << 9);

	/// The real method bits, in canonical order.
	pub const REAL: [MethodKind; 9] = [
		MethodKind::CONNECT,
		MethodKind::DELETE,
		MethodKind::GET,
		MethodKind::HEAD,
		MethodKind::OPTIONS,
		MethodKind::PATCH,
		MethodKind::POST,
		MethodKind::PUT,
		MethodKind::TRACE,
	];

	/// Map a wire method onto its routing bit. Extension methods have no
	/// bit and yield `None`.
	pub fn from_method(method: &Method) -> Option<MethodKind> {
		match method.as_str() {
			"CONNECT" => Some(MethodKind::CONNECT),
			"DELETE" => Some(MethodKind::DELETE),
			"GET" => Some(MethodKind::GET),
			"HEAD" => Some(MethodKind::HEAD),
			"OPTIONS" => Some(MethodKind::OPTIONS),
			"PATCH" => Some(MethodKind::PATCH),
			"POST" => Some(MethodKind::POST),
			"PUT" => Some(MethodKind::PUT),
			"TRACE" => Some(MethodKind::TRACE),
			_ => None,
		}
	}

	/// The wire method for a single real bit, if this mask is one.
	pub fn to_method(self) -> Option<Method> {
		match self {
			MethodKind::CONNECT => Some(Method::CONNECT),
			MethodKind::DELETE => Some(Method::DELETE),
			MethodKind::GET => Some(Method::GET),
			MethodKind::HEAD => Some(Method::HEAD),
			MethodKind::OPTIONS => Some(Method::OPTIONS),
			MethodKind::PATCH => Some(Method::PATCH),
			MethodKind::POST => Some(Method::POST),
			MethodKind::PUT => Some(Method::PUT),
			MethodKind::TRACE => Some(Method::TRACE),
			_ => None,
		}
	}

	pub fn bits(self) -> u16 {
		self.0
	}

	pub fn contains(self, other: MethodKind) -> bool {
		self.0 & other.0 == other.0
	}

	pub fn intersects(self, other: MethodKind) -> bool {
		self.0 & other.0 != 0
	}

	/// Whether the mask carries the mount-stub marker.
	pub fn is_stub(self) -> bool {
		self.contains(MethodKind::STUB)
	}

	/// Iterate the real method bits set in this mask.
	pub fn iter_real(self) -> impl Iterator<Item = MethodKind> {
		MethodKind::REAL.into_iter().filter(move |m| self.contains(*m))
	}
}

impl BitOr for MethodKind {
	type Output = MethodKind;

	fn bitor(self, rhs: MethodKind) -> MethodKind {
		MethodKind(self.0 | rhs.0)
	}
}

impl BitOrAssign for MethodKind {
	fn bitor_assign(&mut self, rhs: MethodKind) {
		self.0 |= rhs.0;
	}
}

impl BitAnd for MethodKind {
	type Output = MethodKind;

	fn bitand(self, rhs: MethodKind) -> MethodKind {
		MethodKind(self.0 & rhs.0)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_all_covers_every_real_method() {
		for m in MethodKind::REAL {
			assert!(MethodKind::ALL.contains(m));
		}
		assert!(!MethodKind::ALL.contains(MethodKind::STUB));
	}

	#[test]
	fn test_from_method_round_trip() {
		for m in MethodKind::REAL {
			let method = m.to_method().unwrap();
			assert_eq!(MethodKind::from_method(&method), Some(m));
		}
	}

	#[test]
	fn test_extension_methods_have_no_bit() {
		let custom = Method::from_bytes(b"PROPFIND").unwrap();
		assert_eq!(MethodKind::from_method(&custom), None);
	}

	#[test]
	fn test_iter_real_filters_mask() {
		let mask = MethodKind::GET | MethodKind::PUT | MethodKind::STUB;
		let bits: Vec<_> = mask.iter_real().collect();
		assert_eq!(bits, vec![MethodKind::GET, MethodKind::PUT]);
	}
}
