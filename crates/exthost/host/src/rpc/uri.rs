//! URI rewriting on the RPC boundary.
//!
//! URIs cross the channel as marked JSON objects carrying their components.
//! A registered [`UriTransformer`] may rewrite components on ingress and
//! egress, e.g. to map remote schemes onto local ones.

use serde_json::{Map, Value};

/// Marker key identifying a serialized URI object.
pub const URI_MARKER_KEY: &str = "$mid";

/// Marker value identifying a serialized URI object.
pub const URI_MARKER_VALUE: u64 = 1;

/// Components of a URI as they appear on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UriParts {
	/// URI scheme, e.g. `file`.
	pub scheme: String,
	/// Authority, possibly empty.
	pub authority: String,
	/// Path component.
	pub path: String,
	/// Query component, possibly empty.
	pub query: String,
	/// Fragment component, possibly empty.
	pub fragment: String,
}

impl UriParts {
	/// Parse a URI string into its components.
	///
	/// # Errors
	///
	/// Returns the underlying parse error for syntactically invalid URIs.
	pub fn parse(uri: &str) -> Result<Self, url::ParseError> {
		let parsed = url::Url::parse(uri)?;
		Ok(Self {
			scheme: parsed.scheme().to_string(),
			authority: parsed.authority().to_string(),
			path: parsed.path().to_string(),
			query: parsed.query().unwrap_or_default().to_string(),
			fragment: parsed.fragment().unwrap_or_default().to_string(),
		})
	}
}

impl std::fmt::Display for UriParts {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}://{}{}", self.scheme, self.authority, self.path)?;
		if !self.query.is_empty() {
			write!(f, "?{}", self.query)?;
		}
		if !self.fragment.is_empty() {
			write!(f, "#{}", self.fragment)?;
		}
		Ok(())
	}
}

/// Rewrites URI components crossing the channel.
pub trait UriTransformer: Send + Sync + 'static {
	/// Rewrite a URI arriving from the guest.
	fn transform_incoming(&self, parts: &mut UriParts);
	/// Rewrite a URI leaving for the guest.
	fn transform_outgoing(&self, parts: &mut UriParts);
}

/// Apply `transform_incoming` to every marked URI object inside `value`.
pub fn transform_incoming_json(transformer: &dyn UriTransformer, value: &mut Value) {
	walk(value, &mut |parts| transformer.transform_incoming(parts));
}

/// Apply `transform_outgoing` to every marked URI object inside `value`.
pub fn transform_outgoing_json(transformer: &dyn UriTransformer, value: &mut Value) {
	walk(value, &mut |parts| transformer.transform_outgoing(parts));
}

fn walk(value: &mut Value, apply: &mut dyn FnMut(&mut UriParts)) {
	match value {
		Value::Array(items) => {
			for item in items {
				walk(item, apply);
			}
		}
		Value::Object(object) => {
			if is_uri_object(object) {
				let mut parts = read_parts(object);
				apply(&mut parts);
				write_parts(object, &parts);
				return;
			}
			for item in object.values_mut() {
				walk(item, apply);
			}
		}
		_ => {}
	}
}

fn is_uri_object(object: &Map<String, Value>) -> bool {
	object
		.get(URI_MARKER_KEY)
		.and_then(Value::as_u64)
		.is_some_and(|mid| mid == URI_MARKER_VALUE)
}

fn read_parts(object: &Map<String, Value>) -> UriParts {
	let field = |key: &str| {
		object
			.get(key)
			.and_then(Value::as_str)
			.unwrap_or_default()
			.to_string()
	};
	UriParts {
		scheme: field("scheme"),
		authority: field("authority"),
		path: field("path"),
		query: field("query"),
		fragment: field("fragment"),
	}
}

fn write_parts(object: &mut Map<String, Value>, parts: &UriParts) {
	object.insert("scheme".to_string(), Value::String(parts.scheme.clone()));
	object.insert(
		"authority".to_string(),
		Value::String(parts.authority.clone()),
	);
	object.insert("path".to_string(), Value::String(parts.path.clone()));
	object.insert("query".to_string(), Value::String(parts.query.clone()));
	object.insert(
		"fragment".to_string(),
		Value::String(parts.fragment.clone()),
	);
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	struct SchemeSwap;

	impl UriTransformer for SchemeSwap {
		fn transform_incoming(&self, parts: &mut UriParts) {
			if parts.scheme == "vesper-remote" {
				parts.scheme = "file".to_string();
			}
		}

		fn transform_outgoing(&self, parts: &mut UriParts) {
			if parts.scheme == "file" {
				parts.scheme = "vesper-remote".to_string();
			}
		}
	}

	#[test]
	fn rewrites_nested_marked_objects_only() {
		let mut value = json!({
			"target": { "$mid": 1, "scheme": "file", "path": "/a.txt" },
			"plain": { "scheme": "file", "path": "/untouched" },
			"list": [{ "$mid": 1, "scheme": "file", "path": "/b.txt" }],
		});
		transform_outgoing_json(&SchemeSwap, &mut value);
		assert_eq!(value["target"]["scheme"], "vesper-remote");
		assert_eq!(value["plain"]["scheme"], "file");
		assert_eq!(value["list"][0]["scheme"], "vesper-remote");
	}

	#[test]
	fn incoming_reverses_outgoing() {
		let mut value = json!({ "$mid": 1, "scheme": "vesper-remote", "path": "/x" });
		transform_incoming_json(&SchemeSwap, &mut value);
		assert_eq!(value["scheme"], "file");
	}

	#[test]
	fn parse_splits_components() {
		let parts = UriParts::parse("file:///w/a.txt?q=1#frag").unwrap();
		assert_eq!(parts.scheme, "file");
		assert_eq!(parts.path, "/w/a.txt");
		assert_eq!(parts.query, "q=1");
		assert_eq!(parts.fragment, "frag");
		assert_eq!(parts.to_string(), "file:///w/a.txt?q=1#frag");
	}
}
