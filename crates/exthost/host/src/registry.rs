//! Interned proxy identifiers for both service namespaces.
//!
//! A proxy identifier is a `(shape name, local integer)` pair. The registry
//! allocates the integers once, at construction, for every shape in both
//! namespaces; frames on the wire carry only the integer. Adding a shape or
//! a method is a data edit in [`SCHEMA`], not an inheritance diagram.
//!
//! The registry is an explicit context object handed down from the top of
//! the dependency graph so tests can construct isolated instances.

use std::collections::HashMap;

use vesper_exthost_proto::shapes;
use vesper_exthost_proto::types::ProxyId;

/// A shape: its wire name and its method table, indexed by method number.
#[derive(Debug)]
pub struct ShapeDescriptor {
	/// Wire name, e.g. `MainThreadCommands`.
	pub name: &'static str,
	/// Method names in index order. Shapes whose methods the host never
	/// resolves by name carry an empty table.
	pub methods: &'static [&'static str],
}

/// Method tables for the shapes whose methods are dispatched by name.
/// Shapes absent here still get a proxy id, with an empty table.
const METHOD_TABLES: &[(&str, &[&str])] = &[
	(
		shapes::host::BULK_EDITS,
		&["tryApplyWorkspaceEdit"],
	),
	(
		shapes::host::COMMANDS,
		&["registerCommand", "unregisterCommand", "executeCommand"],
	),
	(shapes::host::MESSAGE_SERVICE, &["showMessage"]),
	(
		shapes::host::OUTPUT_SERVICE,
		&["register", "append", "dispose"],
	),
	(
		shapes::host::SECRET_STATE,
		&["getPassword", "setPassword", "deletePassword"],
	),
	(shapes::host::STORAGE, &["getValue", "setValue"]),
	(
		shapes::host::DOCUMENTS_AND_EDITORS,
		&["tryOpenDocument", "tryShowEditor"],
	),
	(
		shapes::guest::EXTENSION_SERVICE,
		&["activate", "deactivate"],
	),
	(
		shapes::guest::DOCUMENTS_AND_EDITORS,
		&["acceptDocumentsAndEditorsDelta"],
	),
	(
		shapes::guest::EDITORS,
		&["acceptEditorPropertiesChanged"],
	),
	(
		shapes::guest::DOCUMENTS,
		&["acceptModelChanged", "acceptDirtyStateChanged"],
	),
	(
		shapes::guest::CONFIGURATION,
		&["initializeConfiguration", "acceptConfigurationChanged"],
	),
	(shapes::guest::WORKSPACE, &["acceptWorkspaceData"]),
	(shapes::guest::COMMANDS, &["executeContributedCommand"]),
];

/// Registry of both namespaces with pre-allocated numeric ids.
#[derive(Debug)]
pub struct ServiceRegistry {
	entries: Vec<ShapeDescriptor>,
	by_name: HashMap<&'static str, ProxyId>,
}

impl ServiceRegistry {
	/// Intern every shape of both namespaces, hosts first, in declaration
	/// order. Ids start at 1; 0 never names a proxy.
	#[must_use]
	pub fn new() -> Self {
		let mut entries = Vec::new();
		let mut by_name = HashMap::new();
		for &name in shapes::HOST_SHAPES.iter().chain(shapes::GUEST_SHAPES) {
			let methods = METHOD_TABLES
				.iter()
				.find(|(table_name, _)| *table_name == name)
				.map_or(&[][..], |(_, methods)| *methods);
			let id = ProxyId((entries.len() + 1) as u8);
			entries.push(ShapeDescriptor { name, methods });
			by_name.insert(name, id);
		}
		Self { entries, by_name }
	}

	/// Numeric id of a shape name.
	#[must_use]
	pub fn lookup(&self, name: &str) -> Option<ProxyId> {
		self.by_name.get(name).copied()
	}

	/// Descriptor for a numeric id.
	#[must_use]
	pub fn descriptor(&self, id: ProxyId) -> Option<&ShapeDescriptor> {
		id.0.checked_sub(1).and_then(|idx| self.entries.get(idx as usize))
	}

	/// Method index of `method` on shape `name`.
	#[must_use]
	pub fn method_index(&self, name: &str, method: &str) -> Option<u8> {
		let id = self.lookup(name)?;
		let descriptor = self.descriptor(id)?;
		descriptor
			.methods
			.iter()
			.position(|m| *m == method)
			.map(|idx| idx as u8)
	}

	/// Method name for a `(proxy, index)` pair, when the table knows it.
	#[must_use]
	pub fn method_name(&self, id: ProxyId, index: u8) -> Option<&'static str> {
		self.descriptor(id)?.methods.get(index as usize).copied()
	}
}

impl Default for ServiceRegistry {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn every_shape_gets_a_distinct_id() {
		let registry = ServiceRegistry::new();
		let total = shapes::HOST_SHAPES.len() + shapes::GUEST_SHAPES.len();
		let mut seen = std::collections::HashSet::new();
		for &name in shapes::HOST_SHAPES.iter().chain(shapes::GUEST_SHAPES) {
			let id = registry.lookup(name).unwrap();
			assert!(seen.insert(id), "duplicate id for {name}");
		}
		assert_eq!(seen.len(), total);
	}

	#[test]
	fn ids_are_stable_across_instances() {
		let a = ServiceRegistry::new();
		let b = ServiceRegistry::new();
		assert_eq!(
			a.lookup(shapes::guest::EXTENSION_SERVICE),
			b.lookup(shapes::guest::EXTENSION_SERVICE)
		);
	}

	#[test]
	fn method_index_resolves_by_table_position() {
		let registry = ServiceRegistry::new();
		assert_eq!(
			registry.method_index(shapes::host::COMMANDS, "executeCommand"),
			Some(2)
		);
		assert_eq!(
			registry.method_index(shapes::host::COMMANDS, "nonexistent"),
			None
		);
	}

	#[test]
	fn method_name_reverses_the_index() {
		let registry = ServiceRegistry::new();
		let id = registry.lookup(shapes::guest::EXTENSION_SERVICE).unwrap();
		assert_eq!(registry.method_name(id, 0), Some("activate"));
		assert_eq!(registry.method_name(id, 9), None);
	}
}
