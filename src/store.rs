//! External store bridge.
//!
//! Module addresses and resource keys referenced by a compilation are
//! collected here in first-encounter order. The index a key receives is the
//! index the emitted script uses to reach it, so the boundary arrays handed
//! to the host line up with the text.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::escape::{json_literal, string_literal};

// ═══════════════════════════════════════════════════════════════════════════════
// MODULE RESOLUTION
// ═══════════════════════════════════════════════════════════════════════════════

/// Maps a module address to the address the browser will actually load.
pub trait ModuleResolver {
    fn resolve(&self, address: &str) -> String;
}

impl<F> ModuleResolver for F
where
    F: Fn(&str) -> String,
{
    fn resolve(&self, address: &str) -> String {
        self(address)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityResolver;

impl ModuleResolver for IdentityResolver {
    fn resolve(&self, address: &str) -> String {
        address.to_string()
    }
}

/// Serves relative and bare addresses from a fixed base path.
#[derive(Debug, Clone)]
pub struct PrefixResolver {
    base: String,
}

impl PrefixResolver {
    pub fn new(base: impl Into<String>) -> Self {
        Self { base: base.into() }
    }
}

impl ModuleResolver for PrefixResolver {
    fn resolve(&self, address: &str) -> String {
        if address.starts_with('/') || address.contains("://") {
            return address.to_string();
        }
        let relative = address.trim_start_matches("./");
        format!("{}/{}", self.base.trim_end_matches('/'), relative)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RESOURCE MODE
// ═══════════════════════════════════════════════════════════════════════════════

/// How resource references reach their values at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceMode {
    /// Values are serialized inline into the script.
    Snapshot,
    /// Values are read through an accessor into the client-side store.
    Runtime,
}

// ═══════════════════════════════════════════════════════════════════════════════
// REGISTRIES
// ═══════════════════════════════════════════════════════════════════════════════

/// Value of a late-bound resource at compile time.
#[derive(Clone)]
pub enum ResourceValue {
    Eager(serde_json::Value),
    /// Invoked once, when the key is first registered.
    Lazy(Rc<dyn Fn() -> serde_json::Value>),
}

impl fmt::Debug for ResourceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceValue::Eager(value) => f.debug_tuple("Eager").field(value).finish(),
            ResourceValue::Lazy(_) => f.write_str("Lazy(..)"),
        }
    }
}

impl ResourceValue {
    fn snapshot(&self) -> serde_json::Value {
        match self {
            ResourceValue::Eager(value) => value.clone(),
            ResourceValue::Lazy(produce) => produce(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ModuleRegistry {
    resolved: Vec<String>,
    index: HashMap<String, usize>,
}

impl ModuleRegistry {
    pub fn register(&mut self, address: &str, resolver: &dyn ModuleResolver) -> usize {
        if let Some(&i) = self.index.get(address) {
            return i;
        }
        let i = self.resolved.len();
        self.resolved.push(resolver.resolve(address));
        self.index.insert(address.to_string(), i);
        tracing::trace!(address, index = i, "registered module");
        i
    }

    /// Resolved addresses in index order.
    pub fn addresses(&self) -> &[String] {
        &self.resolved
    }

    pub fn len(&self) -> usize {
        self.resolved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolved.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResourceRegistry {
    keys: Vec<String>,
    values: Vec<serde_json::Value>,
    index: HashMap<String, usize>,
}

impl ResourceRegistry {
    pub fn register(&mut self, key: &str, value: &ResourceValue) -> usize {
        if let Some(&i) = self.index.get(key) {
            return i;
        }
        let i = self.keys.len();
        self.keys.push(key.to_string());
        self.values.push(value.snapshot());
        self.index.insert(key.to_string(), i);
        tracing::trace!(key, index = i, "registered resource");
        i
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// `(key, snapshot)` pairs in index order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &serde_json::Value)> {
        self.keys.iter().map(String::as_str).zip(self.values.iter())
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Store contents for one compilation. Pass the same value to several
/// compilations to keep indices stable across them.
#[derive(Debug, Clone, Default)]
pub struct ScriptStores {
    pub modules: ModuleRegistry,
    pub resources: ResourceRegistry,
}

impl ScriptStores {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expansion of the module store declaration: resolves every recorded
    /// address concurrently. `addresses_param` names a host-supplied array
    /// instead of inlining the addresses.
    pub fn render_module_store(&self, addresses_param: Option<&str>) -> String {
        let addresses = match addresses_param {
            Some(param) => param.to_string(),
            None => {
                let items: Vec<String> = self
                    .modules
                    .addresses()
                    .iter()
                    .map(|a| string_literal(a))
                    .collect();
                format!("[{}]", items.join(","))
            }
        };
        format!("await Promise.all({}.map(u=>import(u)))", addresses)
    }

    /// Expansion of the resource store declaration.
    ///
    /// `Snapshot` inlines every value; `Runtime` asks `accessor` (a function
    /// exported by the client runtime, or a host-supplied parameter when
    /// `keys_inline` is false) for an index-keyed reader.
    pub fn render_resource_store(&self, mode: ResourceMode, accessor: &str, keys_inline: bool) -> String {
        match mode {
            ResourceMode::Snapshot => {
                let values: Vec<String> = self
                    .resources
                    .entries()
                    .map(|(_, value)| json_literal(value))
                    .collect();
                format!("[{}]", values.join(","))
            }
            ResourceMode::Runtime if keys_inline => {
                let keys: Vec<String> = self
                    .resources
                    .keys()
                    .iter()
                    .map(|k| string_literal(k))
                    .collect();
                format!("{}([{}])", accessor, keys.join(","))
            }
            ResourceMode::Runtime => accessor.to_string(),
        }
    }
}
