//! # Script Compiler
//!
//! Builds graphs of script expressions on the server and emits them as one
//! compact piece of JavaScript for the browser.
//!
//! ## Pipeline
//!
//! 1. **Construction**: a [`ScriptBuilder`] creates nodes. Every node records
//!    the function it was constructed in; function bodies are built lazily,
//!    with the function on top of the builder's scope stack.
//! 2. **Analysis**: decides for every reachable node whether it is declared
//!    once in its own scope or inlined at each use, and which functions must
//!    be `async`.
//! 3. **Emission**: writes declarations in dependency order, inlines the
//!    rest, and collects referenced modules and resources into
//!    [`ScriptStores`].
//!
//! ## Output Invariants
//!
//! 1. A node referenced from several places is evaluated once.
//! 2. A declared node is declared in the scope it was constructed in, never
//!    in the scope of a use site.
//! 3. A function containing a suspending node renders as `async`.
//! 4. Module and resource indices in the script match the order of
//!    [`CompileResult::modules`] and [`CompileResult::resources`].

#[cfg(feature = "napi")]
use napi_derive::napi;

mod analysis;
mod builder;
mod codegen;
mod convert;
mod escape;
mod finalize;
mod node;
mod store;
mod transform;
mod validate;

#[cfg(test)]
mod safety_tests;

pub use analysis::{analyze, Analysis};
pub use builder::{ScriptBuilder, TemplateBuilder};
pub use convert::{HostFunction, HostValue};
pub use finalize::{compile, to_evaluation, to_script, CompileMode, CompileOptions, CompileResult};
pub use node::{Body, Expr, ExprFlags, NodeKind, Part, Scope};
pub use store::{
    IdentityResolver, ModuleRegistry, ModuleResolver, PrefixResolver, ResourceMode,
    ResourceRegistry, ResourceValue, ScriptStores,
};
pub use transform::{
    compile_program, compile_program_json, parse_program, BodyIR, DefinitionIR, NodeIR, ProgramIR,
    TemplatePartIR,
};
pub use validate::*;

/// Compiles a JSON program and returns the JSON of its [`CompileResult`].
#[cfg(feature = "napi")]
#[napi]
pub fn compile_script_native(program_json: String, options_json: Option<String>) -> napi::Result<String> {
    let result = compile_program_json(&program_json, options_json.as_deref())
        .map_err(|e| napi::Error::from_reason(serde_json::to_string(&e).unwrap_or_else(|_| e.to_string())))?;
    serde_json::to_string(&result).map_err(|e| napi::Error::from_reason(format!("Invalid result: {}", e)))
}

#[cfg(feature = "napi")]
#[napi]
pub fn compile_bridge() -> String {
    "Script Compiler Native Bridge Connected".to_string()
}
