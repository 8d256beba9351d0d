//! Finalize module for the script compiler
//!
//! Compilation entry points: runs analysis and emission over a builder's
//! graph and packages the script with the store contents the host needs to
//! run it.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::analysis::analyze;
use crate::builder::ScriptBuilder;
use crate::codegen::{EmitConfig, Emitter};
use crate::escape::is_identifier;
use crate::node::{Body, Expr};
use crate::store::{IdentityResolver, ModuleResolver, PrefixResolver, ResourceMode, ScriptStores};
use crate::validate::{verify_script, CompilerError, ERR_INVALID_INPUT, ERR_MODE_BODY};

// ═══════════════════════════════════════════════════════════════════════════════
// OPTIONS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompileMode {
    /// A script body that runs directly.
    #[default]
    Statements,
    /// An async wrapper returning one expression's value to the host.
    Evaluation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompileOptions {
    pub mode: CompileMode,
    /// Defaults to `runtime` for statements and `snapshot` for evaluation.
    pub resource_mode: Option<ResourceMode>,
    /// Prefix of generated names. Raw text must not use names of this form.
    pub name_prefix: String,
    pub module_param: String,
    pub resource_param: String,
    pub resource_accessor: String,
    pub ref_binding: String,
    /// Base path relative module addresses are served from.
    pub module_base: Option<String>,
    /// Parse the emitted script and check its generated names.
    pub verify_output: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            mode: CompileMode::Statements,
            resource_mode: None,
            name_prefix: "_".to_string(),
            module_param: "$m".to_string(),
            resource_param: "$r".to_string(),
            resource_accessor: "__resources".to_string(),
            ref_binding: "$refs".to_string(),
            module_base: None,
            verify_output: false,
        }
    }
}

impl CompileOptions {
    pub fn evaluation() -> Self {
        CompileOptions {
            mode: CompileMode::Evaluation,
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self, CompilerError> {
        serde_json::from_str(json).map_err(|e| {
            CompilerError::new(ERR_INVALID_INPUT, &format!("Invalid compile options: {}", e))
        })
    }

    pub fn effective_resource_mode(&self) -> ResourceMode {
        self.resource_mode.unwrap_or(match self.mode {
            CompileMode::Statements => ResourceMode::Runtime,
            CompileMode::Evaluation => ResourceMode::Snapshot,
        })
    }

    /// Resolver implied by `module_base`.
    pub fn resolver(&self) -> Box<dyn ModuleResolver> {
        match &self.module_base {
            Some(base) => Box::new(PrefixResolver::new(base.clone())),
            None => Box::new(IdentityResolver),
        }
    }

    fn validate(&self) -> Result<(), CompilerError> {
        let names = [
            ("namePrefix", format!("{}0", self.name_prefix)),
            ("moduleParam", self.module_param.clone()),
            ("resourceParam", self.resource_param.clone()),
            ("resourceAccessor", self.resource_accessor.clone()),
            ("refBinding", self.ref_binding.clone()),
        ];
        for (field, name) in names {
            if !is_identifier(&name) {
                return Err(CompilerError::with_details(
                    ERR_INVALID_INPUT,
                    &format!("Option '{}' does not form a valid identifier: '{}'", field, name),
                    None,
                    vec![],
                ));
            }
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RESULT
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileResult {
    pub code: String,
    /// Resolved module addresses, indexed as referenced in `code`.
    pub modules: Vec<String>,
    /// `[key, snapshot]` pairs, indexed as referenced in `code`.
    pub resources: Vec<(String, serde_json::Value)>,
    /// Number of distinct ref placeholders.
    pub refs: usize,
    pub top_level_await: bool,
    /// SHA-256 of `code`, hex encoded.
    pub hash: String,
}

fn content_hash(code: &str) -> String {
    format!("{:x}", Sha256::digest(code.as_bytes()))
}

// ═══════════════════════════════════════════════════════════════════════════════
// ENTRY POINTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Compiles `roots` as a script body in statement order.
pub fn to_script(
    cx: &ScriptBuilder,
    roots: &[Expr],
    options: &CompileOptions,
    stores: &mut ScriptStores,
    resolver: &dyn ModuleResolver,
) -> Result<CompileResult, CompilerError> {
    let options = CompileOptions {
        mode: CompileMode::Statements,
        ..options.clone()
    };
    compile(cx, &Body::Statements(roots.to_vec()), &options, stores, resolver)
}

/// Compiles `root` into an async wrapper the host evaluates and invokes.
pub fn to_evaluation(
    cx: &ScriptBuilder,
    root: Expr,
    options: &CompileOptions,
    stores: &mut ScriptStores,
    resolver: &dyn ModuleResolver,
) -> Result<CompileResult, CompilerError> {
    let options = CompileOptions {
        mode: CompileMode::Evaluation,
        ..options.clone()
    };
    compile(cx, &Body::Expr(root), &options, stores, resolver)
}

/// Compiles `body` in `options.mode`. Evaluation mode needs a single
/// expression body; statement mode takes either form.
pub fn compile(
    cx: &ScriptBuilder,
    body: &Body,
    options: &CompileOptions,
    stores: &mut ScriptStores,
    resolver: &dyn ModuleResolver,
) -> Result<CompileResult, CompilerError> {
    options.validate()?;
    let resource_mode = options.effective_resource_mode();
    tracing::debug!(mode = ?options.mode, ?resource_mode, roots = body.roots().len(), "compiling script");

    let analysis = analyze(cx, body, &options.name_prefix)?;

    let config = match options.mode {
        CompileMode::Statements => EmitConfig {
            resource_mode,
            ref_binding: &options.ref_binding,
            resource_accessor: &options.resource_accessor,
            module_param: None,
            resource_param: None,
        },
        CompileMode::Evaluation => EmitConfig {
            resource_mode,
            ref_binding: &options.ref_binding,
            resource_accessor: &options.resource_accessor,
            module_param: Some(options.module_param.as_str()),
            resource_param: Some(options.resource_param.as_str()),
        },
    };

    let mut emitter = Emitter::new(cx, &analysis, stores, resolver, config);
    let code = match (options.mode, body) {
        (CompileMode::Statements, body) => emitter.statements(body.roots())?,
        (CompileMode::Evaluation, Body::Expr(root)) => emitter.evaluation(*root)?,
        (CompileMode::Evaluation, Body::Statements(_)) => {
            return Err(CompilerError::with_details(
                ERR_MODE_BODY,
                "Evaluation mode needs a single root expression.",
                None,
                vec!["Use statement mode, or wrap the statements in a function and call it.".to_string()],
            ))
        }
    };
    let emitted = emitter.finish(code);

    if options.verify_output {
        verify_script(&emitted.code, &options.name_prefix)?;
    }

    let top_level_await = options.mode == CompileMode::Statements && analysis.is_suspending(None);
    let hash = content_hash(&emitted.code);

    Ok(CompileResult {
        code: emitted.code,
        modules: stores.modules.addresses().to_vec(),
        resources: stores
            .resources
            .entries()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect(),
        refs: emitted.refs,
        top_level_await,
        hash,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_from_json_defaults() {
        let options = CompileOptions::from_json(r#"{"mode":"evaluation"}"#).unwrap();
        assert_eq!(options.mode, CompileMode::Evaluation);
        assert_eq!(options.name_prefix, "_");
        assert_eq!(options.effective_resource_mode(), ResourceMode::Snapshot);

        let options =
            CompileOptions::from_json(r#"{"resourceMode":"snapshot","moduleBase":"/assets"}"#).unwrap();
        assert_eq!(options.mode, CompileMode::Statements);
        assert_eq!(options.effective_resource_mode(), ResourceMode::Snapshot);
        assert_eq!(options.resolver().resolve("x.js"), "/assets/x.js");
    }

    #[test]
    fn test_options_reject_bad_json() {
        let err = CompileOptions::from_json("{mode:").unwrap_err();
        assert_eq!(err.code, ERR_INVALID_INPUT);
    }

    #[test]
    fn test_invalid_prefix_rejected() {
        let cx = ScriptBuilder::new();
        let options = CompileOptions {
            name_prefix: "1-".to_string(),
            ..CompileOptions::default()
        };
        let err = to_script(&cx, &[], &options, &mut ScriptStores::new(), &IdentityResolver)
            .unwrap_err();
        assert_eq!(err.code, ERR_INVALID_INPUT);
    }

    #[test]
    fn test_evaluation_rejects_statement_list() {
        let cx = ScriptBuilder::new();
        let a = cx.raw("a()");
        let err = compile(
            &cx,
            &Body::Statements(vec![a]),
            &CompileOptions::evaluation(),
            &mut ScriptStores::new(),
            &IdentityResolver,
        )
        .unwrap_err();
        assert_eq!(err.code, ERR_MODE_BODY);
    }

    #[test]
    fn test_hash_tracks_code() {
        let cx = ScriptBuilder::new();
        let a = cx.raw("a()");
        let options = CompileOptions::default();
        let first = to_script(&cx, &[a], &options, &mut ScriptStores::new(), &IdentityResolver).unwrap();
        let again = to_script(&cx, &[a], &options, &mut ScriptStores::new(), &IdentityResolver).unwrap();
        assert_eq!(first.code, "a();");
        assert_eq!(first.hash, again.hash);
        assert_eq!(first.hash.len(), 64);
        assert_ne!(first.hash, content_hash("b();"));
    }
}
