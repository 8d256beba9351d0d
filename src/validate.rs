//! Compiler errors and emitted-script verification.
//!
//! Every failure the compiler can report carries an invariant code and the
//! guarantee that code protects, so hosts across the NAPI boundary can match
//! on codes instead of message text.

use oxc_allocator::Allocator;
use oxc_ast_visit::Visit;
use oxc_parser::Parser;
use oxc_span::SourceType;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

// ═══════════════════════════════════════════════════════════════════════════════
// INVARIANT CODES
// ═══════════════════════════════════════════════════════════════════════════════

pub const ERR_UNCONVERTIBLE_VALUE: &str = "Z-ERR-CONVERT-001";
pub const ERR_UNFILLED_SLOT: &str = "Z-ERR-SLOT-001";
pub const ERR_SLOT_REFILLED: &str = "Z-ERR-SLOT-002";
pub const ERR_REENTRANT_BODY: &str = "Z-ERR-BODY-001";
pub const ERR_NOT_A_FUNCTION: &str = "Z-ERR-BODY-002";
pub const ERR_CYCLIC_GRAPH: &str = "Z-ERR-ANALYSIS-001";
pub const ERR_MISSING_NAME: &str = "Z-ERR-ANALYSIS-002";
pub const ERR_SCOPE_LEAK: &str = "Z-ERR-SCOPE-LEAK";
pub const ERR_MODE_BODY: &str = "Z-ERR-MODE-001";
pub const ERR_UNKNOWN_NAME: &str = "Z-ERR-IR-001";
pub const ERR_INVALID_INPUT: &str = "Z-ERR-IR-002";
pub const ERR_SYNTAX: &str = "Z-ERR-VERIFY-001";
pub const ERR_UNBOUND_NAME: &str = "Z-ERR-VERIFY-002";

// ═══════════════════════════════════════════════════════════════════════════════
// GUARANTEES
// ═══════════════════════════════════════════════════════════════════════════════

fn get_guarantee(code: &str) -> &'static str {
    match code {
        ERR_UNCONVERTIBLE_VALUE => "Only values with a script form are embedded in emitted code.",
        ERR_UNFILLED_SLOT => "Every forward reference is resolved before emission.",
        ERR_SLOT_REFILLED => "A node never changes after construction.",
        ERR_REENTRANT_BODY => "A function body is constructed exactly once.",
        ERR_NOT_A_FUNCTION => "Only function nodes own a body.",
        ERR_CYCLIC_GRAPH => "Expression graphs are acyclic outside function bodies.",
        ERR_MISSING_NAME => "Every declared node is emitted under exactly one name.",
        ERR_SCOPE_LEAK => {
            "A node is only used inside the function it was constructed in, or functions nested in it."
        }
        ERR_MODE_BODY => "Evaluation mode compiles exactly one root expression.",
        ERR_UNKNOWN_NAME => "Program IR names resolve lexically.",
        ERR_INVALID_INPUT => "Program IR and options are well-formed JSON.",
        ERR_SYNTAX => "Emitted script is syntactically valid.",
        ERR_UNBOUND_NAME => "Every generated name is declared in an enclosing scope.",
        _ => "Unknown invariant.",
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// COMPILER ERROR
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "camelCase")]
#[error("[{code}] {message}")]
pub struct CompilerError {
    pub code: String,
    pub error_type: String,
    pub message: String,
    pub guarantee: String,
    pub context: Option<String>,
    pub hints: Vec<String>,
}

impl CompilerError {
    pub fn new(code: &str, message: &str) -> Self {
        Self::with_details(code, message, None, vec![])
    }

    pub fn with_details(
        code: &str,
        message: &str,
        context: Option<String>,
        hints: Vec<String>,
    ) -> Self {
        CompilerError {
            code: code.to_string(),
            error_type: "COMPILER_INVARIANT_VIOLATION".to_string(),
            message: message.to_string(),
            guarantee: get_guarantee(code).to_string(),
            context,
            hints,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// OUTPUT VERIFICATION
// ═══════════════════════════════════════════════════════════════════════════════

/// Parses emitted script and checks that every generated name it reads is
/// bound somewhere in the script.
///
/// Generated names are recognised by `name_prefix` followed by base-36 digits.
pub fn verify_script(code: &str, name_prefix: &str) -> Result<(), CompilerError> {
    let allocator = Allocator::default();
    let source_type = SourceType::default().with_module(true);
    let ret = Parser::new(&allocator, code, source_type).parse();

    if !ret.errors.is_empty() {
        return Err(CompilerError::with_details(
            ERR_SYNTAX,
            &format!("Emitted script does not parse: {:?}", ret.errors),
            Some(code.to_string()),
            vec![],
        ));
    }

    let mut collector = GeneratedNameCollector {
        references: vec![],
        bindings: HashSet::new(),
    };
    collector.visit_program(&ret.program);

    let generated = generated_name_pattern(name_prefix)?;
    for name in collector.references {
        if generated.is_match(&name) && !collector.bindings.contains(&name) {
            return Err(CompilerError::with_details(
                ERR_UNBOUND_NAME,
                &format!("Generated name '{}' is referenced but never declared.", name),
                Some(code.to_string()),
                vec![],
            ));
        }
    }

    Ok(())
}

fn generated_name_pattern(name_prefix: &str) -> Result<Regex, CompilerError> {
    Regex::new(&format!("^{}[0-9a-z]+$", regex::escape(name_prefix))).map_err(|e| {
        CompilerError::new(
            ERR_INVALID_INPUT,
            &format!("Invalid name prefix '{}': {}", name_prefix, e),
        )
    })
}

struct GeneratedNameCollector {
    references: Vec<String>,
    bindings: HashSet<String>,
}

impl<'a> Visit<'a> for GeneratedNameCollector {
    fn visit_identifier_reference(&mut self, ident: &oxc_ast::ast::IdentifierReference<'a>) {
        self.references.push(ident.name.to_string());
    }

    fn visit_binding_identifier(&mut self, ident: &oxc_ast::ast::BindingIdentifier<'a>) {
        self.bindings.insert(ident.name.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_carries_guarantee() {
        let err = CompilerError::new(ERR_SCOPE_LEAK, "leaked");
        assert_eq!(err.code, "Z-ERR-SCOPE-LEAK");
        assert!(err.guarantee.contains("nested"));
        assert_eq!(err.to_string(), "[Z-ERR-SCOPE-LEAK] leaked");
    }

    #[test]
    fn test_error_serializes_camel_case() {
        let err = CompilerError::new(ERR_SYNTAX, "bad");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["errorType"], "COMPILER_INVARIANT_VIOLATION");
        assert_eq!(json["code"], "Z-ERR-VERIFY-001");
    }

    #[test]
    fn test_verify_accepts_declared_names() {
        let code = "let _0=Math.random();log(_0,(_1)=>_1+_0);";
        assert!(verify_script(code, "_").is_ok());
    }

    #[test]
    fn test_verify_accepts_top_level_await() {
        let code = "let _0=await Promise.all([\"/a.js\"].map(u=>import(u)));_0[0].run();";
        assert!(verify_script(code, "_").is_ok());
    }

    #[test]
    fn test_verify_rejects_syntax_errors() {
        let err = verify_script("let _0=;", "_").unwrap_err();
        assert_eq!(err.code, ERR_SYNTAX);
    }

    #[test]
    fn test_verify_rejects_unbound_generated_name() {
        let err = verify_script("log(_3);", "_").unwrap_err();
        assert_eq!(err.code, ERR_UNBOUND_NAME);
    }

    #[test]
    fn test_verify_ignores_foreign_names() {
        assert!(verify_script("log(window.x, _private_thing);", "_").is_ok());
    }
}
