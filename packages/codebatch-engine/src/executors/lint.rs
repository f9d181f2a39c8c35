//! Lint executor: outline → diagnostics
//!
//! Rules:
//! - `L101` unused import: the bound name is never referenced
//! - `L102` unused variable: a function-scoped binding is never referenced
//!
//! `config.rules` restricts the active rule set.

use super::{outline::SourceOutline, Executor, ExecutorContext, ShardFile};
use crate::errors::{EngineError, Result};
use crate::records::{OutputDraft, RecordKind, Severity};

pub const RULE_UNUSED_IMPORT: &str = "L101";
pub const RULE_UNUSED_VARIABLE: &str = "L102";

pub struct LintExecutor;

fn rule_enabled(config: &serde_json::Value, code: &str) -> bool {
    match config.get("rules").and_then(|r| r.as_array()) {
        Some(list) => list.iter().any(|v| v.as_str() == Some(code)),
        None => true,
    }
}

impl Executor for LintExecutor {
    fn execute(
        &self,
        config: &serde_json::Value,
        _files: &[ShardFile],
        ctx: &ExecutorContext<'_>,
    ) -> Result<Vec<OutputDraft>> {
        let mut drafts = Vec::new();
        for record in ctx.iter_prior_outputs("parse", Some(RecordKind::Ast))? {
            let object = record.object.ok_or_else(|| {
                EngineError::schema(format!("ast record for {:?} has no object", record.path))
            })?;
            let outline: SourceOutline = serde_json::from_slice(&ctx.get_object(&object)?)?;

            if rule_enabled(config, RULE_UNUSED_IMPORT) {
                for import in &outline.imports {
                    if !outline.is_referenced(&import.name) {
                        drafts.push(OutputDraft::diagnostic(
                            &record.path,
                            Severity::Warning,
                            RULE_UNUSED_IMPORT,
                            format!("Unused import '{}'", import.name),
                            import.line,
                            import.column,
                        ));
                    }
                }
            }

            if rule_enabled(config, RULE_UNUSED_VARIABLE) {
                for assign in &outline.assignments {
                    if assign.function.is_some() && !outline.is_referenced(&assign.name) {
                        drafts.push(OutputDraft::diagnostic(
                            &record.path,
                            Severity::Warning,
                            RULE_UNUSED_VARIABLE,
                            format!("Unused variable '{}'", assign.name),
                            assign.line,
                            assign.column,
                        ));
                    }
                }
            }
        }
        Ok(drafts)
    }
}
