//! Symbols executor: outline → symbol records
//!
//! Emits functions, classes, and module-level variables with their
//! declaration lines and enclosing scope.

use super::{outline::SourceOutline, Executor, ExecutorContext, ShardFile};
use crate::errors::{EngineError, Result};
use crate::records::{OutputDraft, RecordKind};

pub struct SymbolsExecutor;

impl Executor for SymbolsExecutor {
    fn execute(
        &self,
        _config: &serde_json::Value,
        _files: &[ShardFile],
        ctx: &ExecutorContext<'_>,
    ) -> Result<Vec<OutputDraft>> {
        let mut drafts = Vec::new();
        for record in ctx.iter_prior_outputs("parse", Some(RecordKind::Ast))? {
            let object = record.object.ok_or_else(|| {
                EngineError::schema(format!("ast record for {:?} has no object", record.path))
            })?;
            let outline: SourceOutline = serde_json::from_slice(&ctx.get_object(&object)?)?;

            for func in &outline.functions {
                let mut draft = OutputDraft::symbol(
                    &record.path,
                    &func.name,
                    "function",
                    &func.scope,
                    func.line,
                );
                draft.column = Some(func.column);
                drafts.push(draft);
            }
            for class in &outline.classes {
                let mut draft = OutputDraft::symbol(
                    &record.path,
                    &class.name,
                    "class",
                    &class.scope,
                    class.line,
                );
                draft.column = Some(class.column);
                drafts.push(draft);
            }
            for assign in &outline.assignments {
                if assign.function.is_none() {
                    let mut draft = OutputDraft::symbol(
                        &record.path,
                        &assign.name,
                        "variable",
                        "module",
                        assign.line,
                    );
                    draft.column = Some(assign.column);
                    drafts.push(draft);
                }
            }
        }
        Ok(drafts)
    }
}
