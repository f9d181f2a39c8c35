//! Analyze executor: outline → per-file metrics
//!
//! Reads the parse stage's stored outlines through prior-output access and
//! emits `complexity`, `function_count`, and `import_count` metrics.
//! `config.metrics` restricts the emitted set.

use super::{outline::SourceOutline, Executor, ExecutorContext, ShardFile};
use crate::errors::{EngineError, Result};
use crate::records::{OutputDraft, RecordKind};

pub struct AnalyzeExecutor;

fn wanted(config: &serde_json::Value, metric: &str) -> bool {
    match config.get("metrics").and_then(|m| m.as_array()) {
        Some(list) => list.iter().any(|v| v.as_str() == Some(metric)),
        None => true,
    }
}

impl Executor for AnalyzeExecutor {
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

            let complexity = 1.0 + f64::from(outline.branch_count);
            let metrics = [
                ("complexity", complexity),
                ("function_count", outline.functions.len() as f64),
                ("import_count", outline.imports.len() as f64),
            ];
            for (metric, value) in metrics {
                if wanted(config, metric) {
                    drafts.push(OutputDraft::metric(&record.path, metric, value));
                }
            }
        }
        Ok(drafts)
    }
}
