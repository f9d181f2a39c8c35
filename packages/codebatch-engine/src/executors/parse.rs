//! Parse executor: source file → stored outline
//!
//! Emits one `ast` record per Python file, whose `object` is the outline
//! serialized as JSON in the CAS. Non-Python and non-UTF-8 files are
//! skipped.

use tracing::debug;

use super::{outline, Executor, ExecutorContext, ShardFile};
use crate::errors::Result;
use crate::records::{OutputDraft, RecordKind};

pub struct ParseExecutor;

fn is_python(file: &ShardFile) -> bool {
    file.lang_hint.as_deref() == Some("python") || file.path.ends_with(".py")
}

impl Executor for ParseExecutor {
    fn execute(
        &self,
        _config: &serde_json::Value,
        files: &[ShardFile],
        ctx: &ExecutorContext<'_>,
    ) -> Result<Vec<OutputDraft>> {
        let mut drafts = Vec::new();
        for file in files {
            if !is_python(file) {
                continue;
            }
            let bytes = ctx.get_object(&file.object)?;
            let source = match String::from_utf8(bytes) {
                Ok(source) => source,
                Err(_) => {
                    debug!(path = %file.path, "skipping non-UTF-8 source");
                    continue;
                }
            };
            let outline = outline::parse_outline(&file.path, &source);
            let payload = serde_json::to_vec(&outline)?;
            let (object, format) = ctx.put_object(RecordKind::Ast, Some("json"), &payload)?;
            let mut draft = OutputDraft::ast(&file.path, object, "json");
            draft.format = format;
            drafts.push(draft);
        }
        Ok(drafts)
    }
}
