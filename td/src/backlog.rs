//! Repository backlog importer: parses a self-repository's
//! `TASK_START`/`TASK_END`-delimited backlog file into `Task` rows, gated by
//! an idempotent `backlog_imported:<path>` state-kv flag.

use tracing::{info, warn};

use crate::domain::{StateKv, Task};
use crate::phase::PhaseCtx;

/// One parsed `TASK_START` ... `TASK_END` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BacklogItem {
    pub title: String,
    pub description: String,
}

/// Line-oriented parser: blocks are delimited by bare `TASK_START`/`TASK_END`
/// lines; within a block, `TITLE: ...` and `DESCRIPTION: ...` prefix lines are
/// recognized. Unrecognized lines inside a block are ignored.
pub fn parse_backlog(content: &str) -> Vec<BacklogItem> {
    let mut items = Vec::new();
    let mut in_block = false;
    let mut title = String::new();
    let mut description_lines: Vec<String> = Vec::new();

    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed == "TASK_START" {
            in_block = true;
            title.clear();
            description_lines.clear();
            continue;
        }
        if trimmed == "TASK_END" {
            if in_block && !title.is_empty() {
                items.push(BacklogItem {
                    title: title.clone(),
                    description: description_lines.join("\n"),
                });
            }
            in_block = false;
            continue;
        }
        if !in_block {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("TITLE:") {
            title = rest.trim().to_string();
        } else if let Some(rest) = trimmed.strip_prefix("DESCRIPTION:") {
            description_lines.push(rest.trim().to_string());
        } else if !trimmed.is_empty() {
            description_lines.push(trimmed.to_string());
        }
    }

    items
}

/// Import a repository's backlog file, creating one `Task` per block, gated
/// by `backlog_imported:<path>` so a second call is a no-op (idempotence
/// law).
pub async fn import_backlog(ctx: &PhaseCtx, repo_path: &str, backlog_path: &str, default_mode: &str, max_attempts: u32) -> Result<usize, taskstore::StoreError> {
    let gate_key = format!("backlog_imported:{backlog_path}");

    {
        let store = ctx.store.lock().await;
        if store.get::<StateKv>(&gate_key)?.is_some() {
            return Ok(0);
        }
    }

    let content = match std::fs::read_to_string(backlog_path) {
        Ok(c) => c,
        Err(e) => {
            warn!(backlog_path, error = %e, "backlog::import_backlog: failed to read backlog file");
            return Ok(0);
        }
    };

    let items = parse_backlog(&content);
    let mut store = ctx.store.lock().await;
    let mut task_ids = Vec::with_capacity(items.len());
    for item in &items {
        let task = Task::new(&item.title, &item.description, repo_path, default_mode, max_attempts);
        task_ids.push(task.id.clone());
        store.create(task)?;
    }
    // Value is the comma-joined ids of every task this import seeded, so the
    // Integration Coordinator can later tell whether all of them have merged
    // and the backlog file is safe to remove.
    store.create(StateKv::new(gate_key, task_ids.join(",")))?;

    info!(backlog_path, count = items.len(), "backlog::import_backlog: imported");
    Ok(items.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_block() {
        let content = "TASK_START\nTITLE: Add retries\nDESCRIPTION: Retry failed pushes.\nTASK_END\n";
        let items = parse_backlog(content);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "Add retries");
        assert_eq!(items[0].description, "Retry failed pushes.");
    }

    #[test]
    fn parses_multiple_blocks_and_ignores_noise_outside_them() {
        let content = "some preamble\nTASK_START\nTITLE: One\nDESCRIPTION: First\nTASK_END\nnoise\nTASK_START\nTITLE: Two\nDESCRIPTION: Second\nTASK_END\n";
        let items = parse_backlog(content);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].title, "One");
        assert_eq!(items[1].title, "Two");
    }

    #[test]
    fn multi_line_description_is_joined() {
        let content = "TASK_START\nTITLE: Multi\nDESCRIPTION: line one\nline two\nTASK_END\n";
        let items = parse_backlog(content);
        assert_eq!(items[0].description, "line one\nline two");
    }

    #[test]
    fn block_without_title_is_skipped() {
        let content = "TASK_START\nDESCRIPTION: no title here\nTASK_END\n";
        let items = parse_backlog(content);
        assert!(items.is_empty());
    }
}
