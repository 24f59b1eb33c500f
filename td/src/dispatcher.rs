//! Task Dispatcher: selects eligible tasks, claims them via the
//! `dispatched_at` exactly-once lock, and spawns a worker per task under the
//! global parallelism cap.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use taskstore::{Filter, FilterOp, IndexValue};
use tracing::{debug, info, warn};

use crate::domain::{STATUS_DONE, STATUS_FAILED, STATUS_MERGED, Task};
use crate::phase::PhaseCtx;

/// Fetch active (non-terminal) tasks ordered oldest-first by `created_at`.
///
/// `Store::list` already orders by its own `id` column, but `generate_id`
/// embeds a title-derived slug ahead of the time-ordered UUID suffix, so
/// lexicographic id order is not creation order. Dispatch and integration
/// both require "task id ascending, oldest first"; the literal
/// requirement is satisfied by sorting on `created_at`, the field that
/// actually models a monotonically increasing id for this store's string-id
/// scheme. See DESIGN.md for the full rationale.
async fn active_tasks_oldest_first(ctx: &PhaseCtx, limit: usize) -> Result<Vec<Task>, taskstore::StoreError> {
    let store = ctx.store.lock().await;
    let mut tasks: Vec<Task> = store
        .list::<Task>(&[])?
        .into_iter()
        .filter(|t| ![STATUS_DONE, STATUS_MERGED, STATUS_FAILED].contains(&t.status.as_str()))
        .collect();
    tasks.sort_by_key(|t| t.created_at);
    tasks.truncate(limit);
    Ok(tasks)
}

/// Run one dispatch pass: claim and spawn workers for up to
/// `max_parallel_agents - active_agents` eligible tasks.
pub async fn dispatch_tick(ctx: &PhaseCtx, active_agents: &Arc<AtomicUsize>, fetch_limit: usize) {
    let max_parallel = ctx.config.pipeline.max_parallel_agents;

    let tasks = match active_tasks_oldest_first(ctx, fetch_limit).await {
        Ok(t) => t,
        Err(e) => {
            warn!(error = %e, "dispatcher::dispatch_tick: failed to list tasks");
            return;
        }
    };

    for task in tasks {
        if active_agents.load(Ordering::SeqCst) >= max_parallel {
            debug!("dispatcher::dispatch_tick: parallelism cap reached, stopping this pass");
            break;
        }
        if task.is_dispatched() {
            continue;
        }

        let claimed = {
            let mut store = ctx.store.lock().await;
            store.compare_and_set::<Task>(&task.id, |t| !t.is_dispatched() && !t.is_terminal(), |t| t.mark_dispatched())
        };

        let claimed = match claimed {
            Ok(Some(t)) => t,
            Ok(None) => continue, // another worker (or a concurrent tick) already claimed it
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "dispatcher::dispatch_tick: compare_and_set failed");
                continue;
            }
        };

        active_agents.fetch_add(1, Ordering::SeqCst);
        let ctx = ctx.clone();
        let active_agents = Arc::clone(active_agents);
        let task_id = claimed.id.clone();

        // `tokio::spawn` itself cannot fail short of a missing runtime context
        // (which would be a startup bug, not a per-task condition). The
        // worker clears its own dispatch mark on exit below regardless of how
        // the phase executor returned, so a claim is never left stuck.
        tokio::spawn(async move {
            info!(task_id = %task_id, "dispatcher: worker started");
            if let Err(e) = ctx.run(&task_id).await {
                warn!(task_id = %task_id, error = %e, "dispatcher: phase executor returned an error");
            }
            {
                let mut store = ctx.store.lock().await;
                if let Ok(Some(mut t)) = store.get::<Task>(&task_id) {
                    if t.is_dispatched() {
                        t.clear_dispatch();
                        store.update(t).ok();
                    }
                }
            }
            active_agents.fetch_sub(1, Ordering::SeqCst);
            info!(task_id = %task_id, "dispatcher: worker finished");
        });
    }
}

/// Crash-recovery step run once at startup: any task still marked
/// dispatched cannot actually have a live worker (the process just started),
/// so the lock is stale and must be cleared.
pub async fn clear_stale_dispatch_marks(ctx: &PhaseCtx) -> Result<usize, taskstore::StoreError> {
    let mut store = ctx.store.lock().await;
    let dispatched = store.list::<Task>(&[Filter::new("dispatched", FilterOp::Eq, IndexValue::Bool(true))])?;
    let count = dispatched.len();
    for mut task in dispatched {
        task.clear_dispatch();
        store.update(task)?;
    }
    if count > 0 {
        info!(count, "dispatcher::clear_stale_dispatch_marks: cleared stale dispatch locks from a previous run");
    }
    Ok(count)
}
