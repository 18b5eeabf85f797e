//! `forEach` concurrency driver
//!
//! A generic driver over the four iteration modes the spec names. The
//! per-iteration body is supplied by the caller (the workflow executor),
//! which is responsible for binding a fresh `RefContext` and writing the
//! `<step>[index]` checkpoint row — this module only owns the concurrency
//! shape, mirroring how the worker pool bounds concurrent task execution.

use std::future::Future;

use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use tracing::warn;

use crate::error::ExecutorError;
use crate::workflow::ForEachMode;

/// Outcome of running a `forEach`, shaped per mode.
#[derive(Debug, Clone)]
pub enum ForEachOutcome {
    /// `sequential` / `parallel`: one value per item, in input order.
    Values(Vec<Value>),
    /// `race`: the first iteration to complete successfully.
    Race { index: usize, item: Value, value: Value },
    /// `allSettled`: every iteration's fulfilled/rejected outcome.
    AllSettled(Vec<IterationOutcome>),
}

#[derive(Debug, Clone)]
pub enum IterationOutcome {
    Fulfilled { index: usize, value: Value },
    Rejected { index: usize, error: String },
}

/// Coerces a resolved `forEach.items` value into an array: accepts a bare
/// array, or a wrapped tool-response payload shaped like
/// `{content: [{text: "<json array>"}]}` — a small accommodation for LLM
/// tool outputs that stringify their array inside a content block.
pub fn coerce_items(value: &Value) -> Option<Vec<Value>> {
    if let Value::Array(items) = value {
        return Some(items.clone());
    }

    let text = value.get("content")?.as_array()?.first()?.get("text")?.as_str()?;
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Array(items)) => Some(items),
        _ => None,
    }
}

/// Runs `iteration` over `items` according to `mode`. `items` is first
/// truncated to `max_iterations`, logging a warning if anything was dropped.
pub async fn run_foreach<F, Fut>(
    items: &[Value],
    mode: ForEachMode,
    max_concurrency: Option<usize>,
    max_iterations: u32,
    iteration: F,
) -> Result<ForEachOutcome, ExecutorError>
where
    F: Fn(usize, Value) -> Fut + Sync,
    Fut: Future<Output = Result<Value, ExecutorError>>,
{
    let cap = max_iterations as usize;
    let items = if items.len() > cap {
        warn!(total = items.len(), cap, "forEach items exceed max_iterations, truncating");
        &items[..cap]
    } else {
        items
    };

    match mode {
        ForEachMode::Sequential => run_sequential(items, iteration).await,
        ForEachMode::Parallel => run_parallel(items, max_concurrency, iteration).await,
        ForEachMode::Race => run_race(items, iteration).await,
        ForEachMode::AllSettled => run_all_settled(items, max_concurrency, iteration).await,
    }
}

async fn run_sequential<F, Fut>(items: &[Value], iteration: F) -> Result<ForEachOutcome, ExecutorError>
where
    F: Fn(usize, Value) -> Fut,
    Fut: Future<Output = Result<Value, ExecutorError>>,
{
    let mut out = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        out.push(iteration(index, item.clone()).await?);
    }
    Ok(ForEachOutcome::Values(out))
}

/// Bounded concurrency via `buffer_unordered`; results are re-sorted by
/// index afterward so output order matches input order regardless of
/// completion order.
async fn run_parallel<F, Fut>(
    items: &[Value],
    max_concurrency: Option<usize>,
    iteration: F,
) -> Result<ForEachOutcome, ExecutorError>
where
    F: Fn(usize, Value) -> Fut + Sync,
    Fut: Future<Output = Result<Value, ExecutorError>>,
{
    let limit = max_concurrency.unwrap_or(items.len()).max(1);

    let mut results: Vec<(usize, Result<Value, ExecutorError>)> = futures::stream::iter(items.iter().cloned().enumerate())
        .map(|(index, item)| {
            let iteration = &iteration;
            async move { (index, iteration(index, item).await) }
        })
        .buffer_unordered(limit)
        .collect()
        .await;

    results.sort_by_key(|(index, _)| *index);

    let mut out = Vec::with_capacity(results.len());
    for (_, result) in results {
        out.push(result?);
    }
    Ok(ForEachOutcome::Values(out))
}

async fn run_race<F, Fut>(items: &[Value], iteration: F) -> Result<ForEachOutcome, ExecutorError>
where
    F: Fn(usize, Value) -> Fut + Sync,
    Fut: Future<Output = Result<Value, ExecutorError>>,
{
    let mut pending: FuturesUnordered<_> = items
        .iter()
        .cloned()
        .enumerate()
        .map(|(index, item)| {
            let item_for_output = item.clone();
            async move { (index, item_for_output, iteration(index, item).await) }
        })
        .collect();

    let mut last_error = None;
    while let Some((index, item, result)) = pending.next().await {
        match result {
            Ok(value) => return Ok(ForEachOutcome::Race { index, item, value }),
            Err(e) => last_error = Some(e),
        }
    }

    Err(last_error.unwrap_or_else(|| ExecutorError::FatalStep("forEach race had no iterations".into())))
}

async fn run_all_settled<F, Fut>(
    items: &[Value],
    max_concurrency: Option<usize>,
    iteration: F,
) -> Result<ForEachOutcome, ExecutorError>
where
    F: Fn(usize, Value) -> Fut + Sync,
    Fut: Future<Output = Result<Value, ExecutorError>>,
{
    let limit = max_concurrency.unwrap_or(items.len()).max(1);

    let mut results: Vec<(usize, IterationOutcome)> = futures::stream::iter(items.iter().cloned().enumerate())
        .map(|(index, item)| {
            let iteration = &iteration;
            async move {
                let outcome = match iteration(index, item).await {
                    Ok(value) => IterationOutcome::Fulfilled { index, value },
                    Err(e) => IterationOutcome::Rejected {
                        index,
                        error: e.to_string(),
                    },
                };
                (index, outcome)
            }
        })
        .buffer_unordered(limit)
        .collect()
        .await;

    results.sort_by_key(|(index, _)| *index);
    Ok(ForEachOutcome::AllSettled(
        results.into_iter().map(|(_, outcome)| outcome).collect(),
    ))
}
