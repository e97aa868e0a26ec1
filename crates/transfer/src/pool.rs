//! Bounded concurrent execution of part transfers.
//!
//! A fixed number of workers drain a shared queue of [`PartSpan`]s, running
//! a caller-supplied transfer function for each under a per-part timeout.
//! A fatal part failure (missing object or dead session) cancels dispatch
//! of the remaining queue; in-flight parts are left to finish.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::TransferError;
use crate::plan::PartSpan;

/// Outcome of one part's single attempt in this pool run.
#[derive(Debug)]
pub struct PartResult {
    pub number: u32,
    pub result: Result<(), TransferError>,
}

/// Runs `transfer` over `parts` with at most `workers` in flight.
///
/// Returns one result per dispatched part, sorted by part number. Parts
/// never dispatched because of cancellation produce no result; callers
/// detect them by comparing against the input set.
pub async fn run_parts<F, Fut>(
    parts: Vec<PartSpan>,
    workers: usize,
    part_timeout: Duration,
    cancel: &CancellationToken,
    transfer: F,
) -> Vec<PartResult>
where
    F: Fn(PartSpan) -> Fut,
    Fut: Future<Output = Result<(), TransferError>>,
{
    let queue = Mutex::new(parts.into_iter().collect::<VecDeque<_>>());
    let results = Mutex::new(Vec::new());
    let workers = workers.max(1);

    let loops = (0..workers).map(|worker| {
        let queue = &queue;
        let results = &results;
        let transfer = &transfer;
        let cancel = cancel.clone();
        async move {
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                let span = match queue.lock().unwrap().pop_front() {
                    Some(span) => span,
                    None => break,
                };

                let result = match tokio::time::timeout(part_timeout, transfer(span)).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(err)) => {
                        if err.is_fatal_for_pool() {
                            warn!(part = span.number, %err, "fatal part failure, stopping dispatch");
                            cancel.cancel();
                        } else {
                            debug!(part = span.number, worker, %err, "part attempt failed");
                        }
                        Err(err)
                    }
                    Err(_) => Err(TransferError::PartTimeout {
                        number: span.number,
                        timeout: part_timeout,
                    }),
                };
                results.lock().unwrap().push(PartResult {
                    number: span.number,
                    result,
                });
            }
        }
    });

    join_all(loops).await;

    let mut results = results.into_inner().unwrap();
    results.sort_by_key(|r| r.number);
    results
}

/// Folds a pool run into a single verdict.
///
/// `Ok(())` when every part in `expected` succeeded; otherwise a
/// [`TransferError::PartsFailed`] that is retryable only if every observed
/// failure was. Undispatched parts (cancelled queue) count as failed but do
/// not make the verdict terminal on their own.
pub fn verdict(expected: usize, results: &[PartResult]) -> Result<(), TransferError> {
    let failures: Vec<&PartResult> = results.iter().filter(|r| r.result.is_err()).collect();
    let undispatched = expected.saturating_sub(results.len());
    if failures.is_empty() && undispatched == 0 {
        return Ok(());
    }

    let retryable = failures.iter().all(|r| {
        r.result
            .as_ref()
            .err()
            .map(|e| e.is_retryable())
            .unwrap_or(true)
    });
    let first = failures
        .first()
        .and_then(|r| r.result.as_ref().err())
        .map(|e| e.to_string())
        .unwrap_or_else(|| "cancelled before dispatch".into());
    Err(TransferError::PartsFailed {
        failed: failures.len() + undispatched,
        total: expected,
        first,
        retryable,
    })
}
