//! Large reads and writes split into quantum-sized chunks.
//!
//! With a transform active on the session, chunks are handed to a fixed set of
//! worker tasks so sealing and unsealing run in parallel; otherwise the chunks are
//! driven as a bounded set of concurrent futures on the caller's task.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use futures_util::{StreamExt, TryStreamExt, stream};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;

use crate::handle::OpenInner;
use crate::quantum::{Limits, QuantumPlan};
use crate::session::SessionInner;
use crate::{Error, Result};

/// Sizes chunks from the main channel's credit window.
///
/// Chunks themselves go out on any channel, so with several channels bound the
/// plan follows the main channel's window and not the one each chunk lands on.
fn plan(session: &SessionInner, write: bool) -> Result<QuantumPlan> {
    let main = session.main_channel()?;
    let info = session.negotiated()?;
    let limits = Limits {
        credits_max: main.connection().credits().credits_max(),
        reserve: session.engine.config.credit_reserve,
        large_mtu: info.large_mtu(),
        max_io: info.max_io(write),
    };
    let plan = main.quantum().plan(limits);
    if plan.count == 0 {
        log::debug!("Credit window has no room beyond the reserve, moving one chunk at a time");
    }
    log::trace!("Bulk {} plan: {plan:?}", if write { "write" } else { "read" });
    Ok(plan)
}

/// Read windows hold this many rounds of `plan.count` chunks.
const READ_WINDOW_ROUNDS: usize = 4;

fn range_end(offset: u64, length: u64) -> Result<u64> {
    offset.checked_add(length).ok_or_else(|| {
        Error::InvalidArgument(format!("range {offset}+{length} overflows the file offset"))
    })
}

/// Splits `[offset, end)` into chunks of at most `size` bytes, lazily.
fn chunks(offset: u64, end: u64, size: u32) -> impl Iterator<Item = (u64, u32)> {
    let size = u64::from(size.max(1));
    let mut at = offset;
    std::iter::from_fn(move || {
        if at >= end {
            return None;
        }
        let len = (end - at).min(size);
        let chunk = (at, len as u32);
        at += len;
        Some(chunk)
    })
}

/// Runs `op` over every chunk, at most `plan.count` at a time. Results come back
/// sorted by offset.
async fn run_chunks<T, F, Fut>(
    open: &Arc<OpenInner>,
    plan: QuantumPlan,
    chunks: Vec<(u64, u32)>,
    op: F,
) -> Result<Vec<(u64, T)>>
where
    T: Send + 'static,
    F: Fn(Arc<OpenInner>, u64, u32) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let session = open.share().session.clone();
    let parallel = session
        .mux
        .transform()
        .is_active(session.mux.session_id());
    // A plan with no headroom still moves one chunk; its credit request grows the window.
    let count = (plan.count as usize).max(1);

    let mut results = if parallel && chunks.len() > 1 {
        run_workers(open, count, chunks, op).await?
    } else {
        stream::iter(chunks)
            .map(|(at, len)| {
                let op = op.clone();
                let open = open.clone();
                async move { op(open, at, len).await.map(|value| (at, value)) }
            })
            .buffer_unordered(count)
            .try_collect::<Vec<_>>()
            .await?
    };
    results.sort_by_key(|(at, _)| *at);
    Ok(results)
}

async fn run_workers<T, F, Fut>(
    open: &Arc<OpenInner>,
    workers: usize,
    chunks: Vec<(u64, u32)>,
    op: F,
) -> Result<Vec<(u64, T)>>
where
    T: Send + 'static,
    F: Fn(Arc<OpenInner>, u64, u32) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let total = chunks.len();
    let (tx, rx) = mpsc::channel(total);
    for chunk in chunks {
        tx.try_send(chunk)
            .map_err(|_| Error::InvalidState("bulk work queue is full".into()))?;
    }
    drop(tx);
    let queue = Arc::new(Mutex::new(rx));

    let mut tasks = JoinSet::new();
    for worker in 0..workers.min(total) {
        let queue = queue.clone();
        let open = open.clone();
        let op = op.clone();
        tasks.spawn(async move {
            let mut done = Vec::new();
            loop {
                let next = queue.lock().await.recv().await;
                let Some((at, len)) = next else {
                    break;
                };
                done.push((at, op(open.clone(), at, len).await?));
            }
            log::trace!("Bulk worker {worker} finished {} chunks", done.len());
            Ok::<_, Error>(done)
        });
    }

    let mut results = Vec::with_capacity(total);
    while let Some(joined) = tasks.join_next().await {
        let done = joined.map_err(|e| Error::InvalidState(format!("bulk worker failed: {e}")))??;
        results.extend(done);
    }
    Ok(results)
}

fn record(session: &SessionInner, plan: QuantumPlan, bytes: u64, started: Instant, generation: u64) {
    let threshold = session.engine.config.quantum.large_transfer_threshold;
    if bytes < threshold {
        return;
    }
    if let Ok(main) = session.main_channel() {
        let reconnected = session.mux.generation() != generation;
        main.quantum()
            .record(plan.size, bytes, started.elapsed(), reconnected);
    }
}

/// Reads up to `length` bytes, stopping at the first short chunk.
///
/// Chunks go out one window at a time, so a length far past the end of the
/// file costs one window of requests and never a buffer of that size.
pub(crate) async fn read(open: &Arc<OpenInner>, offset: u64, length: u64) -> Result<Vec<u8>> {
    if length == 0 {
        return Ok(vec![]);
    }
    let end = range_end(offset, length)?;
    let session = open.share().session.clone();
    let plan = plan(&session, false)?;
    let generation = session.mux.generation();
    let started = Instant::now();

    let window = (plan.count as usize).max(1) * READ_WINDOW_ROUNDS;
    let mut pending = chunks(offset, end, plan.size);
    let mut out = Vec::new();
    'windows: loop {
        let batch: Vec<(u64, u32)> = pending.by_ref().take(window).collect();
        if batch.is_empty() {
            break;
        }
        let requested: Vec<u32> = batch.iter().map(|(_, len)| *len).collect();
        let results = run_chunks(open, plan, batch, |open, at, len| async move {
            open.read_at(at, len).await
        })
        .await?;
        for ((at, data), want) in results.into_iter().zip(requested) {
            let short = data.len() < want as usize;
            out.extend_from_slice(&data);
            if short {
                log::debug!("Short read at {at}: end of file");
                break 'windows;
            }
        }
    }
    record(&session, plan, out.len() as u64, started, generation);
    Ok(out)
}

pub(crate) async fn write(open: &Arc<OpenInner>, offset: u64, data: &[u8]) -> Result<u64> {
    if data.is_empty() {
        return Ok(0);
    }
    let session = open.share().session.clone();
    let plan = plan(&session, true)?;
    let generation = session.mux.generation();
    let started = Instant::now();

    let end = range_end(offset, data.len() as u64)?;
    let data: Arc<[u8]> = Arc::from(data);
    let chunks = chunks(offset, end, plan.size).collect();
    let results = run_chunks(open, plan, chunks, move |open, at, len| {
        let data = data.clone();
        async move {
            let start = (at - offset) as usize;
            open.write_at(at, &data[start..start + len as usize]).await
        }
    })
    .await?;

    let written: u64 = results.iter().map(|(_, n)| *n as u64).sum();
    record(&session, plan, written, started, generation);
    Ok(written)
}
