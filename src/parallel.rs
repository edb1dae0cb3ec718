use crate::importer::ChatRecord;
use crate::pipeline::{ConversationPipeline, Rendered};
use crossbeam_channel::{SendTimeoutError, bounded, unbounded};
use eyre::{Report, Result};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

/// Render `records` on `jobs` worker threads.
///
/// Results come back in input order. The first fatal error stops every
/// worker and is returned; conversations still queued are never rendered.
pub fn render_all(
    pipeline: &ConversationPipeline<'_>,
    records: Vec<ChatRecord>,
    jobs: usize,
) -> Result<Vec<Option<Rendered>>> {
    let total = records.len();
    let (tx, rx) = bounded::<(usize, ChatRecord)>(jobs * 4);
    let (done_tx, done_rx) = unbounded::<(usize, Option<Rendered>)>();
    let should_stop = AtomicBool::new(false);
    let first_error: Mutex<Option<Report>> = Mutex::new(None);

    std::thread::scope(|s| {
        for worker in 0..jobs {
            let rx = rx.clone();
            let done_tx = done_tx.clone();
            let (should_stop, first_error) = (&should_stop, &first_error);

            s.spawn(move || {
                while let Ok((idx, record)) = rx.recv() {
                    if should_stop.load(Ordering::Relaxed) {
                        break;
                    }
                    match pipeline.render(record) {
                        Ok(rendered) => {
                            if done_tx.send((idx, rendered)).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            should_stop.store(true, Ordering::Relaxed);
                            let mut slot = first_error.lock().unwrap_or_else(|p| p.into_inner());
                            if slot.is_none() {
                                *slot = Some(e);
                            }
                            break;
                        }
                    }
                }
                debug!(worker, "render worker finished");
            });
        }

        drop(rx);
        drop(done_tx);

        'outer: for item in records.into_iter().enumerate() {
            let mut pending = item;
            loop {
                if should_stop.load(Ordering::Relaxed) {
                    break 'outer;
                }
                match tx.send_timeout(pending, Duration::from_millis(50)) {
                    Ok(()) => break,
                    Err(SendTimeoutError::Disconnected(_)) => break 'outer,
                    Err(SendTimeoutError::Timeout(r)) => pending = r,
                }
            }
        }

        drop(tx);
    });

    if let Some(e) = first_error.into_inner().unwrap_or_else(|p| p.into_inner()) {
        return Err(e);
    }

    let mut slots: Vec<Option<Rendered>> = (0..total).map(|_| None).collect();
    for (idx, rendered) in done_rx.iter() {
        slots[idx] = rendered;
    }
    Ok(slots)
}
