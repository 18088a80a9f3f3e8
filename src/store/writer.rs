use std::io;

use tokio::sync::{mpsc, oneshot};

use crate::model::Record;
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        records: Vec<Record>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Control(Control),
}

/// Everything the writer handles between batches.
pub(super) enum Control {
    Compact {
        entries: Vec<Vec<Record>>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
    /// Stop accepting commands and exit once acknowledged.
    Shutdown {
        response: oneshot::Sender<()>,
    },
}

type Pending = (Vec<Record>, oneshot::Sender<io::Result<()>>);

/// Owns the WAL file. Every append that is already queued when the writer
/// wakes joins one batch, and the whole batch shares a single fsync.
/// Control commands are handled between batches, never inside one.
///
/// A failed batch stops the writer for good. Callers whose units were in
/// that batch may already be gone and cannot undo them in memory, so no
/// later unit may reach the log on top of that state; a restart replays
/// the log as it stands.
pub(super) async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let control = match cmd {
            WalCommand::Append { records, response } => {
                let mut batch = vec![(records, response)];
                let interrupted = drain_appends(&mut rx, &mut batch);
                if commit_batch(&mut wal, &mut batch).is_err() {
                    tracing::error!("WAL writer stopped after a failed flush; restart to recover");
                    return;
                }
                interrupted
            }
            WalCommand::Control(control) => Some(control),
        };

        if let Some(control) = control
            && let Some(ack) = handle_control(&mut wal, control)
        {
            // Anything still queued is dropped, and its callers see the
            // writer as gone.
            rx.close();
            drop(rx);
            let _ = ack.send(());
            tracing::info!("WAL writer stopped");
            return;
        }
    }
}

/// Pull queued appends into `batch` without waiting. Returns the first
/// queued control command, if any.
fn drain_appends(rx: &mut mpsc::Receiver<WalCommand>, batch: &mut Vec<Pending>) -> Option<Control> {
    while let Ok(cmd) = rx.try_recv() {
        match cmd {
            WalCommand::Append { records, response } => batch.push((records, response)),
            WalCommand::Control(control) => return Some(control),
        }
    }
    None
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<Pending>) -> io::Result<()> {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(ref e) = result {
        tracing::error!("WAL flush failed for {} units: {e}", batch.len());
    }
    respond_batch(batch, &result);
    result
}

fn flush_batch(wal: &mut Wal, batch: &[Pending]) -> io::Result<()> {
    let result = batch
        .iter()
        .try_for_each(|(records, _)| wal.append_buffered(records))
        .and_then(|()| wal.flush_sync());
    if result.is_err() {
        // Every caller in the batch is told it failed, so none of it may replay.
        if let Err(e) = wal.discard_unflushed() {
            tracing::error!("could not discard failed WAL batch: {e}");
        }
    }
    result
}

fn respond_batch(batch: &mut Vec<Pending>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

/// Returns the shutdown acknowledgement when the writer should stop.
fn handle_control(wal: &mut Wal, control: Control) -> Option<oneshot::Sender<()>> {
    match control {
        Control::Compact { entries, response } => {
            let result = Wal::write_compact_file(wal.path(), &entries)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
            None
        }
        Control::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
            None
        }
        Control::Shutdown { response } => Some(response),
    }
}
