//! Transfer scheduler
//!
//! Dispatches planned work items over a fixed pool of connections. Items
//! are claimed from a shared queue, so completion order across workers is
//! intentionally unordered; only the set of completed items and the final
//! byte total are deterministic. Each item is retried once before the
//! whole session fails.

use crate::error::{Error, Result};
use crate::logger::Logger;
use crate::plan::WorkItem;
use crate::progress::Progress;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::thread;

/// Bounded copy chunk: caps per-worker memory no matter how large a
/// single item is.
pub const CHUNK_SIZE: usize = 8 * 1024 * 1024;

struct Shared {
    queue: Mutex<VecDeque<WorkItem>>,
    failure: Mutex<Option<Error>>,
}

impl Shared {
    fn claim(&self) -> Option<WorkItem> {
        if self.failure.lock().is_some() {
            return None;
        }
        self.queue.lock().pop_front()
    }

    fn fail(&self, err: Error) {
        let mut failure = self.failure.lock();
        // First failure wins; later ones raced with the shutdown.
        if failure.is_none() {
            *failure = Some(err);
        }
    }
}

/// Run `items` on up to `connections` workers, each owning one transport
/// connection from `connect`. `run_item` performs a single item on a
/// connection; progress is reported exactly once per completed item.
pub fn run_items<C: Send>(
    items: Vec<WorkItem>,
    connections: usize,
    connect: impl Fn() -> Result<C> + Send + Sync,
    run_item: impl Fn(&mut C, &WorkItem) -> Result<()> + Send + Sync,
    progress: &Progress,
    logger: &dyn Logger,
) -> Result<()> {
    if items.is_empty() {
        return Ok(());
    }
    let workers = connections.clamp(1, items.len());
    let shared = Shared {
        queue: Mutex::new(items.into()),
        failure: Mutex::new(None),
    };

    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| worker(&shared, &connect, &run_item, progress, logger));
        }
    });

    match shared.failure.into_inner() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn worker<C>(
    shared: &Shared,
    connect: &(impl Fn() -> Result<C> + Send + Sync),
    run_item: &(impl Fn(&mut C, &WorkItem) -> Result<()> + Send + Sync),
    progress: &Progress,
    logger: &dyn Logger,
) {
    let mut conn = match connect() {
        Ok(conn) => conn,
        Err(err) => {
            shared.fail(err);
            return;
        }
    };

    while let Some(item) = shared.claim() {
        if let Err(err) = run_with_retry(&mut conn, &item, connect, run_item, logger) {
            logger.error("transfer", &err.to_string());
            shared.fail(err);
            return;
        }
        progress.update(item.length);
        logger.item_done(action_name(&item), item.offset, item.length);
    }
}

fn run_with_retry<C>(
    conn: &mut C,
    item: &WorkItem,
    connect: &impl Fn() -> Result<C>,
    run_item: &impl Fn(&mut C, &WorkItem) -> Result<()>,
    logger: &dyn Logger,
) -> Result<()> {
    let first = match run_item(conn, item) {
        Ok(()) => return Ok(()),
        Err(err) => err,
    };
    logger.retry(item.offset, item.length, &first.to_string());

    // The transport may be dead after a mid-item failure; reopen it for
    // the one retry this item gets.
    match connect() {
        Ok(fresh) => *conn = fresh,
        Err(err) => return Err(transfer_error(item, err)),
    }
    run_item(conn, item).map_err(|err| transfer_error(item, err))
}

fn transfer_error(item: &WorkItem, err: Error) -> Error {
    Error::Transfer {
        offset: item.offset,
        length: item.length,
        reason: err.to_string(),
    }
}

fn action_name(item: &WorkItem) -> &'static str {
    match item.action {
        crate::plan::Action::CopyData => "copy",
        crate::plan::Action::WriteZero => "zero",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::NoopLogger;
    use crate::plan::Action;
    use crate::progress::FnSink;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn items(n: u64, length: u64) -> Vec<WorkItem> {
        (0..n)
            .map(|i| WorkItem {
                offset: i * length,
                length,
                action: Action::CopyData,
            })
            .collect()
    }

    #[test]
    fn every_item_runs_exactly_once() {
        let executed = Mutex::new(Vec::new());
        let progress = Progress::new(None);

        run_items(
            items(50, 4096),
            4,
            || Ok(()),
            |_conn, item| {
                executed.lock().push(item.offset);
                Ok(())
            },
            &progress,
            &NoopLogger,
        )
        .unwrap();

        let mut offsets = executed.into_inner();
        offsets.sort_unstable();
        let expected: Vec<u64> = (0..50).map(|i| i * 4096).collect();
        assert_eq!(offsets, expected);
        assert_eq!(progress.transferred(), 50 * 4096);
    }

    #[test]
    fn progress_deltas_match_item_lengths_as_multiset() {
        let work = vec![
            WorkItem { offset: 0, length: 4096, action: Action::CopyData },
            WorkItem { offset: 4096, length: 28672, action: Action::WriteZero },
            WorkItem { offset: 32768, length: 4096, action: Action::CopyData },
            WorkItem { offset: 36864, length: 28672, action: Action::WriteZero },
        ];
        let total: u64 = work.iter().map(|i| i.length).sum();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let progress = Progress::new(Some(Box::new(FnSink(move |n| {
            sink_seen.lock().push(n);
        }))));

        run_items(
            work,
            4,
            || Ok(()),
            |_conn, _item| Ok(()),
            &progress,
            &NoopLogger,
        )
        .unwrap();

        let mut deltas = seen.lock().clone();
        deltas.sort_unstable();
        assert_eq!(deltas, vec![4096, 4096, 28672, 28672]);
        assert_eq!(progress.transferred(), total);
    }

    #[test]
    fn single_failure_is_retried_on_a_fresh_connection() {
        let attempts = Mutex::new(HashMap::<u64, u32>::new());
        let connects = AtomicUsize::new(0);
        let progress = Progress::new(None);

        run_items(
            items(10, 1024),
            2,
            || {
                connects.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            |_conn, item| {
                let mut attempts = attempts.lock();
                let count = attempts.entry(item.offset).or_insert(0);
                *count += 1;
                // Item at offset 0 fails its first attempt only.
                if item.offset == 0 && *count == 1 {
                    Err(Error::protocol("flaky"))
                } else {
                    Ok(())
                }
            },
            &progress,
            &NoopLogger,
        )
        .unwrap();

        assert_eq!(attempts.into_inner()[&0], 2);
        assert_eq!(progress.transferred(), 10 * 1024);
        // Two workers plus one reconnect for the retry.
        assert_eq!(connects.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn second_failure_fails_the_session_with_item_position() {
        let progress = Progress::new(None);
        let err = run_items(
            items(10, 1024),
            2,
            || Ok(()),
            |_conn, item| {
                if item.offset == 2048 {
                    Err(Error::protocol("broken"))
                } else {
                    Ok(())
                }
            },
            &progress,
            &NoopLogger,
        )
        .unwrap_err();

        match err {
            Error::Transfer { offset, length, .. } => {
                assert_eq!(offset, 2048);
                assert_eq!(length, 1024);
            }
            other => panic!("expected Transfer error, got {other:?}"),
        }
    }

    #[test]
    fn in_flight_never_exceeds_connection_count() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let progress = Progress::new(None);

        run_items(
            items(40, 512),
            3,
            || Ok(()),
            |_conn, _item| {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_millis(1));
                current.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            },
            &progress,
            &NoopLogger,
        )
        .unwrap();

        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn failed_connect_fails_the_session() {
        let progress = Progress::new(None);
        let result = run_items(
            items(4, 512),
            2,
            || -> Result<()> {
                Err(Error::EndpointUnreachable {
                    reason: "refused".into(),
                })
            },
            |_conn, _item| Ok(()),
            &progress,
            &NoopLogger,
        );
        assert!(result.is_err());
    }
}
