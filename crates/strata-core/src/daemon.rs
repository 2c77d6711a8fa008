//! In-process scheduler that keeps submitted processes moving.
//!
//! Three tasks share one cancellation token:
//!
//! - the listener turns engine events into resume requests (`Submitted` and
//!   `Waiting` re-poll the process itself, `Sealed` re-polls every chain
//!   waiting on it);
//! - the sweeper periodically re-queues everything unfinished, which is how
//!   calculation jobs get polled and how missed events are caught up;
//! - the dispatcher polls queued ids on a bounded worker pool.
//!
//! A request for an id that is already being polled marks it dirty instead
//! of starting a second worker; the running worker polls it once more.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use strata_types::event::ProcessEvent;
use strata_types::node::NodeId;
use tokio::sync::{Semaphore, broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::engine::Engine;
use crate::repository::ProvenanceRepository;

/// Handle to a running daemon. Dropping it without `shutdown` leaves the
/// tasks running until the runtime stops.
pub struct Daemon {
    queue: mpsc::UnboundedSender<NodeId>,
    cancel: CancellationToken,
    tasks: JoinSet<()>,
}

impl Daemon {
    /// Start the listener, sweeper, and dispatcher for `engine`.
    pub fn spawn<R: ProvenanceRepository + 'static>(engine: Arc<Engine<R>>) -> Self {
        let (queue, requests) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();

        // Subscribe before anything runs so no event slips past.
        let events = engine.events().subscribe();
        tasks.spawn(listen(
            Arc::clone(&engine),
            events,
            queue.clone(),
            cancel.clone(),
        ));
        tasks.spawn(sweep(Arc::clone(&engine), queue.clone(), cancel.clone()));
        tasks.spawn(dispatch(engine, requests, cancel.clone()));

        tracing::info!("daemon started");
        Self {
            queue,
            cancel,
            tasks,
        }
    }

    /// Ask the daemon to poll `process_id` soon.
    pub fn enqueue_resume(&self, process_id: NodeId) {
        let _ = self.queue.send(process_id);
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop accepting work and wait for in-flight polls to finish.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(err) = joined {
                tracing::warn!(error = %err, "daemon task ended abnormally");
            }
        }
        tracing::info!("daemon stopped");
    }
}

async fn listen<R: ProvenanceRepository + 'static>(
    engine: Arc<Engine<R>>,
    mut events: broadcast::Receiver<ProcessEvent>,
    queue: mpsc::UnboundedSender<NodeId>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(ProcessEvent::Submitted { process_id })
            | Ok(ProcessEvent::Waiting { process_id, .. }) => {
                let _ = queue.send(process_id);
            }
            Ok(ProcessEvent::Sealed { process_id, .. }) => match engine.waiters_of(process_id).await {
                Ok(waiters) => {
                    for waiter in waiters {
                        let _ = queue.send(waiter);
                    }
                }
                Err(err) => {
                    tracing::warn!(process_id = %process_id, error = %err, "could not look up waiters")
                }
            },
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                // The sweeper will pick up whatever these events were about.
                tracing::warn!(missed, "daemon listener lagged behind the event bus");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn sweep<R: ProvenanceRepository + 'static>(
    engine: Arc<Engine<R>>,
    queue: mpsc::UnboundedSender<NodeId>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(engine.config().sweep_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        match engine.unfinished().await {
            Ok(ids) => {
                tracing::trace!(count = ids.len(), "sweeping unfinished processes");
                for id in ids {
                    let _ = queue.send(id);
                }
            }
            Err(err) => tracing::warn!(error = %err, "sweep failed"),
        }
    }
}

async fn dispatch<R: ProvenanceRepository + 'static>(
    engine: Arc<Engine<R>>,
    mut requests: mpsc::UnboundedReceiver<NodeId>,
    cancel: CancellationToken,
) {
    let permits = Arc::new(Semaphore::new(engine.config().daemon_workers.max(1)));
    // id -> "poll again when done"
    let in_flight: Arc<DashMap<NodeId, bool>> = Arc::new(DashMap::new());
    let mut workers = JoinSet::new();

    loop {
        let process_id = tokio::select! {
            _ = cancel.cancelled() => break,
            Some(_) = workers.join_next(), if !workers.is_empty() => continue,
            request = requests.recv() => match request {
                Some(id) => id,
                None => break,
            },
        };

        match in_flight.entry(process_id) {
            Entry::Occupied(mut entry) => {
                entry.insert(true);
                continue;
            }
            Entry::Vacant(entry) => {
                entry.insert(false);
            }
        }

        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let engine = Arc::clone(&engine);
        let in_flight = Arc::clone(&in_flight);
        workers.spawn(async move {
            let _permit = permit;
            loop {
                match engine.poll(process_id).await {
                    Ok(status) => {
                        tracing::debug!(process_id = %process_id, status = %status, "polled")
                    }
                    Err(err) => {
                        tracing::warn!(process_id = %process_id, error = %err, "poll failed")
                    }
                }
                let again = match in_flight.entry(process_id) {
                    Entry::Occupied(mut entry) => {
                        if *entry.get() {
                            entry.insert(false);
                            true
                        } else {
                            entry.remove();
                            false
                        }
                    }
                    Entry::Vacant(_) => false,
                };
                if !again {
                    break;
                }
            }
        });
    }

    while workers.join_next().await.is_some() {}
}
