/* Dispatch worker (spec §4.G): the main loop. Owns every session, the
 * identifier allocator, the outgoing queues, and the stats counters -- nothing
 * here is shared with the discovery worker except the two event channels. */

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::warn;

use crate::allocator::Allocator;
use crate::clock::Clock;
use crate::constants::UNASSIGNED;
use crate::protocol::{build_membership_report, handle_inbound, shutdown_report};
use crate::queue::OutgoingQueues;
use crate::registry::{DiscoveryEvent, Retired, Session};
use crate::stats::{Stats, Verbosity};

/// Below this much quiet time, don't sleep at all between passes (§5).
const IDLE_GRACE_MS: u64 = 150;
/// Sleep quantum once idle.
const SLEEP_QUANTUM: Duration = Duration::from_millis(2);

pub async fn run(
    mut events_rx: mpsc::UnboundedReceiver<DiscoveryEvent>,
    retired_tx: mpsc::UnboundedSender<Retired>,
    shutdown: watch::Receiver<bool>,
    verbosity: Verbosity,
    clock: Clock,
) {
    let mut sessions: HashMap<PathBuf, Session> = HashMap::new();
    let mut allocator = Allocator::new();
    let mut queues = OutgoingQueues::new();
    let mut stats = Stats::new(&clock);
    let mut last_message_time_ms = clock.now_ms();

    loop {
        drain_discovery_events(&mut events_rx, &mut sessions, &mut allocator, &mut queues, &retired_tx);

        let now = clock.now_ms();
        for session in sessions.values_mut() {
            loop {
                match session.io.read_report() {
                    Ok(Some(report)) => handle_inbound(
                        &report,
                        session,
                        &mut allocator,
                        &mut queues,
                        &mut stats,
                        verbosity,
                        &mut last_message_time_ms,
                        now,
                    ),
                    Ok(None) => break,
                    Err(e) => {
                        // §7: a read failure is treated as zero bytes this
                        // pass; the next discovery scan will notice the
                        // device is gone and retire it.
                        warn!("read failed on {}: {e:#}", session.path().display());
                        break;
                    }
                }
            }
        }

        if allocator.take_registrations_changed() {
            let recipients: Vec<u8> = allocator.assigned_ids().to_vec();
            for recipient in recipients {
                let report = build_membership_report(&allocator, recipient);
                queues.push(recipient, report);
            }
        }

        for session in sessions.values_mut() {
            if session.device_id == UNASSIGNED {
                continue;
            }
            while let Some(report) = queues.pop(session.device_id) {
                if let Err(e) = session.io.write_report(&report) {
                    warn!("write failed on {}: {e:#}", session.path().display());
                    break;
                }
            }
        }

        stats.record_iteration();
        stats.maybe_print(&clock, verbosity, allocator.n_registered());

        if *shutdown.borrow() {
            break;
        }

        if now.saturating_sub(last_message_time_ms) > IDLE_GRACE_MS {
            tokio::time::sleep(SLEEP_QUANTUM).await;
        } else {
            tokio::task::yield_now().await;
        }
    }

    shutdown_all(&sessions);
}

fn drain_discovery_events(
    events_rx: &mut mpsc::UnboundedReceiver<DiscoveryEvent>,
    sessions: &mut HashMap<PathBuf, Session>,
    allocator: &mut Allocator,
    queues: &mut OutgoingQueues,
    retired_tx: &mpsc::UnboundedSender<Retired>,
) {
    while let Ok(event) = events_rx.try_recv() {
        match event {
            DiscoveryEvent::Appeared { path, io } => {
                sessions.insert(path, Session::new(io));
            }
            DiscoveryEvent::Vanished { path } => {
                if let Some(mut session) = sessions.remove(&path) {
                    allocator.unregister(&mut session.device_id, queues);
                }
                let _ = retired_tx.send(Retired { path });
            }
        }
    }
}

/// §4.F shutdown broadcast: one report to every registered session, no ack awaited.
fn shutdown_all(sessions: &HashMap<PathBuf, Session>) {
    let report = shutdown_report();
    for session in sessions.values() {
        if session.device_id != UNASSIGNED {
            let _ = session.io.write_report(&report);
        }
    }
}
