/* Discovery worker (spec §4.H): periodically enumerates HID endpoints, opens
 * sessions for newly-seen raw-HID devices, and tells the dispatch worker about
 * devices that have vanished. Runs as its own `tokio` task; never touches the
 * dispatch worker's session table directly (see `registry.rs`). */

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::registry::{DiscoveryEvent, Retired};
use crate::transport::HidTransport;

const SCAN_INTERVAL: Duration = Duration::from_secs(1);

/// Whether a known path is waiting for dispatch to acknowledge its removal
/// (the "unregister-requested" half of the two-phase retirement handshake).
struct Known {
    pending_removal: bool,
}

pub async fn run(
    mut transport: HidTransport,
    events_tx: mpsc::UnboundedSender<DiscoveryEvent>,
    mut retired_rx: mpsc::UnboundedReceiver<Retired>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut known: HashMap<PathBuf, Known> = HashMap::new();

    loop {
        if *shutdown.borrow() {
            break;
        }

        while let Ok(retired) = retired_rx.try_recv() {
            known.remove(&retired.path);
        }

        let endpoints = match tokio::task::block_in_place(|| transport.enumerate()) {
            Ok(endpoints) => endpoints,
            Err(e) => {
                warn!("HID enumeration failed: {e:#}");
                Vec::new()
            }
        };

        let mut seen: HashSet<PathBuf> = HashSet::new();
        for endpoint in endpoints.into_iter().filter(|e| e.is_raw_hid()) {
            match known.get(&endpoint.path) {
                Some(Known {
                    pending_removal: false,
                }) => {
                    seen.insert(endpoint.path);
                }
                // Either genuinely new, or the old generation is still
                // waiting on an unacknowledged removal; either way a fresh
                // enumeration hit means we should (re-)open it.
                _ => match tokio::task::block_in_place(|| transport.open(&endpoint.path)) {
                    Ok(session) => {
                        info!(
                            "opened raw-HID endpoint {} ({})",
                            endpoint.path.display(),
                            endpoint.product_string.as_deref().unwrap_or("unknown device")
                        );
                        known.insert(
                            endpoint.path.clone(),
                            Known {
                                pending_removal: false,
                            },
                        );
                        seen.insert(endpoint.path.clone());
                        let _ = events_tx.send(DiscoveryEvent::Appeared {
                            path: endpoint.path,
                            io: Box::new(session),
                        });
                    }
                    Err(e) => {
                        debug!("failed to open {}: {e:#}", endpoint.path.display());
                    }
                },
            }
        }

        for (path, state) in known.iter_mut() {
            if seen.contains(path) || state.pending_removal {
                continue;
            }
            state.pending_removal = true;
            let _ = events_tx.send(DiscoveryEvent::Vanished { path: path.clone() });
        }

        tokio::select! {
            _ = tokio::time::sleep(SCAN_INTERVAL) => {}
            _ = shutdown.changed() => {}
        }
    }
}
