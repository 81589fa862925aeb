/* raw-hid-hub: user-space rendezvous for QMK raw-HID peripherals.
 *
 * Two tokio tasks cooperate: the discovery worker (§4.H) periodically
 * enumerates HID endpoints and hands newly-opened sessions to the dispatch
 * worker (§4.G), which holds every session, the identifier table, and the
 * outgoing queues, and performs the hub protocol (§4.F). See registry.rs for
 * why this uses channels instead of a lock-free linked list. */

mod allocator;
mod clock;
mod constants;
mod dispatch;
mod discovery;
mod protocol;
mod queue;
mod registry;
mod stats;
mod transport;

use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use clock::Clock;
use stats::Verbosity;
use transport::HidTransport;

/// Parse the single `-v<N>` flag (§6). Missing or malformed ⇒ silent (verbosity 0).
fn parse_verbosity(args: impl Iterator<Item = String>) -> Verbosity {
    for arg in args {
        if let Some(digits) = arg.strip_prefix("-v") {
            if let Ok(bits) = digits.parse::<u8>() {
                if bits <= 31 {
                    return Verbosity::from_bits(bits);
                }
            }
            return Verbosity::from_bits(0);
        }
    }
    Verbosity::from_bits(0)
}

fn init_logging(verbosity: Verbosity) {
    let filter = EnvFilter::try_new(verbosity.filter_directives()).unwrap_or_default();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() {
    let verbosity = parse_verbosity(std::env::args().skip(1));
    init_logging(verbosity);

    // §7: transport init failure is fatal, with no diagnostic output -- some
    // backends are unstable if anything touches stdout/stderr before init
    // completes, so this is matched explicitly instead of let-else/`?`
    // propagating up through `#[tokio::main]`'s `Termination` impl, which
    // would print the error's Debug chain before exiting.
    let transport = match HidTransport::init() {
        Ok(transport) => transport,
        Err(_) => std::process::exit(1),
    };

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (retired_tx, retired_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    info!("raw-hid-hub starting");

    let discovery_shutdown = shutdown_rx.clone();
    let discovery_handle = tokio::spawn(discovery::run(
        transport,
        events_tx,
        retired_rx,
        discovery_shutdown,
    ));

    let dispatch_handle = tokio::spawn(dispatch::run(
        events_rx,
        retired_tx,
        shutdown_rx,
        verbosity,
        Clock::new(),
    ));

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    if let Err(e) = dispatch_handle.await {
        error!("dispatch worker panicked: {e}");
    }
    if let Err(e) = discovery_handle.await {
        error!("discovery worker panicked: {e}");
    }

    info!("raw-hid-hub exiting");
}

/// Waits for SIGINT/SIGTERM (or Ctrl-C on platforms without unix signals).
#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");

    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_flag_is_silent() {
        let v = parse_verbosity(std::iter::empty());
        assert!(!v.basic && !v.stats && !v.hub && !v.device && !v.discard);
    }

    #[test]
    fn malformed_flag_is_silent() {
        let v = parse_verbosity(["raw-hid-hub".to_string(), "-vnope".to_string()].into_iter());
        assert!(!v.basic);
    }

    #[test]
    fn out_of_range_flag_is_silent() {
        let v = parse_verbosity(["-v99".to_string()].into_iter());
        assert!(!v.basic);
    }

    #[test]
    fn valid_flag_decodes_bitmask() {
        let v = parse_verbosity(["-v7".to_string()].into_iter());
        assert!(v.basic && v.stats && v.hub && !v.device);
    }
}
