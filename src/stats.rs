/* Observability (spec §4.J): verbosity bitmask, per-pair message counters, and the
 * periodic stats print. Reported through `tracing`, gated per-category by an
 * `EnvFilter` built from the bitmask at start-up (see `main::init_logging`), so the
 * category split the spec describes maps onto ordinary target-based log filtering. */

use std::collections::HashMap;

use tracing::{debug, info};

use crate::clock::Clock;

pub const STATS_INTERVAL_MS: u64 = 5000;

/// Verbosity categories from the `-v<N>` bitmask (§6).
#[derive(Debug, Clone, Copy, Default)]
pub struct Verbosity {
    pub basic: bool,
    pub stats: bool,
    pub hub: bool,
    pub device: bool,
    pub discard: bool,
}

impl Verbosity {
    /// Decode a bitmask `{basic=1, stats=2, hub=4, device=8, discard=16}`.
    pub fn from_bits(bits: u8) -> Self {
        Self {
            basic: bits & 0x01 != 0,
            stats: bits & 0x02 != 0,
            hub: bits & 0x04 != 0,
            device: bits & 0x08 != 0,
            discard: bits & 0x10 != 0,
        }
    }

    /// An `EnvFilter` directive string turning each category into a `tracing`
    /// target filter, e.g. `"hub::stats=info,hub::traffic::device=info"`.
    pub fn filter_directives(&self) -> String {
        let mut directives = vec!["raw_hid_hub=warn".to_string()];
        if self.basic {
            directives.push("hub::basic=info".to_string());
        }
        if self.stats {
            directives.push("hub::stats=info".to_string());
        }
        if self.hub {
            directives.push("hub::traffic::hub=info".to_string());
        }
        if self.device {
            directives.push("hub::traffic::device=info".to_string());
        }
        if self.discard {
            directives.push("hub::discard=info".to_string());
        }
        directives.join(",")
    }
}

/// Message counters keyed by (origin, destination), reset each stats interval.
pub struct Stats {
    counts: HashMap<(u8, u8), u64>,
    iterations: u64,
    last_print_ms: u64,
}

impl Stats {
    pub fn new(clock: &Clock) -> Self {
        Self {
            counts: HashMap::new(),
            iterations: 0,
            last_print_ms: clock.now_ms(),
        }
    }

    pub fn record(&mut self, origin: u8, destination: u8) {
        *self.counts.entry((origin, destination)).or_insert(0) += 1;
    }

    pub fn record_iteration(&mut self) {
        self.iterations += 1;
    }

    /// Print and reset counters if at least `STATS_INTERVAL_MS` have elapsed.
    pub fn maybe_print(&mut self, clock: &Clock, verbosity: Verbosity, n_registered: usize) {
        self.maybe_print_every(clock, verbosity, n_registered, STATS_INTERVAL_MS)
    }

    fn maybe_print_every(
        &mut self,
        clock: &Clock,
        verbosity: Verbosity,
        n_registered: usize,
        interval_ms: u64,
    ) {
        let now = clock.now_ms();
        if now.saturating_sub(self.last_print_ms) < interval_ms {
            return;
        }

        let elapsed_s = (now - self.last_print_ms).max(1) as f64 / 1000.0;
        let rate = self.iterations as f64 / elapsed_s;

        if verbosity.stats {
            info!(target: "hub::stats", "main loop: {:.0} iterations/s, {} registered", rate, n_registered);
            for (&(origin, destination), &count) in &self.counts {
                info!(
                    target: "hub::stats",
                    "{:3} -> {:3}: {} message(s)", origin, destination, count
                );
            }
        } else {
            debug!(target: "hub::stats", "main loop: {:.0} iterations/s ({} pairs)", rate, self.counts.len());
        }

        self.counts.clear();
        self.iterations = 0;
        self.last_print_ms = now;
    }
}
