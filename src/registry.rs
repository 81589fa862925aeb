/* Session registry (spec §4.C).
 *
 * The spec describes a lock-free singly-linked list so the discovery worker can
 * insert/retire sessions while the dispatch worker concurrently walks it. This is
 * one of the two "equally admissible" substrates from §9 Design Notes; we take the
 * other: a dense table owned exclusively by the dispatch worker, mutated only by
 * messages the discovery worker sends it. Ownership of each `Session` (and the HID
 * handle inside it) transfers from discovery to dispatch exactly once, by value,
 * through an `mpsc` channel -- "share memory by communicating" instead of sharing
 * a linked list. The two-phase retirement handshake from §5/§9 is preserved as the
 * Appeared/Vanished/Retired protocol below; see DESIGN.md for the full writeup. */

use std::path::{Path, PathBuf};

use crate::constants::UNASSIGNED;
use crate::transport::HidIo;

/// One open raw-HID endpoint, as seen by the dispatch worker.
pub struct Session {
    pub io: Box<dyn HidIo>,
    pub device_id: u8,
}

impl Session {
    pub fn new(io: Box<dyn HidIo>) -> Self {
        Self {
            io,
            device_id: UNASSIGNED,
        }
    }

    pub fn path(&self) -> &Path {
        self.io.path()
    }
}

/// Sent from the discovery worker to the dispatch worker.
pub enum DiscoveryEvent {
    /// A new endpoint was opened and should be tracked.
    Appeared { path: PathBuf, io: Box<dyn HidIo> },
    /// An endpoint enumeration no longer reports. Dispatch should unregister
    /// it (if registered) and drop it at the next pass (§4.H two-phase
    /// retirement: this is the "unregister-requested" half).
    Vanished { path: PathBuf },
}

/// Sent from the dispatch worker back to the discovery worker once a
/// `Vanished` session has actually been unregistered and dropped -- the
/// "delete-acknowledged" half of the handshake. The discovery worker uses
/// this to know it is safe to forget the path and treat its reappearance as
/// a brand new session.
pub struct Retired {
    pub path: PathBuf,
}
