/* Identifier allocator (spec §4.D): assigns/retires 8-bit identifiers and maintains
 * the ordered membership list broadcast to peers. Owned exclusively by the dispatch
 * worker; no synchronization needed. */

use crate::constants::{HUB_ID, MAX_REGISTERED_DEVICES, N_UNIQUE_DEVICE_IDS, UNASSIGNED};
use crate::queue::OutgoingQueues;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterResult {
    Assigned,
    AlreadyRegistered,
    Full,
}

pub struct Allocator {
    is_assigned: [bool; N_UNIQUE_DEVICE_IDS],
    assigned_ids: Vec<u8>,
    cursor: u8,
    registrations_changed: bool,
}

impl Allocator {
    pub fn new() -> Self {
        Self {
            is_assigned: [false; N_UNIQUE_DEVICE_IDS],
            assigned_ids: Vec::with_capacity(MAX_REGISTERED_DEVICES),
            cursor: 1,
            registrations_changed: false,
        }
    }

    pub fn n_registered(&self) -> usize {
        self.assigned_ids.len()
    }

    pub fn is_assigned(&self, id: u8) -> bool {
        id != HUB_ID && self.is_assigned[id as usize]
    }

    /// The current membership list, in arbitrary (insertion) order.
    pub fn assigned_ids(&self) -> &[u8] {
        &self.assigned_ids
    }

    /// Assign `device_id` an identifier if it does not already have one.
    pub fn register(&mut self, device_id: &mut u8) -> RegisterResult {
        if *device_id != UNASSIGNED {
            return RegisterResult::AlreadyRegistered;
        }
        if self.assigned_ids.len() == MAX_REGISTERED_DEVICES {
            return RegisterResult::Full;
        }

        let id = self.cursor;
        *device_id = id;
        self.is_assigned[id as usize] = true;
        self.assigned_ids.push(id);

        self.advance_cursor();
        self.registrations_changed = true;
        RegisterResult::Assigned
    }

    /// Retire `device_id`'s identifier, clearing its outgoing queue.
    pub fn unregister(&mut self, device_id: &mut u8, queues: &mut OutgoingQueues) {
        if *device_id == UNASSIGNED {
            return;
        }

        queues.clear(*device_id);

        if let Some(pos) = self.assigned_ids.iter().position(|&id| id == *device_id) {
            self.assigned_ids.swap_remove(pos);
        }
        self.is_assigned[*device_id as usize] = false;
        *device_id = UNASSIGNED;
        self.registrations_changed = true;
    }

    /// Cursor advances modulo 255, skipping HUB_ID and any currently-assigned id.
    fn advance_cursor(&mut self) {
        loop {
            self.cursor = (self.cursor + 1) % (N_UNIQUE_DEVICE_IDS as u8);
            if self.cursor != 0 && !self.is_assigned[self.cursor as usize] {
                break;
            }
            if self.cursor == 0 {
                // 0 is legal on the wire but the allocator never hands it out.
                continue;
            }
        }
    }

    /// Returns and clears the "membership changed since last broadcast" flag.
    pub fn take_registrations_changed(&mut self) -> bool {
        std::mem::replace(&mut self.registrations_changed, false)
    }
}

impl Default for Allocator {
    fn default() -> Self {
        Self::new()
    }
}
