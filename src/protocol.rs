/* Protocol engine (spec §4.F): classifies inbound reports, performs register /
 * unregister / forward, and builds membership broadcasts. Pure state transitions
 * over the allocator and queues; the dispatch worker drives the I/O around it. */

use tracing::debug;

use crate::allocator::{Allocator, RegisterResult};
use crate::constants::{Report, HUB_COMMAND_ID, HUB_ID, REPORT_SIZE, UNASSIGNED};
use crate::queue::OutgoingQueues;
use crate::registry::Session;
use crate::stats::{Stats, Verbosity};

const SUBCOMMAND_REGISTER: u8 = 0x01;
const SUBCOMMAND_UNREGISTER: u8 = 0x00;

/// Build a membership report addressed to `recipient`: `recipient`'s own
/// identifier in byte 2, the rest of the current membership in bytes 3.. (§4.F).
pub fn build_membership_report(allocator: &Allocator, recipient: u8) -> Report {
    let mut report = [0u8; REPORT_SIZE];
    report[0] = HUB_COMMAND_ID;
    report[1] = HUB_ID;

    let ids = allocator.assigned_ids();
    for (i, &id) in ids.iter().enumerate() {
        report[2 + i] = id;
    }
    if let Some(pos) = ids.iter().position(|&id| id == recipient) {
        report.swap(2, 2 + pos);
    }
    report
}

/// Handle one inbound report already read from `session`. Mutates the
/// allocator, `session`'s own identifier, and the outgoing queues.
pub fn handle_inbound(
    report: &Report,
    session: &mut Session,
    allocator: &mut Allocator,
    queues: &mut OutgoingQueues,
    stats: &mut Stats,
    verbosity: Verbosity,
    last_message_time_ms: &mut u64,
    now_ms: u64,
) {
    if report[0] != HUB_COMMAND_ID {
        if verbosity.discard {
            debug!(target: "hub::discard", path = %session.path().display(), "non-hub report ignored");
        }
        return;
    }

    let dst = report[1];

    if dst == HUB_ID {
        match report[2] {
            SUBCOMMAND_REGISTER => match allocator.register(&mut session.device_id) {
                RegisterResult::Assigned => {
                    if verbosity.hub {
                        debug!(target: "hub::traffic::hub", path = %session.path().display(), id = session.device_id, "registered");
                    }
                    // Membership broadcast is queued once per pass by the caller.
                }
                RegisterResult::AlreadyRegistered => {
                    let snapshot = build_membership_report(allocator, session.device_id);
                    queues.push(session.device_id, snapshot);
                }
                RegisterResult::Full => {
                    if verbosity.basic {
                        debug!(target: "hub::basic", path = %session.path().display(), "registration rejected: hub full");
                    }
                }
            },
            SUBCOMMAND_UNREGISTER => {
                if verbosity.hub {
                    debug!(target: "hub::traffic::hub", path = %session.path().display(), id = session.device_id, "unregistered");
                }
                allocator.unregister(&mut session.device_id, queues);
            }
            _ => {
                if verbosity.discard {
                    debug!(target: "hub::discard", "unknown hub sub-command {:#04x}", report[2]);
                }
            }
        }
        return;
    }

    if session.device_id == UNASSIGNED {
        if verbosity.discard {
            debug!(target: "hub::discard", path = %session.path().display(), "forward from unregistered session dropped");
        }
        return;
    }

    if !allocator.is_assigned(dst) {
        if verbosity.discard {
            debug!(target: "hub::discard", dst, "forward to unknown identifier dropped");
        }
        return;
    }

    let mut forwarded = *report;
    forwarded[1] = session.device_id;
    queues.push(dst, forwarded);
    stats.record(session.device_id, dst);
    if verbosity.device {
        debug!(target: "hub::traffic::device", from = session.device_id, to = dst, "forwarded");
    }
    *last_message_time_ms = now_ms;
}

/// Build one "shutdown" report (§4.F): no acknowledgement is expected.
pub fn shutdown_report() -> Report {
    let mut report = [0u8; REPORT_SIZE];
    report[0] = HUB_COMMAND_ID;
    report[1] = HUB_ID;
    report[2] = UNASSIGNED;
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::transport::fake::FakeHid;

    fn new_session(path: &str) -> Session {
        Session::new(Box::new(FakeHid::new(path)))
    }

    #[test]
    fn register_assigns_identifier_and_skips_ack() {
        let mut allocator = Allocator::new();
        let mut queues = OutgoingQueues::new();
        let mut stats = Stats::new(&Clock::new());
        let mut session = new_session("/dev/hidraw0");
        let mut last = 0u64;

        let mut report = [0u8; REPORT_SIZE];
        report[0] = HUB_COMMAND_ID;
        report[1] = HUB_ID;
        report[2] = SUBCOMMAND_REGISTER;

        handle_inbound(
            &report,
            &mut session,
            &mut allocator,
            &mut queues,
            &mut stats,
            Verbosity::default(),
            &mut last,
            0,
        );

        assert_eq!(session.device_id, 1);
        assert!(allocator.take_registrations_changed());
        // No personal ack was queued; broadcast happens once per pass, externally.
        assert_eq!(queues.len(1), 0);
    }

    #[test]
    fn register_twice_sends_personal_snapshot() {
        let mut allocator = Allocator::new();
        let mut queues = OutgoingQueues::new();
        let mut stats = Stats::new(&Clock::new());
        let mut session = new_session("/dev/hidraw0");
        let mut last = 0u64;

        let mut report = [0u8; REPORT_SIZE];
        report[0] = HUB_COMMAND_ID;
        report[1] = HUB_ID;
        report[2] = SUBCOMMAND_REGISTER;

        handle_inbound(&report, &mut session, &mut allocator, &mut queues, &mut stats, Verbosity::default(), &mut last, 0);
        handle_inbound(&report, &mut session, &mut allocator, &mut queues, &mut stats, Verbosity::default(), &mut last, 0);

        let snapshot = queues.pop(1).expect("personal snapshot queued");
        assert_eq!(snapshot[0], HUB_COMMAND_ID);
        assert_eq!(snapshot[1], HUB_ID);
        assert_eq!(snapshot[2], 1); // own id at byte 2, no peers
    }

    #[test]
    fn forward_rewrites_sender_and_drops_unknown_destination() {
        let mut allocator = Allocator::new();
        let mut queues = OutgoingQueues::new();
        let mut stats = Stats::new(&Clock::new());
        let mut s1 = new_session("/dev/hidraw0");
        let mut last = 0u64;
        allocator.register(&mut s1.device_id); // id 1

        let mut payload = [0xABu8; REPORT_SIZE];
        payload[0] = HUB_COMMAND_ID;
        payload[1] = 7; // unassigned destination
        handle_inbound(&payload, &mut s1, &mut allocator, &mut queues, &mut stats, Verbosity::default(), &mut last, 42);
        assert_eq!(queues.len(7), 0);
        assert_eq!(last, 0, "unknown destination must not update last_message_time");

        let mut s2 = new_session("/dev/hidraw1");
        allocator.register(&mut s2.device_id); // id 2
        payload[1] = 2;
        handle_inbound(&payload, &mut s1, &mut allocator, &mut queues, &mut stats, Verbosity::default(), &mut last, 42);

        let forwarded = queues.pop(2).expect("forward queued");
        assert_eq!(forwarded[1], 1); // rewritten to sender's id
        assert_eq!(last, 42);
    }

    #[test]
    fn non_hub_command_is_ignored() {
        let mut allocator = Allocator::new();
        let mut queues = OutgoingQueues::new();
        let mut stats = Stats::new(&Clock::new());
        let mut session = new_session("/dev/hidraw0");
        let mut last = 0u64;

        let report = [0xFFu8; REPORT_SIZE];
        handle_inbound(&report, &mut session, &mut allocator, &mut queues, &mut stats, Verbosity::default(), &mut last, 5);
        assert_eq!(session.device_id, UNASSIGNED);
        assert_eq!(last, 0);
    }

    #[test]
    fn membership_report_places_recipient_id_first() {
        let mut allocator = Allocator::new();
        let mut a = UNASSIGNED;
        let mut b = UNASSIGNED;
        allocator.register(&mut a); // 1
        allocator.register(&mut b); // 2

        let report = build_membership_report(&allocator, b);
        assert_eq!(report[2], b);
        assert!(report[3..5].contains(&a) || report[3] == a);
    }
}
