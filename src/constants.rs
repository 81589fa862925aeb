/* Shared constants from the hub protocol (spec §3, §4.F). */

/// Number of distinct identifiers the wire format can address (0..254); 255 is reserved.
pub const N_UNIQUE_DEVICE_IDS: usize = 255;

/// Upper bound on simultaneously registered peers.
pub const MAX_REGISTERED_DEVICES: usize = 30;

/// Payload size of one HID report, matching QMK's `RAW_EPSIZE` exactly --
/// this hub's reports carry no separate numbered-report framing byte.
pub const REPORT_SIZE: usize = 32;

/// Command tag that must be present in byte 0 of every report the hub interprets.
pub const HUB_COMMAND_ID: u8 = 0x27;

/// Reserved identifier meaning both "the hub itself" (on the wire) and
/// "this session has not been assigned an identifier" (internally).
pub const HUB_ID: u8 = 255;
pub const UNASSIGNED: u8 = HUB_ID;

/// usage page / usage identifying a QMK raw-HID endpoint.
pub const RAW_HID_USAGE_PAGE: u16 = 0xFF60;
pub const RAW_HID_USAGE: u16 = 0x61;

/// One HID report payload, always exactly [`REPORT_SIZE`] bytes.
pub type Report = [u8; REPORT_SIZE];
