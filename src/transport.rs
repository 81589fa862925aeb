/* HID transport facade (spec §4.B): enumerate/open/read/write over raw-HID
 * endpoints. The core only ever sees this interface; this module is the only
 * place that knows about `/dev/hidraw*`, HID report descriptors, or usage pages.
 *
 * Enumeration walks `/sys/class/hidraw` directly and parses each device's HID
 * report descriptor for its usage page/usage (§4.H step 1-2) -- no udev
 * context is kept around, so there is nothing here that needs the system's
 * libudev. I/O talks straight to the `/dev/hidraw*` node, matching the report
 * size QMK's raw-HID endpoint declares (§6): no extra report-ID framing byte. */

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use thiserror::Error;

use crate::constants::{Report, RAW_HID_USAGE, RAW_HID_USAGE_PAGE, REPORT_SIZE};

const SYSFS_HIDRAW_CLASS: &str = "/sys/class/hidraw";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to list {0}: {1}")]
    Enumerate(PathBuf, io::Error),
    #[error("failed to open {path}: {source}")]
    Open { path: PathBuf, source: io::Error },
    #[error("failed to set non-blocking mode on {path}: {source}")]
    NonBlocking { path: PathBuf, source: nix::Error },
    #[error("read failed on {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("write failed on {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

/// One enumerated HID endpoint, before it is opened.
#[derive(Debug, Clone)]
pub struct EnumeratedEndpoint {
    pub path: PathBuf,
    pub usage_page: u16,
    pub usage: u16,
    pub product_string: Option<String>,
}

impl EnumeratedEndpoint {
    /// True for endpoints following the QMK raw-HID convention (§4.H).
    pub fn is_raw_hid(&self) -> bool {
        self.usage_page == RAW_HID_USAGE_PAGE && self.usage == RAW_HID_USAGE
    }
}

/// Enumeration state. Holds nothing but the sysfs root; every open session
/// is handed off by value and never touches this again.
pub struct HidTransport {
    class_dir: PathBuf,
}

impl HidTransport {
    pub fn init() -> Result<Self, TransportError> {
        Ok(Self {
            class_dir: PathBuf::from(SYSFS_HIDRAW_CLASS),
        })
    }

    /// Enumerate all present hidraw endpoints. Does not filter by usage;
    /// callers apply the raw-HID filter themselves (§4.H, step 2).
    pub fn enumerate(&mut self) -> Result<Vec<EnumeratedEndpoint>, TransportError> {
        let entries = match fs::read_dir(&self.class_dir) {
            Ok(entries) => entries,
            // No hidraw subsystem at all (e.g. container without the kernel
            // module) is not fatal: just report zero endpoints this pass.
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(TransportError::Enumerate(self.class_dir.clone(), e)),
        };

        let mut endpoints = Vec::new();
        for entry in entries {
            let Ok(entry) = entry else { continue };
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with("hidraw") {
                continue;
            }
            if let Some(endpoint) = describe_endpoint(name) {
                endpoints.push(endpoint);
            }
        }
        Ok(endpoints)
    }

    /// Open a session by device node path, configured for non-blocking reads.
    pub fn open(&self, path: &Path) -> Result<HidSession, TransportError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc_o_nonblock())
            .open(path)
            .map_err(|source| TransportError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        set_nonblocking(&file, path)?;

        Ok(HidSession {
            file,
            path: path.to_path_buf(),
        })
    }
}

fn libc_o_nonblock() -> i32 {
    OFlag::O_NONBLOCK.bits()
}

fn set_nonblocking(file: &File, path: &Path) -> Result<(), TransportError> {
    fcntl(file.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK)).map_err(|source| {
        TransportError::NonBlocking {
            path: path.to_path_buf(),
            source,
        }
    })?;
    Ok(())
}

/// Read the sysfs attributes for one `/sys/class/hidraw/<name>` entry and
/// derive its usage page/usage from its HID report descriptor. `None` if any
/// attribute is unreadable (device unplugged mid-scan, permissions, ...).
fn describe_endpoint(name: &str) -> Option<EnumeratedEndpoint> {
    let device_dir = PathBuf::from(SYSFS_HIDRAW_CLASS).join(name).join("device");
    let descriptor = fs::read(device_dir.join("report_descriptor")).ok()?;
    let (usage_page, usage) = parse_primary_usage(&descriptor).unwrap_or((0, 0));
    let product_string = read_uevent_field(&device_dir.join("uevent"), "HID_NAME");

    Some(EnumeratedEndpoint {
        path: PathBuf::from("/dev").join(name),
        usage_page,
        usage,
        product_string,
    })
}

fn read_uevent_field(path: &Path, key: &str) -> Option<String> {
    let contents = fs::read_to_string(path).ok()?;
    contents.lines().find_map(|line| {
        let (k, v) = line.split_once('=')?;
        (k == key).then(|| v.to_string())
    })
}

/// Walk a HID report descriptor for the usage page/usage declared before the
/// first top-level collection. See the HID 1.11 spec §6.2.2 for the item
/// encoding this decodes (tag in bits 7-4, type in bits 3-2, size code in
/// bits 1-0).
fn parse_primary_usage(descriptor: &[u8]) -> Option<(u16, u16)> {
    const TAG_USAGE_PAGE: u8 = 0x04;
    const TAG_USAGE: u8 = 0x08;
    const TAG_COLLECTION: u8 = 0xA0;

    let mut i = 0;
    let mut usage_page: u16 = 0;
    let mut found: Option<(u16, u16)> = None;

    while i < descriptor.len() {
        let prefix = descriptor[i];
        if prefix == 0xFE {
            // Long item: byte 1 is a data-length byte, byte 2 a long item tag.
            let data_len = *descriptor.get(i + 1)? as usize;
            i += 3 + data_len;
            continue;
        }

        let size = match prefix & 0x03 {
            0 => 0,
            1 => 1,
            2 => 2,
            _ => 4,
        };
        let tag = prefix & 0xFC;
        i += 1;
        if i + size > descriptor.len() {
            break;
        }
        let value = descriptor[i..i + size]
            .iter()
            .rev()
            .fold(0u32, |acc, &b| (acc << 8) | b as u32);
        i += size;

        match tag {
            TAG_USAGE_PAGE => usage_page = value as u16,
            TAG_USAGE if found.is_none() => found = Some((usage_page, value as u16)),
            TAG_COLLECTION if found.is_some() => break,
            _ => {}
        }
    }

    found
}

/// Everything the rest of the crate needs from an open HID endpoint. Lets the
/// dispatch worker and protocol engine be tested without real hardware: the
/// production backend is [`HidSession`], tests use `FakeHid` (below).
pub trait HidIo: Send {
    fn path(&self) -> &Path;
    /// Non-blocking read of one report. `Ok(None)` means nothing pending.
    fn read_report(&self) -> Result<Option<Report>, TransportError>;
    /// Best-effort write of one report.
    fn write_report(&self, payload: &Report) -> Result<(), TransportError>;
}

/// One open raw-HID endpoint's I/O handle, backed by `/dev/hidraw*`.
pub struct HidSession {
    file: File,
    path: PathBuf,
}

impl HidIo for HidSession {
    fn path(&self) -> &Path {
        &self.path
    }

    fn read_report(&self) -> Result<Option<Report>, TransportError> {
        let mut buf = [0u8; REPORT_SIZE];
        // `&File` implements `Read` via its own fd; no `&mut self` needed,
        // which keeps sessions shareable the way the rest of the crate expects.
        match (&self.file).read(&mut buf) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(buf)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(source) => Err(TransportError::Read {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn write_report(&self, payload: &Report) -> Result<(), TransportError> {
        (&self.file)
            .write_all(payload)
            .map_err(|source| TransportError::Write {
                path: self.path.clone(),
                source,
            })
    }
}

#[cfg(test)]
pub mod fake {
    //! An in-process stand-in for hardware, used by protocol/dispatch tests.
    use std::collections::VecDeque;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    use super::{HidIo, Report, TransportError};

    pub struct FakeHid {
        path: PathBuf,
        inbox: Mutex<VecDeque<Report>>,
        pub outbox: Mutex<Vec<Report>>,
    }

    impl FakeHid {
        pub fn new(path: &str) -> Self {
            Self {
                path: PathBuf::from(path),
                inbox: Mutex::new(VecDeque::new()),
                outbox: Mutex::new(Vec::new()),
            }
        }

        pub fn push_inbound(&self, report: Report) {
            self.inbox.lock().unwrap().push_back(report);
        }
    }

    impl HidIo for FakeHid {
        fn path(&self) -> &Path {
            &self.path
        }

        fn read_report(&self) -> Result<Option<Report>, TransportError> {
            Ok(self.inbox.lock().unwrap().pop_front())
        }

        fn write_report(&self, payload: &Report) -> Result<(), TransportError> {
            self.outbox.lock().unwrap().push(*payload);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_hid_filter_matches_qmk_convention() {
        let ep = EnumeratedEndpoint {
            path: PathBuf::from("/dev/hidraw0"),
            usage_page: RAW_HID_USAGE_PAGE,
            usage: RAW_HID_USAGE,
            product_string: None,
        };
        assert!(ep.is_raw_hid());
    }

    #[test]
    fn raw_hid_filter_rejects_other_usages() {
        let ep = EnumeratedEndpoint {
            path: PathBuf::from("/dev/hidraw1"),
            usage_page: 0x0001,
            usage: 0x0006,
            product_string: None,
        };
        assert!(!ep.is_raw_hid());
    }

    /// A minimal descriptor: Usage Page (0xFF60), Usage (0x61), Collection(Application).
    #[test]
    fn primary_usage_reads_page_before_first_collection() {
        let descriptor = [
            0x06, 0x60, 0xFF, // Usage Page (0xFF60), 2-byte data
            0x09, 0x61, // Usage (0x61), 1-byte data
            0xA1, 0x01, // Collection (Application)
            0x09, 0x02, // nested Usage, must not override the result
        ];
        assert_eq!(
            parse_primary_usage(&descriptor),
            Some((RAW_HID_USAGE_PAGE, RAW_HID_USAGE))
        );
    }

    #[test]
    fn primary_usage_none_for_empty_descriptor() {
        assert_eq!(parse_primary_usage(&[]), None);
    }
}
