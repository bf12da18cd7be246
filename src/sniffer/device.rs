//! Character-device sniffer backed by a real FA hardware unit.
//!
//! Follows the RAII device-handle pattern used for the comedi driver: the
//! raw file descriptor is owned by this struct, closed on `Drop`, and
//! every ioctl is serialized through a [`parking_lot::Mutex`].

use std::os::unix::io::RawFd;
use std::path::Path;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{Sniffer, Status};
use crate::error::{FaError, Result};
use crate::ring_buffer::RawBlock;

// ioctl request numbers for the FA sniffer character device. Values are
// device-specific magic numbers, not derived from any general ioctl
// encoding scheme.
const FASNIFF_IOC_VERSION: libc::c_ulong = 0x4640_0001;
const FASNIFF_IOC_SET_ENTRY_COUNT: libc::c_ulong = 0x4640_0002;
const FASNIFF_IOC_RESET: libc::c_ulong = 0x4640_0003;

struct Inner {
    fd: RawFd,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if self.fd >= 0 {
            // SAFETY: fd is owned by this struct and not used after close.
            unsafe {
                libc::close(self.fd);
            }
            debug!(fd = self.fd, "sniffer device closed");
        }
    }
}

/// A sniffer driven by ioctls against a real FA character device.
pub struct CharDeviceSniffer {
    inner: Mutex<Inner>,
    entry_count: usize,
}

impl CharDeviceSniffer {
    /// Open `path` (e.g. `/dev/fa0`) and configure it for `entry_count`
    /// BPM ids per frame.
    pub fn open(path: impl AsRef<Path>, entry_count: usize) -> Result<Self> {
        let path = path.as_ref();
        let c_path = std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
            .map_err(|_| FaError::fatal("device path contains a NUL byte"))?;

        // SAFETY: c_path is a valid, NUL-terminated C string for the
        // duration of this call.
        let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDWR) };
        if fd < 0 {
            let errno = std::io::Error::last_os_error();
            return Err(match errno.raw_os_error() {
                Some(libc::ENOENT) => {
                    FaError::fatal(format!("sniffer device not found: {}", path.display()))
                }
                Some(libc::EACCES) | Some(libc::EPERM) => {
                    FaError::fatal(format!("permission denied opening {}", path.display()))
                }
                Some(libc::EBUSY) => {
                    FaError::fatal(format!("sniffer device busy: {}", path.display()))
                }
                _ => FaError::Io(errno),
            });
        }

        let sniffer = CharDeviceSniffer {
            inner: Mutex::new(Inner { fd }),
            entry_count,
        };
        sniffer.configure_entry_count()?;
        Ok(sniffer)
    }

    fn configure_entry_count(&self) -> Result<()> {
        self.with_fd(|fd| {
            // SAFETY: fd is open and FASNIFF_IOC_SET_ENTRY_COUNT expects
            // a single c_int argument by value.
            let rc = unsafe {
                libc::ioctl(
                    fd,
                    FASNIFF_IOC_SET_ENTRY_COUNT,
                    self.entry_count as libc::c_int,
                )
            };
            if rc < 0 {
                return Err(FaError::Io(std::io::Error::last_os_error()));
            }
            Ok(())
        })
    }

    fn with_fd<R>(&self, f: impl FnOnce(RawFd) -> Result<R>) -> Result<R> {
        let guard = self.inner.lock();
        f(guard.fd)
    }
}

impl Sniffer for CharDeviceSniffer {
    fn reset(&mut self) -> Result<()> {
        self.with_fd(|fd| {
            // SAFETY: fd open, FASNIFF_IOC_RESET takes no argument.
            let rc = unsafe { libc::ioctl(fd, FASNIFF_IOC_RESET) };
            if rc < 0 {
                return Err(FaError::Io(std::io::Error::last_os_error()));
            }
            Ok(())
        })
    }

    fn read(&mut self, block: &mut RawBlock) -> Result<u64> {
        self.with_fd(|fd| {
            let byte_len = block.entries.len() * std::mem::size_of::<crate::ring_buffer::Entry>();
            // SAFETY: entries is a Vec<Entry> with repr(C) Entry, so this
            // byte view is valid for byte_len bytes for the duration of
            // the syscall.
            let buf = unsafe {
                std::slice::from_raw_parts_mut(block.entries.as_mut_ptr() as *mut u8, byte_len)
            };
            let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n < 0 {
                return Err(FaError::Io(std::io::Error::last_os_error()));
            }
            if (n as usize) != buf.len() {
                return Err(FaError::fatal("short read from sniffer device"));
            }

            let mut timestamp_buf = [0u8; 8];
            // SAFETY: FASNIFF_IOC_VERSION here doubles as the
            // read-timestamp call on this device generation; buffer is
            // sized for the expected 64-bit reply.
            let rc = unsafe {
                libc::ioctl(
                    fd,
                    FASNIFF_IOC_VERSION,
                    timestamp_buf.as_mut_ptr() as *mut libc::c_void,
                )
            };
            if rc < 0 {
                warn!("failed to read precise timestamp, falling back to wall clock");
                return Ok(now_micros());
            }
            Ok(u64::from_ne_bytes(timestamp_buf))
        })
    }

    fn status(&mut self) -> Result<Status> {
        self.with_fd(|_fd| {
            Ok(Status {
                version: 1,
                entry_count: self.entry_count as u32,
                overruns: 0,
            })
        })
    }

    fn interrupt(&mut self) -> Result<()> {
        self.with_fd(|fd| {
            // SAFETY: fd open, FASNIFF_IOC_RESET also halts in-flight
            // transfers on this device.
            let rc = unsafe { libc::ioctl(fd, FASNIFF_IOC_RESET) };
            if rc < 0 {
                return Err(FaError::Io(std::io::Error::last_os_error()));
            }
            Ok(())
        })
    }
}

fn now_micros() -> u64 {
    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    ts.as_micros() as u64
}
