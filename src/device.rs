//! Register interface to the capture FPGA
//!
//! The kernel driver exposes the FPGA as a character device. Every register
//! operation is one ioctl, readiness is signalled through `poll(2)`, and the
//! DMA capture memory is mmap'd from the same file descriptor.

use std::{
    fs::{File, OpenOptions},
    io::{self, Read},
    os::unix::io::{AsRawFd, RawFd},
    path::{Path, PathBuf},
    time::Duration,
};

use tracing::{debug, info};

use crate::{region::CaptureRegion, Error, Result, MAX_CHANNELS};

/// Arguments of a capture start, in the layout the driver expects
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CaptureParams {
    /// Bus address of the bank to capture into
    pub address: u64,
    pub capture_count: u32,
    pub delay_count: u32,
    /// 0 = PPS triggered, 1 = software triggered
    pub mode: u32,
    /// Non-zero when the ADC produces two's complement samples
    pub signed: u32,
    pub peak_window_start: u32,
    pub peak_window_stop: u32,
    pub adc_offset: i32,
    /// Bit mask of enabled phases
    pub phase_mode: u32,
}

/// Per-channel max/min snapshot. Not double buffered: it is overwritten by
/// the next capture, so it must be read before the device is re-armed.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MaxMinRegister {
    /// Bus address of the maximum sample
    pub max_addr: u32,
    /// Raw 16-bit sample word in the low half
    pub max_data: u32,
    pub min_addr: u32,
    pub min_data: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceStatus {
    pub flags: u32,
    /// ADC clock cycles counted between the last two PPS edges
    pub adc_clock_count_per_pps: u32,
}

impl DeviceStatus {
    pub const RUNNING: u32 = 1 << 0;
    pub const PPS_LOCKED: u32 = 1 << 1;
    pub const DMA_ERROR: u32 = 1 << 2;

    pub fn running(&self) -> bool {
        self.flags & Self::RUNNING != 0
    }

    pub fn pps_locked(&self) -> bool {
        self.flags & Self::PPS_LOCKED != 0
    }
}

/// Format a version register as `major.minor.patch`
pub fn format_version(version: u32) -> String {
    format!(
        "{}.{}.{}",
        (version >> 16) & 0xff,
        (version >> 8) & 0xff,
        version & 0xff
    )
}

/// Everything the acquisition core needs from the front end
pub trait CaptureDevice: Send {
    fn capture_start(&mut self, params: &CaptureParams) -> Result<()>;

    fn capture_stop(&mut self) -> Result<()>;

    /// Re-arm the DMA engine with the bank to fill next
    fn capture_set_address(&mut self, address: u64) -> Result<()>;

    fn semaphore_get(&self) -> Result<u32>;

    fn semaphore_set(&mut self, value: u32) -> Result<()>;

    fn maxmin_get(&self) -> Result<[MaxMinRegister; MAX_CHANNELS]>;

    /// Start a capture now (manual mode)
    fn trigger(&mut self) -> Result<()>;

    fn status_get(&self) -> Result<DeviceStatus>;

    fn fpga_version_get(&self) -> Result<u32>;

    /// Block until a capture completed or `timeout` passed. `Ok(true)` means
    /// exactly one new capture is ready.
    fn wait_ready(&mut self, timeout: Duration) -> Result<bool>;

    /// Map the capture memory
    fn map_region(&mut self, len: usize, phys_base: u64) -> Result<CaptureRegion>;
}

impl<D: CaptureDevice + ?Sized> CaptureDevice for Box<D> {
    fn capture_start(&mut self, params: &CaptureParams) -> Result<()> {
        (**self).capture_start(params)
    }

    fn capture_stop(&mut self) -> Result<()> {
        (**self).capture_stop()
    }

    fn capture_set_address(&mut self, address: u64) -> Result<()> {
        (**self).capture_set_address(address)
    }

    fn semaphore_get(&self) -> Result<u32> {
        (**self).semaphore_get()
    }

    fn semaphore_set(&mut self, value: u32) -> Result<()> {
        (**self).semaphore_set(value)
    }

    fn maxmin_get(&self) -> Result<[MaxMinRegister; MAX_CHANNELS]> {
        (**self).maxmin_get()
    }

    fn trigger(&mut self) -> Result<()> {
        (**self).trigger()
    }

    fn status_get(&self) -> Result<DeviceStatus> {
        (**self).status_get()
    }

    fn fpga_version_get(&self) -> Result<u32> {
        (**self).fpga_version_get()
    }

    fn wait_ready(&mut self, timeout: Duration) -> Result<bool> {
        (**self).wait_ready(timeout)
    }

    fn map_region(&mut self, len: usize, phys_base: u64) -> Result<CaptureRegion> {
        (**self).map_region(len, phys_base)
    }
}

/// Request numbers understood by the `pd_fpga` driver
mod request {
    use std::mem::size_of;

    use super::{CaptureParams, DeviceStatus, MaxMinRegister};
    use crate::MAX_CHANNELS;

    const MAGIC: u64 = b'P' as u64;
    const NONE: u64 = 0;
    const WRITE: u64 = 1;
    const READ: u64 = 2;

    const fn ioc(dir: u64, nr: u64, size: usize) -> u64 {
        (dir << 30) | ((size as u64) << 16) | (MAGIC << 8) | nr
    }

    pub const CAPTURE_START: u64 = ioc(WRITE, 1, size_of::<CaptureParams>());
    pub const CAPTURE_STOP: u64 = ioc(NONE, 2, 0);
    pub const CAPTURE_SET_ADDRESS: u64 = ioc(WRITE, 3, size_of::<u64>());
    pub const SEMAPHORE_GET: u64 = ioc(READ, 4, size_of::<u32>());
    pub const SEMAPHORE_SET: u64 = ioc(WRITE, 5, size_of::<u32>());
    pub const MAXMIN_GET: u64 = ioc(READ, 6, size_of::<[MaxMinRegister; MAX_CHANNELS]>());
    pub const TRIGGER: u64 = ioc(NONE, 7, 0);
    pub const STATUS_GET: u64 = ioc(READ, 8, size_of::<DeviceStatus>());
    pub const VERSION_GET: u64 = ioc(READ, 9, size_of::<u32>());
}

/// The FPGA behind its Linux character device
pub struct FpgaDevice {
    path: PathBuf,
    file: File,
}

impl FpgaDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| Error::DeviceOpen {
                path: path.clone(),
                source,
            })?;
        let dev = Self { path, file };
        let version = dev.fpga_version_get()?;
        info!(path = %dev.path.display(), version = %format_version(version), "Opened capture FPGA");
        Ok(dev)
    }

    fn ioctl<T>(&self, op: &'static str, request: u64, arg: *mut T) -> Result<()> {
        // Safety: `request` encodes the size of `T`, and `arg` is either null
        // (for argument-less requests) or points at a live `T`
        let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), request as _, arg) };
        if rc < 0 {
            return Err(Error::Device {
                op,
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    fn ioctl_read<T: Default>(&self, op: &'static str, request: u64) -> Result<T> {
        let mut value = T::default();
        self.ioctl(op, request, &mut value as *mut T)?;
        Ok(value)
    }

    fn ioctl_write<T: Copy>(&self, op: &'static str, request: u64, value: T) -> Result<()> {
        let mut value = value;
        self.ioctl(op, request, &mut value as *mut T)
    }

    fn ioctl_none(&self, op: &'static str, request: u64) -> Result<()> {
        self.ioctl::<u8>(op, request, std::ptr::null_mut())
    }
}

impl CaptureDevice for FpgaDevice {
    fn capture_start(&mut self, params: &CaptureParams) -> Result<()> {
        debug!(?params, "capture start");
        self.ioctl_write("capture_start", request::CAPTURE_START, *params)
    }

    fn capture_stop(&mut self) -> Result<()> {
        self.ioctl_none("capture_stop", request::CAPTURE_STOP)
    }

    fn capture_set_address(&mut self, address: u64) -> Result<()> {
        self.ioctl_write("capture_set_address", request::CAPTURE_SET_ADDRESS, address)
    }

    fn semaphore_get(&self) -> Result<u32> {
        self.ioctl_read("semaphore_get", request::SEMAPHORE_GET)
    }

    fn semaphore_set(&mut self, value: u32) -> Result<()> {
        self.ioctl_write("semaphore_set", request::SEMAPHORE_SET, value)
    }

    fn maxmin_get(&self) -> Result<[MaxMinRegister; MAX_CHANNELS]> {
        self.ioctl_read("maxmin_get", request::MAXMIN_GET)
    }

    fn trigger(&mut self) -> Result<()> {
        self.ioctl_none("trigger", request::TRIGGER)
    }

    fn status_get(&self) -> Result<DeviceStatus> {
        self.ioctl_read("status_get", request::STATUS_GET)
    }

    fn fpga_version_get(&self) -> Result<u32> {
        self.ioctl_read("fpga_version_get", request::VERSION_GET)
    }

    fn wait_ready(&mut self, timeout: Duration) -> Result<bool> {
        let ready = poll_readable(self.file.as_raw_fd(), timeout).map_err(|source| {
            Error::Device {
                op: "wait_ready",
                source,
            }
        })?;
        if ready {
            // The driver hands out an event count; reading it acknowledges the capture
            let mut count = [0u8; 4];
            self.file
                .read_exact(&mut count)
                .map_err(|source| Error::Device {
                    op: "wait_ready",
                    source,
                })?;
        }
        Ok(ready)
    }

    fn map_region(&mut self, len: usize, phys_base: u64) -> Result<CaptureRegion> {
        CaptureRegion::from_device(&self.file, len, phys_base)
    }
}

/// Wait until `fd` is readable. `Ok(false)` on timeout or signal interruption.
pub fn poll_readable(fd: RawFd, timeout: Duration) -> io::Result<bool> {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
    // Safety: one valid pollfd
    let rc = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(err);
    }
    if rc == 0 {
        return Ok(false);
    }
    if pollfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
        return Err(io::Error::new(
            io::ErrorKind::BrokenPipe,
            format!("poll reported revents {:#x}", pollfd.revents),
        ));
    }
    Ok(pollfd.revents & (libc::POLLIN | libc::POLLHUP) != 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_numbers_encode_size_and_direction() {
        assert_eq!(request::CAPTURE_STOP, (b'P' as u64) << 8 | 2);
        assert_eq!((request::MAXMIN_GET >> 16) & 0x3fff, 48);
        assert_eq!(request::MAXMIN_GET >> 30, 2);
        assert_eq!(request::CAPTURE_START >> 30, 1);
    }

    #[test]
    fn version_formatting() {
        assert_eq!(format_version(0x0001_0203), "1.2.3");
    }

    #[test]
    fn missing_device_is_fatal() {
        let err = FpgaDevice::open("/nonexistent/pd_fpga").err().unwrap();
        assert!(matches!(err, Error::DeviceOpen { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn poll_times_out_on_idle_pipe() {
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let ready = poll_readable(fds[0], Duration::from_millis(10)).unwrap();
        assert!(!ready);
        assert_eq!(unsafe { libc::write(fds[1], b"x".as_ptr() as *const _, 1) }, 1);
        assert!(poll_readable(fds[0], Duration::from_millis(10)).unwrap());
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
