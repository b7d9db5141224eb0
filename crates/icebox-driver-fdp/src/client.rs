use std::{
    cell::Cell,
    ffi::CString,
    fs::File,
    os::fd::FromRawFd as _,
    time::{Duration, Instant},
};

use memmap2::MmapRaw;
use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::{
    proto::{self, layout, Command, EventRecord, RegionHeader, RequestPacket, RingIndices},
    Error,
};

/// How long the counterpart gets to acknowledge a request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll interval while spinning on the mailbox or the event ring.
const POLL_INTERVAL: Duration = Duration::from_micros(100);

/// The raw FDP mailbox client.
///
/// Maps the named shared region and performs synchronous request/response
/// exchanges. One outstanding request at a time; this is enforced by the
/// single-threaded session model, not by locks.
pub struct FdpClient {
    map: MmapRaw,
    // Keeps the shm fd (and thus the mapping name) alive.
    _file: File,
    sequence: Cell<u32>,
    vcpu_count: u16,
    max_gfn: u64,
}

impl FdpClient {
    /// Opens the shared region published under `/fdp_<name>`.
    pub fn open(name: &str) -> Result<Self, Error> {
        let shm_name = CString::new(format!("/fdp_{name}")).map_err(|_| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "VM name contains a NUL byte",
            ))
        })?;

        // Safety: shm_open returns an owned descriptor or -1.
        let fd = unsafe { libc::shm_open(shm_name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }

        let file = unsafe { File::from_raw_fd(fd) };

        let len = file.metadata()?.len() as usize;
        if len < layout::TOTAL {
            return Err(Error::Truncated(len));
        }

        let map = MmapRaw::map_raw(&file)?;
        let client = Self {
            map,
            _file: file,
            sequence: Cell::new(0),
            vcpu_count: 0,
            max_gfn: 0,
        };

        let header: RegionHeader = client.read_at(layout::HEADER);

        if header.magic != proto::FDP_MAGIC {
            return Err(Error::BadMagic(header.magic));
        }

        if header.version != proto::FDP_VERSION {
            return Err(Error::VersionMismatch(header.version));
        }

        tracing::debug!(name, vcpus = header.vcpu_count, "FDP region attached");

        Ok(Self {
            sequence: Cell::new(header.request_seq),
            vcpu_count: header.vcpu_count,
            max_gfn: header.max_gfn,
            ..client
        })
    }

    /// Number of vCPUs exposed by the counterpart.
    pub fn vcpu_count(&self) -> u16 {
        self.vcpu_count
    }

    /// Highest guest frame number.
    pub fn max_gfn(&self) -> u64 {
        self.max_gfn
    }

    /// Issues one synchronous request and waits for the acknowledgement.
    pub fn request(&self, command: Command, vcpu: u16, arg0: u64, arg1: u64) -> Result<(), Error> {
        let packet = RequestPacket {
            command: command as u32,
            vcpu,
            _pad: 0,
            arg0,
            arg1,
        };
        self.write_at(layout::REQUEST, packet);

        let sequence = self.sequence.get().wrapping_add(1);
        self.sequence.set(sequence);
        self.write_field(std::mem::offset_of!(RegionHeader, request_seq), sequence);

        let deadline = Instant::now() + REQUEST_TIMEOUT;
        loop {
            let acked: u32 =
                self.read_field(std::mem::offset_of!(RegionHeader, response_seq));
            if acked == sequence {
                break;
            }

            if Instant::now() >= deadline {
                tracing::error!(?command, "counterpart did not acknowledge");
                return Err(Error::RequestTimeout);
            }

            std::thread::sleep(POLL_INTERVAL);
        }

        let status: u32 = self.read_field(std::mem::offset_of!(RegionHeader, status));
        match status {
            proto::STATUS_OK => Ok(()),
            proto::STATUS_INVALID_ADDRESS => Err(Error::InvalidAddress(icebox_core::Pa(arg0))),
            proto::STATUS_INVALID_VCPU => Err(Error::InvalidVcpu),
            proto::STATUS_UNKNOWN_BREAKPOINT => Err(Error::UnknownBreakpoint),
            proto::STATUS_NOT_SUPPORTED => Err(Error::NotSupported),
            status => Err(Error::Status(status)),
        }
    }

    /// Copies bytes out of the data window.
    pub fn read_data(&self, buffer: &mut [u8]) -> Result<(), Error> {
        if buffer.len() > proto::DATA_WINDOW {
            return Err(Error::TooLarge);
        }

        // Safety: the window is within the mapping (checked at open).
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.map.as_mut_ptr().add(layout::DATA),
                buffer.as_mut_ptr(),
                buffer.len(),
            );
        }
        Ok(())
    }

    /// Copies bytes into the data window.
    pub fn write_data(&self, buffer: &[u8]) -> Result<(), Error> {
        if buffer.len() > proto::DATA_WINDOW {
            return Err(Error::TooLarge);
        }

        // Safety: the window is within the mapping (checked at open).
        unsafe {
            std::ptr::copy_nonoverlapping(
                buffer.as_ptr(),
                self.map.as_mut_ptr().add(layout::DATA),
                buffer.len(),
            );
        }
        Ok(())
    }

    /// Reads a plain-data value from the start of the data window.
    pub fn read_data_struct<T>(&self) -> Result<T, Error>
    where
        T: FromBytes + IntoBytes,
    {
        let mut value = T::new_zeroed();
        self.read_data(value.as_mut_bytes())?;
        Ok(value)
    }

    /// Pops the next event from the ring, if any.
    pub fn pop_event(&self) -> Option<EventRecord> {
        let indices: RingIndices = self.read_at(layout::RING);

        if indices.head == indices.tail {
            return None;
        }

        let slot = indices.tail as usize % proto::EVENT_RING;
        let record: EventRecord = self.read_at(layout::EVENTS + slot * size_of::<EventRecord>());

        self.write_field(
            layout::RING + std::mem::offset_of!(RingIndices, tail),
            indices.tail.wrapping_add(1),
        );

        Some(record)
    }

    /// Waits for an event, polling the ring until the deadline.
    pub fn wait_for_event(&self, timeout: Duration) -> Result<EventRecord, Error> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(record) = self.pop_event() {
                return Ok(record);
            }

            if Instant::now() >= deadline {
                return Err(Error::EventTimeout);
            }

            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn read_at<T>(&self, offset: usize) -> T
    where
        T: FromBytes + IntoBytes,
    {
        debug_assert!(offset + size_of::<T>() <= self.map.len());

        let mut value = T::new_zeroed();
        // Safety: bounds asserted above; the region outlives `self`.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.map.as_mut_ptr().add(offset),
                value.as_mut_bytes().as_mut_ptr(),
                size_of::<T>(),
            );
        }
        value
    }

    fn write_at<T>(&self, offset: usize, value: T)
    where
        T: IntoBytes + Immutable,
    {
        debug_assert!(offset + size_of::<T>() <= self.map.len());

        // Safety: bounds asserted above; the region outlives `self`.
        unsafe {
            std::ptr::copy_nonoverlapping(
                value.as_bytes().as_ptr(),
                self.map.as_mut_ptr().add(offset),
                size_of::<T>(),
            );
        }
    }

    fn read_field(&self, offset: usize) -> u32 {
        // Safety: header fields are within the mapping; volatile because the
        // counterpart writes them concurrently.
        unsafe { std::ptr::read_volatile(self.map.as_mut_ptr().add(offset) as *const u32) }
    }

    fn write_field(&self, offset: usize, value: u32) {
        // Safety: see read_field.
        unsafe {
            std::ptr::write_volatile(self.map.as_mut_ptr().add(offset) as *mut u32, value);
        }
    }
}
