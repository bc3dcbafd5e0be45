// Shared memory backend for Linux
// Uses /dev/shm + mmap so a region can be created by one endpoint and
// attached by name from another process.

use std::fmt::Debug;
use std::io;

#[cfg(target_os = "linux")]
use std::fs::OpenOptions;
#[cfg(target_os = "linux")]
use std::ptr::NonNull;
#[cfg(target_os = "linux")]
use std::os::fd::{AsRawFd, IntoRawFd};
#[cfg(target_os = "linux")]
use std::os::unix::fs::OpenOptionsExt;
#[cfg(target_os = "linux")]
use std::ptr;

/// Shared memory backend trait for cross-platform memory mapping.
pub trait SmemBackend: Send + Sync + Debug {
    /// Get a pointer to the mapped memory region.
    fn as_ptr(&self) -> *mut u8;

    /// Get the size of the mapped region in bytes.
    fn size(&self) -> usize;
}

/// A shared-memory window with a simulated 32-bit bus address base.
///
/// Block descriptors in the ring headers carry absolute `u32` addresses.
/// Both cores must agree on that address space even though their own
/// mappings differ, so the region pins a `bus_base` at creation time and
/// every address stored in shared memory is `bus_base + offset`.
#[derive(Debug)]
pub struct SmemRegion {
    backing: Box<dyn SmemBackend>,
    bus_base: u32,
}

impl SmemRegion {
    /// Create a new region of `size` bytes addressable from `bus_base`.
    /// The backing file is removed when the creating region is dropped.
    #[cfg(target_os = "linux")]
    pub fn create(name: &str, size: usize, bus_base: u32) -> io::Result<Self> {
        Ok(Self {
            backing: Box::new(ShmFileMapping::create(name, size)?),
            bus_base,
        })
    }

    /// Attach to a region previously created under `name`. The whole
    /// backing file is mapped; `min_size` only validates it is large
    /// enough to hold the expected header.
    #[cfg(target_os = "linux")]
    pub fn attach(name: &str, min_size: usize, bus_base: u32) -> io::Result<Self> {
        Ok(Self {
            backing: Box::new(ShmFileMapping::attach(name, min_size)?),
            bus_base,
        })
    }

    #[cfg(not(target_os = "linux"))]
    pub fn create(_name: &str, _size: usize, _bus_base: u32) -> io::Result<Self> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "Shared memory only supported on Linux",
        ))
    }

    #[cfg(not(target_os = "linux"))]
    pub fn attach(_name: &str, _min_size: usize, _bus_base: u32) -> io::Result<Self> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "Shared memory only supported on Linux",
        ))
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.backing.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.backing.size()
    }

    /// The base of the bus address window.
    pub fn bus_base(&self) -> u32 {
        self.bus_base
    }

    /// Translate an offset into the region to its bus address.
    pub fn bus_addr(&self, offset: usize) -> u32 {
        debug_assert!(offset <= self.size());
        self.bus_base.wrapping_add(offset as u32)
    }

    /// Translate a bus address back to an offset, checking the window.
    pub fn offset_of(&self, addr: u32) -> io::Result<usize> {
        let off = addr.wrapping_sub(self.bus_base) as usize;
        if off >= self.size() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bus address {addr:#x} outside region window"),
            ));
        }
        Ok(off)
    }

    /// Virtual pointer for a bus address.
    pub fn ptr_at(&self, addr: u32) -> io::Result<*mut u8> {
        let off = self.offset_of(addr)?;
        Ok(unsafe { self.as_ptr().add(off) })
    }
}

#[cfg(target_os = "linux")]
#[derive(Debug)]
struct ShmFileMapping {
    ptr: NonNull<u8>,
    size: usize,
    fd: i32,
    /// Set on the creating side; the file is unlinked on drop.
    unlink_path: Option<String>,
}

#[cfg(target_os = "linux")]
unsafe impl Send for ShmFileMapping {}
#[cfg(target_os = "linux")]
unsafe impl Sync for ShmFileMapping {}

#[cfg(target_os = "linux")]
impl ShmFileMapping {
    /// Create or truncate a file in /dev/shm and map it.
    fn create(name: &str, size: usize) -> io::Result<Self> {
        // Align to the 128-byte cache-line stride used by the header layout
        let aligned_size = (size + 127) & !127;
        let path = format!("/dev/shm/{}", name);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)
            .map_err(|e| {
                io::Error::new(
                    io::ErrorKind::Other,
                    format!("Failed to create shared memory file at {}: {}", path, e),
                )
            })?;

        if unsafe { libc::ftruncate(file.as_raw_fd(), aligned_size as i64) } != 0 {
            let err = io::Error::last_os_error();
            let _ = std::fs::remove_file(&path);
            return Err(err);
        }

        let fd = file.into_raw_fd();
        let mut mapping = Self::map(fd, aligned_size).map_err(|e| {
            let _ = std::fs::remove_file(&path);
            e
        })?;
        mapping.unlink_path = Some(path);
        Ok(mapping)
    }

    /// Open an existing file in /dev/shm and map all of it.
    fn attach(name: &str, min_size: usize) -> io::Result<Self> {
        let path = format!("/dev/shm/{}", name);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("Failed to open shared memory at {}: {}", path, e),
                )
            })?;

        let file_size = file.metadata()?.len() as usize;
        if file_size < min_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Shared memory size too small: expected at least {} bytes, got {}",
                    min_size, file_size
                ),
            ));
        }

        let fd = file.into_raw_fd();
        Self::map(fd, file_size)
    }

    fn map(fd: i32, size: usize) -> io::Result<Self> {
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }

        // /dev/shm mappings are page-aligned, which satisfies the 128-byte
        // stride the header layout relies on, but keep the check explicit.
        if (ptr as usize) % 128 != 0 {
            unsafe {
                libc::munmap(ptr, size);
                libc::close(fd);
            }
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Shared memory not properly aligned",
            ));
        }

        Ok(Self {
            ptr: NonNull::new(ptr as *mut u8).unwrap(),
            size,
            fd,
            unlink_path: None,
        })
    }
}

#[cfg(target_os = "linux")]
impl Drop for ShmFileMapping {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
            libc::close(self.fd);
        }
        if let Some(path) = self.unlink_path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(target_os = "linux")]
impl SmemBackend for ShmFileMapping {
    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn size(&self) -> usize {
        self.size
    }
}
