use super::AttachError;
use std::ffi::CString;
use std::io;
use std::ptr::{self, NonNull};

pub(super) struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
    name: CString,
    owner: bool,
    identity: (u64, u64),
}

impl Mapping {
    pub(super) fn open(key: &str, expected: usize) -> Result<Self, AttachError> {
        let name = posix_name(key)?;

        let fd = unsafe { libc::shm_open(name.as_ptr(), libc::O_RDWR, 0o600 as libc::c_uint) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            return Err(if err.kind() == io::ErrorKind::NotFound {
                AttachError::NotFound(key.to_string())
            } else {
                os_error(key, err)
            });
        }

        let result = Self::map_fd(fd, key, name, expected, false);
        unsafe { libc::close(fd) };
        result
    }

    pub(super) fn create(key: &str, size: usize) -> Result<Self, AttachError> {
        let name = posix_name(key)?;

        let fd = unsafe {
            libc::shm_open(
                name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600 as libc::c_uint,
            )
        };
        if fd < 0 {
            return Err(os_error(key, io::Error::last_os_error()));
        }

        if unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(fd);
                libc::shm_unlink(name.as_ptr());
            }
            return Err(os_error(key, err));
        }

        let result = Self::map_fd(fd, key, name.clone(), size, true);
        unsafe { libc::close(fd) };
        if result.is_err() {
            unsafe { libc::shm_unlink(name.as_ptr()) };
        }
        result
    }

    fn map_fd(
        fd: libc::c_int,
        key: &str,
        name: CString,
        expected: usize,
        owner: bool,
    ) -> Result<Self, AttachError> {
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut stat) } != 0 {
            return Err(os_error(key, io::Error::last_os_error()));
        }

        let actual = stat.st_size as usize;
        if actual != expected {
            return Err(AttachError::WrongSize {
                key: key.to_string(),
                actual,
                expected,
            });
        }

        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                expected,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(os_error(key, io::Error::last_os_error()));
        }

        let ptr = NonNull::new(addr as *mut u8)
            .ok_or_else(|| os_error(key, io::Error::other("mmap returned null")))?;

        Ok(Self {
            ptr,
            len: expected,
            name,
            owner,
            identity: (stat.st_dev as u64, stat.st_ino as u64),
        })
    }

    pub(super) fn len(&self) -> usize {
        self.len
    }

    pub(super) fn is_owner(&self) -> bool {
        self.owner
    }

    pub(super) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// The name still resolves to the object we mapped.
    pub(super) fn still_linked(&self) -> bool {
        let fd = unsafe { libc::shm_open(self.name.as_ptr(), libc::O_RDONLY, 0 as libc::c_uint) };
        if fd < 0 {
            return false;
        }

        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        let same = unsafe { libc::fstat(fd, &mut stat) } == 0
            && (stat.st_dev as u64, stat.st_ino as u64) == self.identity;
        unsafe { libc::close(fd) };
        same
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
            if self.owner {
                libc::shm_unlink(self.name.as_ptr());
            }
        }
    }
}

fn posix_name(key: &str) -> Result<CString, AttachError> {
    let name = if key.starts_with('/') {
        key.to_string()
    } else {
        format!("/{}", key)
    };
    CString::new(name).map_err(|_| AttachError::InvalidKey(key.to_string()))
}

fn os_error(key: &str, source: io::Error) -> AttachError {
    AttachError::Os {
        key: key.to_string(),
        source,
    }
}
