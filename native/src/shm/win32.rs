use super::AttachError;
use std::io;
use std::mem::size_of;
use std::ptr::NonNull;
use windows::core::HSTRING;
use windows::Win32::Foundation::{CloseHandle, ERROR_FILE_NOT_FOUND, HANDLE, INVALID_HANDLE_VALUE};
use windows::Win32::System::Memory::{
    CreateFileMappingW, MapViewOfFile, OpenFileMappingW, UnmapViewOfFile, VirtualQuery,
    FILE_MAP_ALL_ACCESS, MEMORY_BASIC_INFORMATION, MEMORY_MAPPED_VIEW_ADDRESS, PAGE_READWRITE,
};

pub(super) struct Mapping {
    handle: HANDLE,
    view: MEMORY_MAPPED_VIEW_ADDRESS,
    ptr: NonNull<u8>,
    len: usize,
    owner: bool,
}

impl Mapping {
    pub(super) fn open(key: &str, expected: usize) -> Result<Self, AttachError> {
        let name = HSTRING::from(key);
        let handle = unsafe { OpenFileMappingW(FILE_MAP_ALL_ACCESS.0, false, &name) }.map_err(
            |e| {
                if e.code() == ERROR_FILE_NOT_FOUND.to_hresult() {
                    AttachError::NotFound(key.to_string())
                } else {
                    os_error(key, e)
                }
            },
        )?;

        Self::map_handle(handle, key, expected, false)
    }

    pub(super) fn create(key: &str, size: usize) -> Result<Self, AttachError> {
        let name = HSTRING::from(key);
        let handle = unsafe {
            CreateFileMappingW(
                INVALID_HANDLE_VALUE,
                None,
                PAGE_READWRITE,
                0,
                size as u32,
                &name,
            )
        }
        .map_err(|e| os_error(key, e))?;

        Self::map_handle(handle, key, size, true)
    }

    fn map_handle(
        handle: HANDLE,
        key: &str,
        expected: usize,
        owner: bool,
    ) -> Result<Self, AttachError> {
        let view = unsafe { MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, 0) };
        let Some(ptr) = NonNull::new(view.Value as *mut u8) else {
            let err = windows::core::Error::from_thread();
            unsafe {
                let _ = CloseHandle(handle);
            }
            return Err(os_error(key, err));
        };

        // Views are rounded up to page granularity, so only an undersized
        // region can be detected here.
        let mut info = MEMORY_BASIC_INFORMATION::default();
        let written = unsafe {
            VirtualQuery(
                Some(view.Value),
                &mut info,
                size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };
        if written == 0 || info.RegionSize < expected {
            unsafe {
                let _ = UnmapViewOfFile(view);
                let _ = CloseHandle(handle);
            }
            return Err(AttachError::WrongSize {
                key: key.to_string(),
                actual: info.RegionSize,
                expected,
            });
        }

        Ok(Self {
            handle,
            view,
            ptr,
            len: expected,
            owner,
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

    /// An open view keeps the mapping object alive on Windows.
    pub(super) fn still_linked(&self) -> bool {
        true
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe {
            let _ = UnmapViewOfFile(self.view);
            let _ = CloseHandle(self.handle);
        }
    }
}

fn os_error(key: &str, error: windows::core::Error) -> AttachError {
    AttachError::Os {
        key: key.to_string(),
        source: io::Error::other(error.to_string()),
    }
}
