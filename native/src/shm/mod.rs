//! Named shared memory segments.
//!
//! POSIX targets resolve keys through `shm_open`, Windows through named file
//! mappings. Either way the segment is mapped read/write for the lifetime of
//! [`SharedSegment`].

#[cfg(unix)]
mod posix;
#[cfg(unix)]
use posix as sys;

#[cfg(windows)]
mod win32;
#[cfg(windows)]
use win32 as sys;

use log::debug;
use thiserror::Error;

use crate::record::ValidationError;

#[derive(Error, Debug)]
pub enum AttachError {
    #[error("Shared memory segment '{0}' not found")]
    NotFound(String),
    #[error("Shared memory segment '{key}' is {actual} bytes, expected {expected}")]
    WrongSize {
        key: String,
        actual: usize,
        expected: usize,
    },
    #[error("Invalid shared memory key '{0}'")]
    InvalidKey(String),
    #[error("Shared memory segment '{0}' no longer exists")]
    SegmentGone(String),
    #[error("Invalid window title: {0}")]
    Title(#[from] ValidationError),
    #[error("Shared memory '{key}': {source}")]
    Os {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

/// A mapped shared memory segment.
pub struct SharedSegment {
    key: String,
    mapping: sys::Mapping,
}

impl SharedSegment {
    /// Map an existing segment that must be exactly `size` bytes.
    pub fn open(key: &str, size: usize) -> Result<Self, AttachError> {
        check_key(key)?;
        let mapping = sys::Mapping::open(key, size)?;
        debug!("[SHM] Opened '{}' ({} bytes)", key, mapping.len());
        Ok(Self {
            key: key.to_string(),
            mapping,
        })
    }

    /// Create a fresh zero-filled segment. The segment is destroyed when this value drops.
    pub fn create(key: &str, size: usize) -> Result<Self, AttachError> {
        check_key(key)?;
        let mapping = sys::Mapping::create(key, size)?;
        debug!("[SHM] Created '{}' ({} bytes)", key, mapping.len());
        Ok(Self {
            key: key.to_string(),
            mapping,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn len(&self) -> usize {
        self.mapping.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mapping.len() == 0
    }

    pub fn is_owner(&self) -> bool {
        self.mapping.is_owner()
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.mapping.as_ptr()
    }

    /// Check that the key still resolves to this segment.
    ///
    /// Our own mapping keeps the memory valid after the host releases it, so a
    /// vanished segment is reported here rather than surfacing as a fault.
    pub fn verify(&self) -> Result<(), AttachError> {
        if self.mapping.still_linked() {
            Ok(())
        } else {
            Err(AttachError::SegmentGone(self.key.clone()))
        }
    }
}

// The mapping is plain memory owned by this value; moving it across threads is
// fine. It is not Sync: the record has one plugin-side writer.
unsafe impl Send for SharedSegment {}

fn check_key(key: &str) -> Result<(), AttachError> {
    let trimmed = key.trim_start_matches('/');
    if trimmed.is_empty() || trimmed.contains('/') || key.contains('\0') {
        return Err(AttachError::InvalidKey(key.to_string()));
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::host::test_key;

    #[test]
    fn open_missing_segment_fails() {
        let key = test_key("missing");
        match SharedSegment::open(&key, 720) {
            Err(AttachError::NotFound(k)) => assert_eq!(k, key),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("segment should not exist"),
        }
    }

    #[test]
    fn open_wrong_size_fails() {
        let key = test_key("size");
        let _owner = SharedSegment::create(&key, 512).unwrap();
        match SharedSegment::open(&key, 720) {
            Err(AttachError::WrongSize {
                actual, expected, ..
            }) => {
                assert_eq!(actual, 512);
                assert_eq!(expected, 720);
            }
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("size mismatch should be rejected"),
        }
    }

    #[test]
    fn two_mappings_share_memory() {
        let key = test_key("share");
        let owner = SharedSegment::create(&key, 64).unwrap();
        let other = SharedSegment::open(&key, 64).unwrap();
        assert!(owner.is_owner());
        assert!(!other.is_owner());

        unsafe { owner.as_ptr().add(3).write_volatile(0xAB) };
        assert_eq!(unsafe { other.as_ptr().add(3).read_volatile() }, 0xAB);
    }

    #[test]
    fn verify_reports_released_segment() {
        let key = test_key("gone");
        let owner = SharedSegment::create(&key, 64).unwrap();
        let plugin = SharedSegment::open(&key, 64).unwrap();
        assert!(plugin.verify().is_ok());

        drop(owner);
        assert!(matches!(plugin.verify(), Err(AttachError::SegmentGone(_))));
    }

    #[test]
    fn rejects_malformed_keys() {
        assert!(matches!(
            SharedSegment::open("", 8),
            Err(AttachError::InvalidKey(_))
        ));
        assert!(matches!(
            SharedSegment::open("a/b", 8),
            Err(AttachError::InvalidKey(_))
        ));
    }
}
