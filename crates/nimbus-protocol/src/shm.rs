// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! POSIX named shared-memory regions for oversize payloads.
//!
//! Payloads that exceed the inline capacity of a control message travel
//! through a named region. The gateway creates `input:<full_call_id>`
//! before dispatching a call and opens `output:<full_call_id>` after its
//! completion; whichever side owns a region arranges for the OS object to
//! be unlinked when the owner is dropped.

use std::fs::File;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

use nix::fcntl::OFlag;
use nix::sys::mman::{MapFlags, ProtFlags, mmap, munmap, shm_open, shm_unlink};
use nix::sys::stat::Mode;
use thiserror::Error;

/// Errors from shared-memory operations.
#[derive(Debug, Error)]
pub enum ShmError {
    #[error("failed to create shm region '{name}': {errno}")]
    Create { name: String, errno: nix::Error },

    #[error("failed to open shm region '{name}': {errno}")]
    Open { name: String, errno: nix::Error },

    #[error("failed to map shm region '{name}': {errno}")]
    Map { name: String, errno: nix::Error },
}

/// Name of the input region for a call.
pub fn input_shm_name(full_call_id: u64) -> String {
    format!("input:{}", full_call_id)
}

/// Name of the output region for a call.
pub fn output_shm_name(full_call_id: u64) -> String {
    format!("output:{}", full_call_id)
}

/// A mapped named shared-memory region.
///
/// Zero-sized regions are valid: the OS object exists but nothing is
/// mapped and the data view is empty. Dropping the region unmaps it and,
/// if [`enable_remove_on_drop`](Self::enable_remove_on_drop) was called,
/// unlinks the OS object.
#[derive(Debug)]
pub struct ShmRegion {
    name: String,
    base: Option<NonNull<std::ffi::c_void>>,
    size: usize,
    remove_on_drop: bool,
}

// The mapping is uniquely owned by this value and stays valid until Drop;
// data access goes through &self / &mut self borrows.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

impl ShmRegion {
    /// Create a new region of `size` bytes. Fails if the name exists.
    pub fn create(name: &str, size: usize) -> Result<Self, ShmError> {
        let os_name = os_name(name);
        let fd = shm_open(
            os_name.as_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|errno| ShmError::Create {
            name: name.to_string(),
            errno,
        })?;
        let file = File::from(fd);
        if let Err(err) = file.set_len(size as u64) {
            let _ = shm_unlink(os_name.as_str());
            return Err(ShmError::Create {
                name: name.to_string(),
                errno: nix::Error::from_raw(err.raw_os_error().unwrap_or(0)),
            });
        }
        let base = match Self::map(&file, name, size) {
            Ok(base) => base,
            Err(e) => {
                let _ = shm_unlink(os_name.as_str());
                return Err(e);
            }
        };
        Ok(Self {
            name: name.to_string(),
            base,
            size,
            remove_on_drop: false,
        })
    }

    /// Open an existing region, taking its size from the OS object.
    pub fn open(name: &str) -> Result<Self, ShmError> {
        let os_name = os_name(name);
        let fd = shm_open(os_name.as_str(), OFlag::O_RDWR, Mode::empty()).map_err(|errno| {
            ShmError::Open {
                name: name.to_string(),
                errno,
            }
        })?;
        let file = File::from(fd);
        let size = file
            .metadata()
            .map_err(|err| ShmError::Open {
                name: name.to_string(),
                errno: nix::Error::from_raw(err.raw_os_error().unwrap_or(0)),
            })?
            .len() as usize;
        let base = Self::map(&file, name, size)?;
        Ok(Self {
            name: name.to_string(),
            base,
            size,
            remove_on_drop: false,
        })
    }

    fn map(
        fd: &File,
        name: &str,
        size: usize,
    ) -> Result<Option<NonNull<std::ffi::c_void>>, ShmError> {
        let Some(len) = NonZeroUsize::new(size) else {
            return Ok(None);
        };
        let base = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd,
                0,
            )
        }
        .map_err(|errno| ShmError::Map {
            name: name.to_string(),
            errno,
        })?;
        Ok(Some(base))
    }

    /// Logical region name (without the leading slash of the OS object).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Size of the region in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Borrowed view of the region's bytes.
    pub fn as_slice(&self) -> &[u8] {
        match self.base {
            Some(base) => unsafe {
                std::slice::from_raw_parts(base.as_ptr().cast::<u8>(), self.size)
            },
            None => &[],
        }
    }

    /// Mutable view of the region's bytes.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self.base {
            Some(base) => unsafe {
                std::slice::from_raw_parts_mut(base.as_ptr().cast::<u8>(), self.size)
            },
            None => &mut [],
        }
    }

    /// Unlink the OS object when this region is dropped.
    pub fn enable_remove_on_drop(&mut self) {
        self.remove_on_drop = true;
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        if let Some(base) = self.base.take() {
            let _ = unsafe { munmap(base, self.size) };
        }
        if self.remove_on_drop {
            let _ = shm_unlink(os_name(&self.name).as_str());
        }
    }
}

fn os_name(name: &str) -> String {
    format!("/{}", name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!("nimbus-test-{}-{}", tag, std::process::id())
    }

    fn shm_object_exists(name: &str) -> bool {
        std::path::Path::new("/dev/shm").join(name).exists()
    }

    #[test]
    fn test_create_write_open_read() {
        let name = unique_name("rw");
        let mut region = ShmRegion::create(&name, 16).unwrap();
        region.as_mut_slice().copy_from_slice(b"0123456789abcdef");

        let opened = ShmRegion::open(&name).unwrap();
        assert_eq!(opened.size(), 16);
        assert_eq!(opened.as_slice(), b"0123456789abcdef");

        region.enable_remove_on_drop();
        drop(opened);
        drop(region);
        assert!(!shm_object_exists(&name));
    }

    #[test]
    fn test_zero_size_region() {
        let name = unique_name("zero");
        let mut region = ShmRegion::create(&name, 0).unwrap();
        assert_eq!(region.size(), 0);
        assert!(region.as_slice().is_empty());
        region.enable_remove_on_drop();
        drop(region);
        assert!(!shm_object_exists(&name));
    }

    #[test]
    fn test_create_exclusive() {
        let name = unique_name("excl");
        let mut region = ShmRegion::create(&name, 8).unwrap();
        region.enable_remove_on_drop();
        assert!(matches!(
            ShmRegion::create(&name, 8),
            Err(ShmError::Create { .. })
        ));
    }

    #[test]
    fn test_open_missing() {
        assert!(matches!(
            ShmRegion::open(&unique_name("missing")),
            Err(ShmError::Open { .. })
        ));
    }

    #[test]
    fn test_region_names() {
        assert_eq!(input_shm_name(42), "input:42");
        assert_eq!(output_shm_name(42), "output:42");
    }
}
