//! Native handles: the mapped telemetry view and the data-valid event.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, Ordering, fence};
use std::time::Duration;
use tracing::{debug, trace};
use windows::Win32::Foundation::{CloseHandle, ERROR_FILE_NOT_FOUND, HANDLE, WAIT_OBJECT_0, WAIT_TIMEOUT};
use windows::Win32::System::Memory::{
    FILE_MAP_READ, MEMORY_BASIC_INFORMATION, MEMORY_MAPPED_VIEW_ADDRESS, MapViewOfFile,
    OpenFileMappingW, UnmapViewOfFile, VirtualQuery,
};
use windows::Win32::System::Threading::{OpenEventW, SYNCHRONIZATION_ACCESS_RIGHTS, WaitForSingleObject};
use windows::core::PCWSTR;

use crate::memory::{SharedRegion, check_bounds, check_word};
use crate::signal::{DataReadySignal, WaitResult};
use crate::{ConnectionError, Result};

const SYNCHRONIZE: u32 = 0x0010_0000;

/// Whether a Win32 error means the named object does not exist (simulator
/// not running).
pub(crate) fn is_not_found(error: &windows::core::Error) -> bool {
    error.code() == ERROR_FILE_NOT_FOUND.to_hresult()
}

/// Convert string to null-terminated wide string for Windows APIs
pub(crate) fn wide_string(s: &str) -> Vec<u16> {
    use std::ffi::OsStr;
    use std::os::windows::ffi::OsStrExt;
    OsStr::new(s).encode_wide().chain(std::iter::once(0)).collect()
}

fn timeout_millis(timeout: Duration) -> u32 {
    // INFINITE is u32::MAX; cap just below it so a huge timeout stays finite.
    timeout.as_millis().min((u32::MAX - 1) as u128) as u32
}

/// Read-only view of the telemetry file mapping.
pub struct MappedView {
    mapping: HANDLE,
    base: NonNull<u8>,
    len: usize,
}

impl MappedView {
    /// Open and map `name`. `Ok(None)` when the mapping does not exist.
    pub fn open(name: &str) -> Result<Option<Self>> {
        let wide_name = wide_string(name);
        let mapping = match unsafe {
            OpenFileMappingW(FILE_MAP_READ.0, false, PCWSTR::from_raw(wide_name.as_ptr()))
        } {
            Ok(mapping) => mapping,
            Err(e) if is_not_found(&e) => {
                trace!(name, "Telemetry mapping not present");
                return Ok(None);
            }
            Err(e) => return Err(ConnectionError::windows_api_error("OpenFileMappingW", e)),
        };

        let view = unsafe { MapViewOfFile(mapping, FILE_MAP_READ, 0, 0, 0) };
        let Some(base) = NonNull::new(view.Value as *mut u8) else {
            let win_err = windows::core::Error::from_thread();
            unsafe {
                let _ = CloseHandle(mapping);
            }
            return Err(ConnectionError::windows_api_error("MapViewOfFile", win_err));
        };

        let mut info = MEMORY_BASIC_INFORMATION::default();
        let written = unsafe {
            VirtualQuery(
                Some(base.as_ptr() as *const _),
                &mut info,
                std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };

        let view = Self { mapping, base, len: info.RegionSize };
        if written == 0 {
            let win_err = windows::core::Error::from_thread();
            return Err(ConnectionError::windows_api_error("VirtualQuery", win_err));
        }

        debug!(name, bytes = view.len, "Mapped telemetry view");
        Ok(Some(view))
    }
}

impl SharedRegion for MappedView {
    fn len(&self) -> usize {
        self.len
    }

    fn load_i32(&self, offset: usize) -> Result<i32> {
        check_word(offset, self.len)?;
        // SAFETY: in bounds and 4-aligned (the view base is page aligned);
        // the simulator only writes this memory with aligned word stores.
        let value = unsafe {
            let ptr = self.base.as_ptr().add(offset) as *mut i32;
            AtomicI32::from_ptr(ptr).load(Ordering::Acquire)
        };
        Ok(value)
    }

    fn copy_into(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        check_bounds(offset, dst.len(), self.len)?;
        // SAFETY: bounds checked above. The bytes may change while copying;
        // callers validate them against a revision counter.
        unsafe {
            std::ptr::copy_nonoverlapping(self.base.as_ptr().add(offset), dst.as_mut_ptr(), dst.len());
        }
        fence(Ordering::Acquire);
        Ok(())
    }
}

impl Drop for MappedView {
    fn drop(&mut self) {
        unsafe {
            let addr = MEMORY_MAPPED_VIEW_ADDRESS { Value: self.base.as_ptr() as *mut _ };
            let _ = UnmapViewOfFile(addr);
            let _ = CloseHandle(self.mapping);
        }
        debug!("Unmapped telemetry view");
    }
}

// SAFETY: the view is read-only and the handle is a kernel object usable from
// any thread.
unsafe impl Send for MappedView {}
unsafe impl Sync for MappedView {}

/// The simulator's auto-reset data-valid event, opened by name.
pub struct NamedEvent {
    event: HANDLE,
}

impl NamedEvent {
    /// Open `name` for waiting. `Ok(None)` when the event does not exist.
    pub fn open(name: &str) -> Result<Option<Self>> {
        let wide_name = wide_string(name);
        match unsafe {
            OpenEventW(SYNCHRONIZATION_ACCESS_RIGHTS(SYNCHRONIZE), false, PCWSTR::from_raw(wide_name.as_ptr()))
        } {
            Ok(event) => Ok(Some(Self { event })),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(ConnectionError::windows_api_error("OpenEventW", e)),
        }
    }
}

impl DataReadySignal for NamedEvent {
    fn wait(&self, timeout: Duration) -> Result<WaitResult> {
        let result = unsafe { WaitForSingleObject(self.event, timeout_millis(timeout)) };

        match result {
            WAIT_OBJECT_0 => Ok(WaitResult::Signaled),
            WAIT_TIMEOUT => Ok(WaitResult::Timeout),
            _ => {
                let win_err = windows::core::Error::from_thread();
                Err(ConnectionError::windows_api_error("WaitForSingleObject", win_err))
            }
        }
    }
}

impl Drop for NamedEvent {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.event);
        }
    }
}

// SAFETY: event handles are thread-safe kernel objects.
unsafe impl Send for NamedEvent {}
unsafe impl Sync for NamedEvent {}

#[cfg(all(test, windows))]
mod tests {
    use super::*;

    #[test]
    fn timeouts_never_become_infinite() {
        assert_eq!(timeout_millis(Duration::from_millis(250)), 250);
        assert_eq!(timeout_millis(Duration::MAX), u32::MAX - 1);
    }

    #[test]
    fn wide_strings_are_nul_terminated() {
        let wide = wide_string("IRSDK");
        assert_eq!(wide.len(), 6);
        assert_eq!(wide.last(), Some(&0));
    }

    #[test]
    fn missing_objects_are_not_errors() {
        assert!(MappedView::open("Local\\PitwallConnectMissingMapping").unwrap().is_none());
        assert!(NamedEvent::open("Local\\PitwallConnectMissingEvent").unwrap().is_none());
    }
}
