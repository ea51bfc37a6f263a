//! Open resources and the per-process descriptor table.
//!
//! The kernel core does not know what a descriptor refers to. Consoles, pipes and files
//! live behind [`OpenFile`]; a process holds up to [`NOFILE`] shared handles to them.

use crate::hal::Hal;
use crate::param::NOFILE;
use crate::proc::{Pid, ProcError, ProcState};
use crate::Kernel;
use alloc::sync::Arc;

/// Something a descriptor can refer to.
pub trait OpenFile: Send + Sync {
    /// Reads into `buffer`, returning how many bytes arrived.
    fn read(&self, buffer: &mut [u8]) -> Result<usize, FileError>;

    /// Writes `data`, returning how many bytes were taken.
    fn write(&self, data: &[u8]) -> Result<usize, FileError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileError {
    NotReadable,
    NotWritable,
    /// The descriptor is out of range or not open
    BadDescriptor,
    /// Every descriptor slot is in use
    NoFreeDescriptor,
    /// The device behind the file failed
    Io,
}

impl<H: Hal> Kernel<H> {
    /// The file open at `fd` in the running process.
    pub(crate) fn file(&self, fd: usize) -> Result<Arc<dyn OpenFile>, FileError> {
        let private = unsafe { self.private(self.myproc()) };
        private
            .files
            .get(fd)
            .and_then(Option::clone)
            .ok_or(FileError::BadDescriptor)
    }

    /// Opens `file` at the lowest free descriptor of the running process.
    pub(crate) fn fd_alloc(&self, file: Arc<dyn OpenFile>) -> Result<usize, FileError> {
        let private = unsafe { self.private(self.myproc()) };
        install(&mut private.files, file)
    }

    pub(crate) fn fd_close(&self, fd: usize) -> Result<(), FileError> {
        let private = unsafe { self.private(self.myproc()) };
        private
            .files
            .get_mut(fd)
            .and_then(Option::take)
            .map(drop)
            .ok_or(FileError::BadDescriptor)
    }

    /// Opens `file` at the lowest free descriptor of `pid`, which must not be running.
    /// Used to hand the first process its console.
    pub fn install_file(&self, pid: Pid, file: Arc<dyn OpenFile>) -> Result<usize, ProcError> {
        let table = self.lock_table();
        let slot = table
            .slot_of(pid)
            .filter(|&slot| {
                matches!(
                    table.procs[slot].state,
                    ProcState::Embryo | ProcState::Runnable | ProcState::Sleeping
                )
            })
            .ok_or(ProcError::NoSuchProcess)?;
        let private = unsafe { self.private(slot) };
        install(&mut private.files, file).map_err(|_| ProcError::TableFull)
    }
}

fn install(
    files: &mut [Option<Arc<dyn OpenFile>>; NOFILE],
    file: Arc<dyn OpenFile>,
) -> Result<usize, FileError> {
    let fd = files
        .iter()
        .position(Option::is_none)
        .ok_or(FileError::NoFreeDescriptor)?;
    files[fd] = Some(file);
    Ok(fd)
}
