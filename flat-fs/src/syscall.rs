//! File-system syscalls for user threads.
//!
//! Every call returns `-1` on failure; the cause is only logged.

use log::error;
use log::warn;

use crate::fd_table::FdTable;
use crate::file_table::Mode;
use crate::fs::{FileSystem, Whence};

pub fn sys_format(fs: &FileSystem, files: i32) -> isize {
    let Ok(files) = u32::try_from(files) else {
        return -1;
    };

    match fs.format(files) {
        Ok(()) => 0,
        Err(err) => {
            error!("format: {err}");
            -1
        }
    }
}

/// open `name` with one of the mode strings `"r"`, `"w"`, `"w+"`, `"a"`, returning the new fd
pub fn sys_open(fs: &FileSystem, fds: &mut FdTable, name: &str, mode: &str) -> isize {
    let mode: Mode = match mode.parse() {
        Ok(mode) => mode,
        Err(err) => {
            warn!("open {name:?}: {err} {mode:?}");
            return -1;
        }
    };

    let entry = match fs.open(name, mode) {
        Ok(entry) => entry,
        Err(err) => {
            warn!("open {name:?}: {err}");
            return -1;
        }
    };

    match fds.insert(entry.clone()) {
        Some(fd) => fd as isize,
        None => {
            error!("open {name:?}: descriptor table is full");
            if let Err(err) = fs.close(&entry) {
                error!("close {name:?}: {err}");
            }
            -1
        }
    }
}

pub fn sys_read(fs: &FileSystem, fds: &FdTable, fd: usize, buf: &mut [u8]) -> isize {
    let Some(entry) = fds.get(fd) else {
        return -1;
    };

    match fs.read(entry, buf) {
        Ok(read) => read as isize,
        Err(err) => {
            error!("read fd {fd}: {err}");
            -1
        }
    }
}

pub fn sys_write(fs: &FileSystem, fds: &FdTable, fd: usize, buf: &[u8]) -> isize {
    let Some(entry) = fds.get(fd) else {
        return -1;
    };

    match fs.write(entry, buf) {
        Ok(written) => written as isize,
        Err(err) => {
            error!("write fd {fd}: {err}");
            -1
        }
    }
}

/// `whence`: 0 from start, 1 from the current position, 2 from the end
pub fn sys_seek(fs: &FileSystem, fds: &FdTable, fd: usize, offset: i64, whence: i32) -> isize {
    let Some(entry) = fds.get(fd) else {
        return -1;
    };

    match Whence::try_from(whence).and_then(|whence| fs.seek(entry, offset, whence)) {
        Ok(position) => position as isize,
        Err(err) => {
            error!("seek fd {fd}: {err}");
            -1
        }
    }
}

pub fn sys_close(fs: &FileSystem, fds: &mut FdTable, fd: usize) -> isize {
    let Some(entry) = fds.remove(fd) else {
        return -1;
    };

    match fs.close(&entry) {
        Ok(()) => 0,
        Err(err) => {
            error!("close fd {fd}: {err}");
            -1
        }
    }
}

pub fn sys_delete(fs: &FileSystem, name: &str) -> isize {
    match fs.delete(name) {
        Ok(()) => 0,
        Err(err) => {
            warn!("delete {name:?}: {err}");
            -1
        }
    }
}

pub fn sys_fsize(fs: &FileSystem, fds: &FdTable, fd: usize) -> isize {
    let Some(entry) = fds.get(fd) else {
        return -1;
    };

    match fs.fsize(entry) {
        Ok(size) => size as isize,
        Err(err) => {
            error!("fsize fd {fd}: {err}");
            -1
        }
    }
}
