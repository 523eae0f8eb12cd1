//! Per-context file-descriptor table.
//!
//! Guest fds are small local integers with no relation to host descriptors.
//! Ids are never reused within a context; anything still open at invocation
//! end is closed by `close_all`.

use std::collections::HashMap;
use std::fs;

use funclite_shared::{FuncliteError, FuncliteResult};

use super::VirtualFs;

/// Open disposition parsed from the node-style flag string.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub create: bool,
    pub truncate: bool,
}

impl OpenFlags {
    pub fn parse(flags: &str) -> FuncliteResult<Self> {
        let f = match flags {
            "r" => Self { read: true, write: false, append: false, create: false, truncate: false },
            "r+" => Self { read: true, write: true, append: false, create: false, truncate: false },
            "w" => Self { read: false, write: true, append: false, create: true, truncate: true },
            "w+" => Self { read: true, write: true, append: false, create: true, truncate: true },
            "a" => Self { read: false, write: true, append: true, create: true, truncate: false },
            "a+" => Self { read: true, write: true, append: true, create: true, truncate: false },
            other => {
                return Err(FuncliteError::InvalidArgument(format!(
                    "unsupported open flags: {}",
                    other
                )));
            }
        };
        Ok(f)
    }

    pub(crate) fn to_open_options(self) -> fs::OpenOptions {
        let mut opts = fs::OpenOptions::new();
        opts.read(self.read)
            .write(self.write)
            .append(self.append)
            .create(self.create)
            .truncate(self.truncate);
        opts
    }
}

/// Small fd space local to one execution context.
#[derive(Debug, Default)]
pub struct FdTable {
    // Start above the conventional stdio range.
    next_fd: u32,
    open: HashMap<u32, fs::File>,
}

impl FdTable {
    pub fn new() -> Self {
        Self { next_fd: 3, open: HashMap::new() }
    }

    pub fn open(&mut self, vfs: &VirtualFs, guest_path: &str, flags: &str) -> FuncliteResult<u32> {
        let flags = OpenFlags::parse(flags)?;
        let file = vfs.open_host(guest_path, flags)?;
        let fd = self.next_fd;
        self.next_fd += 1;
        self.open.insert(fd, file);
        Ok(fd)
    }

    pub fn read(&mut self, fd: u32, length: usize, position: Option<u64>) -> FuncliteResult<Vec<u8>> {
        let file = self.get_mut(fd)?;
        super::read_at(file, length, position)
    }

    pub fn write(&mut self, fd: u32, data: &[u8], position: Option<u64>) -> FuncliteResult<usize> {
        let file = self.get_mut(fd)?;
        super::write_at(file, data, position)
    }

    pub fn close(&mut self, fd: u32) -> FuncliteResult<()> {
        self.open
            .remove(&fd)
            .map(|_| ())
            .ok_or_else(|| FuncliteError::InvalidArgument(format!("bad file descriptor: {}", fd)))
    }

    /// Close every leaked descriptor. Called by context cleanup.
    pub fn close_all(&mut self) -> usize {
        let leaked = self.open.len();
        self.open.clear();
        leaked
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    fn get_mut(&mut self, fd: u32) -> FuncliteResult<&mut fs::File> {
        self.open
            .get_mut(&fd)
            .ok_or_else(|| FuncliteError::InvalidArgument(format!("bad file descriptor: {}", fd)))
    }
}
