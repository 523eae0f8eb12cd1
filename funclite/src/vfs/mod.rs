//! Virtual filesystem rooted at the guest `/app` tree.
//!
//! Maps guest-visible paths onto the host package directory and enforces
//! confinement: every traversal that resolves outside the package root fails
//! with `PermissionDenied`, and error messages never reveal host paths.

mod fd;

pub use fd::{FdTable, OpenFlags};

use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use funclite_shared::{FuncliteError, FuncliteResult};
use serde::Serialize;

use crate::bridge::encoding::{decode_string, encode_bytes};

/// Guest mount point for the package.
pub const GUEST_ROOT: &str = funclite_shared::constants::guest::APP_ROOT;

/// Stat record in guest terms. Times are ISO-8601 strings.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStat {
    pub is_file: bool,
    pub is_directory: bool,
    pub is_symbolic_link: bool,
    pub size: u64,
    pub mode: u32,
    pub mtime: String,
    pub atime: String,
    pub ctime: String,
}

/// Lexically normalize a guest path: collapse `.` and `..`, convert `\` to
/// `/`, clamp `..` at the root. Relative inputs are resolved against `/app`.
pub fn normalize_guest_path(input: &str) -> String {
    let unified = input.replace('\\', "/");
    let mut parts: Vec<&str> = Vec::new();
    let absolute = unified.starts_with('/');
    let base: Vec<&str> = if absolute {
        Vec::new()
    } else {
        GUEST_ROOT.split('/').filter(|p| !p.is_empty()).collect()
    };
    parts.extend(base);
    for seg in unified.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    let mut out = String::from("/");
    out.push_str(&parts.join("/"));
    out
}

/// Virtual filesystem over one resolved package directory.
#[derive(Clone, Debug)]
pub struct VirtualFs {
    root: PathBuf,
}

impl VirtualFs {
    /// Create a VFS over the package directory.
    ///
    /// The directory must exist; it is canonicalised once so later symlink
    /// checks compare against a stable prefix.
    pub fn new(package_root: impl AsRef<Path>) -> FuncliteResult<Self> {
        let root = package_root.as_ref().canonicalize().map_err(|_| {
            FuncliteError::Internal("package directory is not accessible".into())
        })?;
        Ok(Self { root })
    }

    /// Host root this VFS serves. Not exposed to guests.
    pub fn host_root(&self) -> &Path {
        &self.root
    }

    /// Resolve a guest path to a host path, enforcing confinement.
    ///
    /// The returned path may not exist (write targets); in that case the
    /// deepest existing ancestor is checked against the root instead.
    pub fn resolve(&self, guest_path: &str) -> FuncliteResult<PathBuf> {
        let normalized = normalize_guest_path(guest_path);
        // `/application` must not pass as `/app` + `lication`.
        let rel = match normalized.strip_prefix(GUEST_ROOT) {
            Some(rest) if rest.is_empty() || rest.starts_with('/') => {
                rest.trim_start_matches('/')
            }
            _ => return Err(escape_error(guest_path)),
        };
        let host = if rel.is_empty() {
            self.root.clone()
        } else {
            self.root.join(rel)
        };
        self.verify_within_root(&host, guest_path)?;
        Ok(host)
    }

    /// Guest-visible form of a normalized path (for `realpath`-style APIs).
    pub fn to_guest_path(&self, guest_path: &str) -> String {
        normalize_guest_path(guest_path)
    }

    // Canonicalise the deepest existing ancestor and require it to sit under
    // the canonical root. Symbolic links that lead outside the package are
    // rejected here.
    fn verify_within_root(&self, host: &Path, guest_path: &str) -> FuncliteResult<()> {
        let mut probe = host.to_path_buf();
        loop {
            match probe.canonicalize() {
                Ok(real) => {
                    if real.starts_with(&self.root) {
                        return Ok(());
                    }
                    return Err(escape_error(guest_path));
                }
                Err(_) => match probe.parent() {
                    Some(parent) => probe = parent.to_path_buf(),
                    None => return Err(escape_error(guest_path)),
                },
            }
        }
    }

    // ------------------------------------------------------------------
    // Read operations
    // ------------------------------------------------------------------

    pub fn read_file(&self, guest_path: &str) -> FuncliteResult<Vec<u8>> {
        let host = self.resolve(guest_path)?;
        fs::read(&host).map_err(|e| io_error(e, guest_path))
    }

    /// Read and decode under a named encoding.
    pub fn read_file_string(&self, guest_path: &str, encoding: &str) -> FuncliteResult<String> {
        let bytes = self.read_file(guest_path)?;
        encode_bytes(&bytes, encoding)
    }

    /// Sorted directory listing.
    pub fn read_dir(&self, guest_path: &str) -> FuncliteResult<Vec<String>> {
        let host = self.resolve(guest_path)?;
        let meta = fs::metadata(&host).map_err(|e| io_error(e, guest_path))?;
        if !meta.is_dir() {
            return Err(FuncliteError::InvalidArgument(format!(
                "not a directory: {}",
                display_path(guest_path)
            )));
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&host).map_err(|e| io_error(e, guest_path))? {
            let entry = entry.map_err(|e| io_error(e, guest_path))?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    pub fn stat(&self, guest_path: &str) -> FuncliteResult<FileStat> {
        let host = self.resolve(guest_path)?;
        let meta = fs::metadata(&host).map_err(|e| io_error(e, guest_path))?;
        Ok(stat_from_metadata(&meta))
    }

    /// Like `stat` but does not follow a final symlink.
    pub fn lstat(&self, guest_path: &str) -> FuncliteResult<FileStat> {
        let host = self.resolve(guest_path)?;
        let meta = fs::symlink_metadata(&host).map_err(|e| io_error(e, guest_path))?;
        Ok(stat_from_metadata(&meta))
    }

    pub fn exists(&self, guest_path: &str) -> bool {
        match self.resolve(guest_path) {
            Ok(host) => host.exists(),
            Err(_) => false,
        }
    }

    pub fn is_file(&self, guest_path: &str) -> bool {
        match self.resolve(guest_path) {
            Ok(host) => host.is_file(),
            Err(_) => false,
        }
    }

    /// `access(2)`-style check. Mode bits: 4 read, 2 write, 1 execute.
    pub fn access(&self, guest_path: &str, mode: u32) -> FuncliteResult<()> {
        let host = self.resolve(guest_path)?;
        let meta = fs::metadata(&host).map_err(|e| io_error(e, guest_path))?;
        if mode & 2 != 0 && meta.permissions().readonly() {
            return Err(FuncliteError::PermissionDenied(format!(
                "not writable: {}",
                display_path(guest_path)
            )));
        }
        #[cfg(unix)]
        if mode & 1 != 0 {
            use std::os::unix::fs::PermissionsExt;
            if meta.permissions().mode() & 0o111 == 0 {
                return Err(FuncliteError::PermissionDenied(format!(
                    "not executable: {}",
                    display_path(guest_path)
                )));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Write family (confined to the root)
    // ------------------------------------------------------------------

    pub fn write_file(&self, guest_path: &str, data: &[u8]) -> FuncliteResult<()> {
        let host = self.resolve(guest_path)?;
        fs::write(&host, data).map_err(|e| io_error(e, guest_path))
    }

    /// Write a string under a named encoding.
    pub fn write_file_string(
        &self,
        guest_path: &str,
        data: &str,
        encoding: &str,
    ) -> FuncliteResult<()> {
        let bytes = decode_string(data, encoding)?;
        self.write_file(guest_path, &bytes)
    }

    pub fn append_file(&self, guest_path: &str, data: &[u8]) -> FuncliteResult<()> {
        let host = self.resolve(guest_path)?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&host)
            .map_err(|e| io_error(e, guest_path))?;
        file.write_all(data).map_err(|e| io_error(e, guest_path))
    }

    pub fn mkdir(&self, guest_path: &str, recursive: bool) -> FuncliteResult<()> {
        let host = self.resolve(guest_path)?;
        let result = if recursive {
            fs::create_dir_all(&host)
        } else {
            fs::create_dir(&host)
        };
        result.map_err(|e| io_error(e, guest_path))
    }

    pub fn unlink(&self, guest_path: &str) -> FuncliteResult<()> {
        let host = self.resolve(guest_path)?;
        fs::remove_file(&host).map_err(|e| io_error(e, guest_path))
    }

    pub fn rmdir(&self, guest_path: &str, recursive: bool) -> FuncliteResult<()> {
        let host = self.resolve(guest_path)?;
        let result = if recursive {
            fs::remove_dir_all(&host)
        } else {
            fs::remove_dir(&host)
        };
        result.map_err(|e| io_error(e, guest_path))
    }

    pub fn rename(&self, from: &str, to: &str) -> FuncliteResult<()> {
        let host_from = self.resolve(from)?;
        let host_to = self.resolve(to)?;
        fs::rename(&host_from, &host_to).map_err(|e| io_error(e, from))
    }

    pub fn copy_file(&self, from: &str, to: &str) -> FuncliteResult<()> {
        let host_from = self.resolve(from)?;
        let host_to = self.resolve(to)?;
        fs::copy(&host_from, &host_to)
            .map(|_| ())
            .map_err(|e| io_error(e, from))
    }

    pub fn truncate(&self, guest_path: &str, len: u64) -> FuncliteResult<()> {
        let host = self.resolve(guest_path)?;
        let file = fs::OpenOptions::new()
            .write(true)
            .open(&host)
            .map_err(|e| io_error(e, guest_path))?;
        file.set_len(len).map_err(|e| io_error(e, guest_path))
    }

    /// Ownership and permission bits of host-backed files are not the
    /// guest's to change, even inside the root.
    pub fn chmod(&self, guest_path: &str, _mode: u32) -> FuncliteResult<()> {
        // Resolve first so escapes and missing files report consistently.
        let host = self.resolve(guest_path)?;
        if !host.exists() {
            return Err(FuncliteError::NotFound(format!(
                "no such file or directory: {}",
                display_path(guest_path)
            )));
        }
        Err(FuncliteError::PermissionDenied(
            "changing file modes is not permitted".into(),
        ))
    }

    pub fn chown(&self, guest_path: &str, _uid: u32, _gid: u32) -> FuncliteResult<()> {
        let host = self.resolve(guest_path)?;
        if !host.exists() {
            return Err(FuncliteError::NotFound(format!(
                "no such file or directory: {}",
                display_path(guest_path)
            )));
        }
        Err(FuncliteError::PermissionDenied(
            "changing file ownership is not permitted".into(),
        ))
    }

    // ------------------------------------------------------------------
    // Fd-level access (used by the per-context fd table)
    // ------------------------------------------------------------------

    pub(crate) fn open_host(
        &self,
        guest_path: &str,
        flags: OpenFlags,
    ) -> FuncliteResult<fs::File> {
        let host = self.resolve(guest_path)?;
        flags
            .to_open_options()
            .open(&host)
            .map_err(|e| io_error(e, guest_path))
    }
}

/// Positioned read used by `fs.readSync`.
pub(crate) fn read_at(
    file: &mut fs::File,
    length: usize,
    position: Option<u64>,
) -> FuncliteResult<Vec<u8>> {
    if let Some(pos) = position {
        file.seek(SeekFrom::Start(pos))
            .map_err(|e| FuncliteError::Internal(format!("seek failed: {}", e)))?;
    }
    let mut buf = vec![0u8; length];
    let n = file
        .read(&mut buf)
        .map_err(|e| FuncliteError::Internal(format!("read failed: {}", e)))?;
    buf.truncate(n);
    Ok(buf)
}

/// Positioned write used by `fs.writeSync`.
pub(crate) fn write_at(
    file: &mut fs::File,
    data: &[u8],
    position: Option<u64>,
) -> FuncliteResult<usize> {
    if let Some(pos) = position {
        file.seek(SeekFrom::Start(pos))
            .map_err(|e| FuncliteError::Internal(format!("seek failed: {}", e)))?;
    }
    file.write(data)
        .map_err(|e| FuncliteError::Internal(format!("write failed: {}", e)))
}

fn stat_from_metadata(meta: &fs::Metadata) -> FileStat {
    #[cfg(unix)]
    let mode = {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode()
    };
    #[cfg(not(unix))]
    let mode = if meta.permissions().readonly() { 0o444 } else { 0o644 };

    FileStat {
        is_file: meta.is_file(),
        is_directory: meta.is_dir(),
        is_symbolic_link: meta.file_type().is_symlink(),
        size: meta.len(),
        mode,
        mtime: system_time_iso(meta.modified().ok()),
        atime: system_time_iso(meta.accessed().ok()),
        ctime: system_time_iso(meta.created().ok().or(meta.modified().ok())),
    }
}

fn system_time_iso(time: Option<std::time::SystemTime>) -> String {
    let dt: DateTime<Utc> = time.map(DateTime::from).unwrap_or_else(Utc::now);
    dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

// Keep the guest path but never the host path in error text.
fn display_path(guest_path: &str) -> String {
    normalize_guest_path(guest_path)
}

fn escape_error(guest_path: &str) -> FuncliteError {
    FuncliteError::PermissionDenied(format!(
        "path escapes the application root: {}",
        display_path(guest_path)
    ))
}

fn io_error(err: std::io::Error, guest_path: &str) -> FuncliteError {
    match err.kind() {
        std::io::ErrorKind::NotFound => FuncliteError::NotFound(format!(
            "no such file or directory: {}",
            display_path(guest_path)
        )),
        std::io::ErrorKind::PermissionDenied => FuncliteError::PermissionDenied(format!(
            "operation not permitted: {}",
            display_path(guest_path)
        )),
        _ => FuncliteError::Internal(format!("filesystem error on {}", display_path(guest_path))),
    }
}
