//! Path and filesystem primitives the capability sandbox is built from.
//!
//! Two distinct disciplines live here. Paths supplied by the embedder or the
//! allowlist are canonicalized once with `realpath` and compared at path
//! boundaries. Paths supplied by a plugin for its private data root are
//! walked segment by segment with `openat` and `O_NOFOLLOW` so a symlink the
//! plugin plants inside its own directory can never redirect the traversal.

use std::ffi::CString;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

/// How [`open_beneath`] opens the final path segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Open an existing regular file read-only.
    Read,
    /// Create or truncate a regular file, creating missing intermediate
    /// directories with mode 0700.
    Write,
    /// Open an existing directory read-only.
    Dir,
}

/// Creates `dir` and any missing parents with `mode`.
pub fn mkdir_p(dir: &Path, mode: u32) -> Result<()> {
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(mode)
        .create(dir)
        .with_context(|| format!("create directory {}", dir.display()))
}

/// Resolves symlinks and `.`/`..` components, failing for missing paths.
pub fn canonicalize(path: &Path) -> Result<PathBuf> {
    std::fs::canonicalize(path).with_context(|| format!("resolve {}", path.display()))
}

/// True when `path` equals `root` or sits beneath it. The comparison is
/// component-wise, so `/a/bc` is not contained in `/a/b`.
pub fn contains(root: &Path, path: &Path) -> bool {
    path.starts_with(root)
}

/// Validates a plugin-supplied data-root path: non-empty, relative, no
/// backslashes, and no empty, `.`, or `..` segments.
pub fn validate_relative(rel: &str) -> Result<()> {
    if rel.is_empty() {
        bail!("path is empty");
    }
    if rel.starts_with('/') {
        bail!("path must be relative");
    }
    if rel.contains('\\') {
        bail!("path must not contain backslashes");
    }
    if rel.contains('\0') {
        bail!("path must not contain NUL bytes");
    }
    for seg in rel.split('/') {
        match seg {
            "" => bail!("path has an empty segment"),
            "." | ".." => bail!("path segments may not be `.` or `..`"),
            _ => {}
        }
    }
    Ok(())
}

#[allow(unsafe_code)]
fn openat_fd(dirfd: libc::c_int, name: &str, flags: libc::c_int, mode: libc::c_uint) -> io::Result<OwnedFd> {
    let c = CString::new(name).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    loop {
        // Safety: the path pointer is valid for the duration of the call and
        // the returned fd, when non-negative, is owned by nobody else.
        let fd = unsafe { libc::openat(dirfd, c.as_ptr(), flags, mode) };
        if fd >= 0 {
            // Safety: fd is a freshly opened descriptor we own.
            return Ok(unsafe { OwnedFd::from_raw_fd(fd) });
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        return Err(err);
    }
}

#[allow(unsafe_code)]
fn mkdirat_fd(dirfd: libc::c_int, name: &str, mode: libc::mode_t) -> io::Result<()> {
    let c = CString::new(name).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    // Safety: the path pointer is valid for the duration of the call.
    let rc = unsafe { libc::mkdirat(dirfd, c.as_ptr(), mode) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EEXIST) {
        return Ok(());
    }
    Err(err)
}

/// Opens `rel` beneath the already-canonical `root` without following a
/// symlink on any hop. Intermediate directories are created (mode 0700) only
/// in [`OpenMode::Write`].
pub fn open_beneath(root: &Path, rel: &str, mode: OpenMode) -> Result<File> {
    validate_relative(rel)?;

    let root_str = root
        .as_os_str()
        .to_str()
        .with_context(|| format!("data root {} is not valid UTF-8", root.display()))?;
    let dir_flags = libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC;
    let mut at = openat_fd(libc::AT_FDCWD, root_str, dir_flags, 0)
        .with_context(|| format!("open data root {}", root.display()))?;

    let mut segments: Vec<&str> = rel.split('/').collect();
    let last = segments.pop().unwrap_or(rel);
    let hop_flags = dir_flags | libc::O_NOFOLLOW;
    for seg in segments {
        at = match openat_fd(at.as_raw_fd(), seg, hop_flags, 0) {
            Ok(fd) => fd,
            Err(e) if e.kind() == io::ErrorKind::NotFound && mode == OpenMode::Write => {
                mkdirat_fd(at.as_raw_fd(), seg, 0o700)
                    .with_context(|| format!("create directory {seg} in {rel}"))?;
                openat_fd(at.as_raw_fd(), seg, hop_flags, 0)
                    .with_context(|| format!("descend into {seg} in {rel}"))?
            }
            Err(e) => return Err(e).with_context(|| format!("descend into {seg} in {rel}")),
        };
    }

    let fd = match mode {
        OpenMode::Read => openat_fd(
            at.as_raw_fd(),
            last,
            libc::O_RDONLY | libc::O_NOFOLLOW | libc::O_CLOEXEC,
            0,
        ),
        OpenMode::Write => openat_fd(
            at.as_raw_fd(),
            last,
            libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC | libc::O_NOFOLLOW | libc::O_CLOEXEC,
            0o600,
        ),
        OpenMode::Dir => openat_fd(at.as_raw_fd(), last, hop_flags, 0),
    }
    .with_context(|| format!("open {rel}"))?;
    Ok(File::from(fd))
}

/// Reads at most `cap` bytes from a regular file; anything larger fails with
/// "file too large". The extra one-byte probe catches files that grow between
/// the stat and the read.
pub fn read_bounded(file: File, cap: usize) -> Result<Vec<u8>> {
    let meta = file.metadata().context("stat file")?;
    if !meta.is_file() {
        bail!("not a regular file");
    }
    if meta.len() > cap as u64 {
        bail!("file too large");
    }
    let mut buf = Vec::with_capacity(meta.len() as usize);
    file.take(cap as u64 + 1)
        .read_to_end(&mut buf)
        .context("read file")?;
    if buf.len() > cap {
        bail!("file too large");
    }
    Ok(buf)
}

/// Writes the whole buffer, or fails.
pub fn write_all(mut file: File, data: &[u8]) -> Result<()> {
    file.write_all(data).context("write file")?;
    file.flush().context("flush file")?;
    Ok(())
}

/// Lists entry names of an already-opened directory, sorted. Reading through
/// the descriptor keeps the listing pinned to the directory that was opened,
/// not whatever its path points at now.
#[allow(unsafe_code)]
pub fn list_dir(dir: File) -> Result<Vec<String>> {
    use std::os::fd::IntoRawFd;

    let fd = dir.into_raw_fd();
    // Safety: fd is an owned directory descriptor; fdopendir takes ownership
    // of it on success.
    let dp = unsafe { libc::fdopendir(fd) };
    if dp.is_null() {
        let err = io::Error::last_os_error();
        // Safety: fdopendir failed, so the descriptor is still ours to close.
        unsafe { libc::close(fd) };
        return Err(err).context("fdopendir");
    }
    let mut names = Vec::new();
    loop {
        // Safety: dp is a valid DIR handle until closedir below.
        let entry = unsafe { libc::readdir(dp) };
        if entry.is_null() {
            break;
        }
        // Safety: d_name is NUL-terminated for the lifetime of the entry.
        let name = unsafe { std::ffi::CStr::from_ptr((*entry).d_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();
        if name != "." && name != ".." {
            names.push(name);
        }
    }
    // Safety: closes the DIR handle and the descriptor it owns.
    unsafe { libc::closedir(dp) };
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs as unix_fs;
    use tempfile::TempDir;

    #[test]
    fn containment_respects_path_boundaries() {
        let root = Path::new("/a/b");
        assert!(contains(root, Path::new("/a/b")));
        assert!(contains(root, Path::new("/a/b/c")));
        assert!(!contains(root, Path::new("/a/bc")));
        assert!(!contains(root, Path::new("/a")));
    }

    #[test]
    fn relative_validation_rejects_escapes() {
        assert!(validate_relative("a/b/c.txt").is_ok());
        assert!(validate_relative("").is_err());
        assert!(validate_relative("/etc/passwd").is_err());
        assert!(validate_relative("a//b").is_err());
        assert!(validate_relative("a/./b").is_err());
        assert!(validate_relative("a/../b").is_err());
        assert!(validate_relative("a\\b").is_err());
    }

    #[test]
    fn write_then_read_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().canonicalize().unwrap();

        let out = open_beneath(&root, "a/b/c.txt", OpenMode::Write).unwrap();
        write_all(out, b"hi").unwrap();

        let file = open_beneath(&root, "a/b/c.txt", OpenMode::Read).unwrap();
        assert_eq!(read_bounded(file, 1024).unwrap(), b"hi");
    }

    #[test]
    fn traversal_refuses_symlink_hops() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        let outside = TempDir::new().unwrap();
        fs::write(outside.path().join("secret"), b"x").unwrap();
        unix_fs::symlink(outside.path(), root.join("link")).unwrap();

        assert!(open_beneath(&root, "link/secret", OpenMode::Read).is_err());
    }

    #[test]
    fn symlinked_file_is_refused() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        fs::write(root.join("real"), b"x").unwrap();
        unix_fs::symlink(root.join("real"), root.join("alias")).unwrap();

        assert!(open_beneath(&root, "alias", OpenMode::Read).is_err());
        assert!(open_beneath(&root, "real", OpenMode::Read).is_ok());
    }

    #[test]
    fn read_ops_do_not_create_directories() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().canonicalize().unwrap();

        assert!(open_beneath(&root, "no/such/file", OpenMode::Read).is_err());
        assert!(!root.join("no").exists());
    }

    #[test]
    fn bounded_read_enforces_the_cap() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("big");
        fs::write(&path, vec![0u8; 100]).unwrap();

        let err = read_bounded(File::open(&path).unwrap(), 99).unwrap_err();
        assert!(err.to_string().contains("file too large"));
        assert_eq!(read_bounded(File::open(&path).unwrap(), 100).unwrap().len(), 100);
    }

    #[test]
    fn directories_are_not_regular_files() {
        let tmp = TempDir::new().unwrap();
        let dir = File::open(tmp.path()).unwrap();
        assert!(read_bounded(dir, 1024).is_err());
    }

    #[test]
    fn lists_directory_entries_sorted() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        fs::create_dir(root.join("b")).unwrap();
        fs::write(root.join("a.txt"), b"").unwrap();
        fs::write(root.join("c.txt"), b"").unwrap();

        let dir = File::open(&root).unwrap();
        assert_eq!(list_dir(dir).unwrap(), vec!["a.txt", "b", "c.txt"]);
    }

    #[test]
    fn mkdir_p_applies_mode() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("x/y/z");
        mkdir_p(&dir, 0o700).unwrap();
        let mode = fs::metadata(&dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}
