use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::os::unix::net::UnixStream;
use std::path::Path;

use tokio::net::UnixListener;
use tracing::warn;

/// Binds the control socket with mode 0660, replacing a stale socket file but
/// never a live one or a non-socket.
pub fn bind_socket(path: &Path, group: Option<&str>) -> io::Result<UnixListener> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
        let _ = fs::set_permissions(parent, fs::Permissions::from_mode(0o770));
    }
    if fs::symlink_metadata(path).is_ok() {
        cleanup_stale_socket(path)?;
    }

    let listener = std::os::unix::net::UnixListener::bind(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o660))?;

    if let Some(group) = group {
        if let Err(err) = apply_socket_group(path, group) {
            warn!("Failed to set socket group {}: {}", group, err);
        }
    }

    listener.set_nonblocking(true)?;
    UnixListener::from_std(listener)
}

fn cleanup_stale_socket(path: &Path) -> io::Result<()> {
    let metadata = fs::symlink_metadata(path)?;
    if !metadata.file_type().is_socket() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("refusing to overwrite non-socket path at {}", path.display()),
        ));
    }

    match UnixStream::connect(path) {
        Ok(_) => Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            format!("socket {} is already active", path.display()),
        )),
        Err(err)
            if matches!(
                err.kind(),
                io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound
            ) =>
        {
            fs::remove_file(path)
        }
        Err(err) => Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            format!(
                "socket {} exists and could not be validated as stale: {}",
                path.display(),
                err
            ),
        )),
    }
}

fn apply_socket_group(path: &Path, group: &str) -> io::Result<()> {
    let gid = lookup_gid(group)?;
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid socket path"))?;
    // uid -1 leaves the owner unchanged.
    let rc = unsafe { libc::chown(c_path.as_ptr(), libc::uid_t::MAX, gid as libc::gid_t) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn lookup_gid(group: &str) -> io::Result<u32> {
    let c_group = CString::new(group)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid group name"))?;
    let grp = unsafe { libc::getgrnam(c_group.as_ptr()) };
    if grp.is_null() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("group {} not found", group),
        ));
    }
    Ok(unsafe { (*grp).gr_gid })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn stale_socket_file_is_replaced() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("netpilotd.sock");
        {
            let _stale = std::os::unix::net::UnixListener::bind(&path).unwrap();
        }
        assert!(path.exists());

        let _listener = bind_socket(&path, None).expect("bind should replace stale socket");
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o660);
    }

    #[tokio::test]
    async fn live_socket_is_left_alone() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("netpilotd.sock");
        let _active = std::os::unix::net::UnixListener::bind(&path).unwrap();
        let err = bind_socket(&path, None).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
    }

    #[tokio::test]
    async fn regular_files_are_refused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("netpilotd.sock");
        fs::write(&path, b"not a socket").unwrap();
        let err = bind_socket(&path, None).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }
}
