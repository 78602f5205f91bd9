//! Resolver configuration file writer.

use crate::error::{NetlinkError, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

const HEADER: &str = "# Generated by netpilotd. Local changes are overwritten.\n";

/// Writes `nameserver` lines to a resolv.conf-style file, replacing it
/// atomically so readers never see a partial list.
pub struct ResolverWriter {
    path: PathBuf,
}

impl ResolverWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, servers: &[IpAddr]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| NetlinkError::io_error("creating resolver directory", e))?;
        }

        let temp_path = self.path.with_extension("tmp");
        {
            #[cfg(unix)]
            use std::os::unix::fs::OpenOptionsExt;

            let mut options = OpenOptions::new();
            options.write(true).create(true).truncate(true);
            #[cfg(unix)]
            options.mode(0o644);
            let mut file = options
                .open(&temp_path)
                .map_err(|e| NetlinkError::io_error("opening temp resolver file", e))?;
            file.write_all(render(servers).as_bytes())
                .map_err(|e| NetlinkError::io_error("writing resolver file", e))?;
            file.sync_all()
                .map_err(|e| NetlinkError::io_error("syncing resolver file", e))?;
        }

        fs::rename(&temp_path, &self.path)
            .map_err(|e| NetlinkError::io_error("renaming resolver file", e))?;
        tracing::debug!(
            target: "dns",
            "Wrote {} nameserver(s) to {}",
            servers.len(),
            self.path.display()
        );
        Ok(())
    }
}

fn render(servers: &[IpAddr]) -> String {
    let mut out = String::from(HEADER);
    for server in servers {
        out.push_str("nameserver ");
        out.push_str(&server.to_string());
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn writes_servers_in_order() {
        let dir = TempDir::new().unwrap();
        let writer = ResolverWriter::new(dir.path().join("run/resolv.conf"));
        let servers: Vec<IpAddr> = vec!["10.64.0.53".parse().unwrap(), "2001:db8::53".parse().unwrap()];
        writer.write(&servers).unwrap();

        let content = fs::read_to_string(writer.path()).unwrap();
        let lines: Vec<&str> = content.lines().filter(|l| !l.starts_with('#')).collect();
        assert_eq!(lines, vec!["nameserver 10.64.0.53", "nameserver 2001:db8::53"]);
        assert!(!writer.path().with_extension("tmp").exists());
    }

    #[test]
    fn empty_list_leaves_only_the_header() {
        let dir = TempDir::new().unwrap();
        let writer = ResolverWriter::new(dir.path().join("resolv.conf"));
        writer.write(&["192.168.1.1".parse().unwrap()]).unwrap();
        writer.write(&[]).unwrap();
        assert_eq!(fs::read_to_string(writer.path()).unwrap(), HEADER);
    }
}
