//! TCP buffer sysctls.

use crate::error::{NetlinkError, Result};
use std::fs;
use std::path::Path;
use std::str::FromStr;

const PROC_SYS: &str = "/proc/sys";

/// `rmem_min,rmem_default,rmem_max,wmem_min,wmem_default,wmem_max`, the
/// per-network buffer string from the network configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpBufferSizes {
    pub rmem: [u32; 3],
    pub wmem: [u32; 3],
}

impl FromStr for TcpBufferSizes {
    type Err = NetlinkError;

    fn from_str(s: &str) -> Result<Self> {
        let values = s
            .split(',')
            .map(|v| v.trim().parse::<u32>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| NetlinkError::parse("tcp buffer sizes", e.to_string()))?;
        if values.len() != 6 {
            return Err(NetlinkError::parse(
                "tcp buffer sizes",
                format!("expected 6 values, got {}", values.len()),
            ));
        }
        Ok(Self {
            rmem: [values[0], values[1], values[2]],
            wmem: [values[3], values[4], values[5]],
        })
    }
}

impl TcpBufferSizes {
    /// Writes `net/ipv4/tcp_rmem` and `net/ipv4/tcp_wmem` below `root`.
    pub fn write_under(&self, root: &Path) -> Result<()> {
        let ipv4 = root.join("net/ipv4");
        write_triple(&ipv4.join("tcp_rmem"), &self.rmem)?;
        write_triple(&ipv4.join("tcp_wmem"), &self.wmem)
    }
}

fn write_triple(path: &Path, values: &[u32; 3]) -> Result<()> {
    let line = format!("{} {} {}\n", values[0], values[1], values[2]);
    fs::write(path, line)
        .map_err(|e| NetlinkError::io_error(format!("writing {}", path.display()), e))
}

pub fn set_tcp_buffer_sizes(sizes: &TcpBufferSizes) -> Result<()> {
    sizes.write_under(Path::new(PROC_SYS))?;
    tracing::debug!("TCP buffers set to rmem={:?} wmem={:?}", sizes.rmem, sizes.wmem);
    Ok(())
}
