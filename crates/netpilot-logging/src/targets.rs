//! Tracing targets that get a log file of their own.

pub const T_NET: &str = "net";
pub const T_ROUTE: &str = "route";
pub const T_DNS: &str = "dns";
pub const T_HSM: &str = "hsm";

pub const SUBSYSTEMS: [&str; 4] = [T_NET, T_ROUTE, T_DNS, T_HSM];

pub fn file_name(target: &str) -> String {
    format!("{target}.log")
}
