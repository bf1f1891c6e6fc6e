use std::time::SystemTime;

pub mod retry;

#[macro_export]
macro_rules! unwrap_or_continue {
    ($opt: expr) => {
        match $opt {
            Some(v) => v,
            None => {
                continue;
            }
        }
    };
}

pub fn get_epoch_time_in_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Parses the leading `major.minor` of a version string.
pub fn major_minor(version: &str) -> Option<(u64, u64)> {
    let mut parts = version.trim().trim_start_matches('v').split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

/// Nodes are compatible with the coordinator when they share `major.minor`.
pub fn is_version_compatible(node_version: &str, server_version: &str) -> bool {
    match (major_minor(node_version), major_minor(server_version)) {
        (Some(node), Some(server)) => node == server,
        _ => false,
    }
}
