use serde::Serialize;

#[derive(Debug, Clone, Default, Serialize)]
pub struct MemoryUsage {
    pub rss_bytes: Option<u64>,
    pub vm_size_bytes: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CpuUsage {
    /// Clock ticks spent in user mode.
    pub user: Option<u64>,
    /// Clock ticks spent in kernel mode.
    pub system: Option<u64>,
}

/// Resident and virtual size of this process. Empty off Linux.
pub fn memory_usage() -> MemoryUsage {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            return parse_proc_status(&status);
        }
    }
    MemoryUsage::default()
}

/// CPU time consumed by this process. Empty off Linux.
pub fn cpu_usage() -> CpuUsage {
    #[cfg(target_os = "linux")]
    {
        if let Ok(stat) = std::fs::read_to_string("/proc/self/stat") {
            return parse_proc_stat(&stat);
        }
    }
    CpuUsage::default()
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_proc_status(status: &str) -> MemoryUsage {
    let kib = |key: &str| {
        status
            .lines()
            .find(|l| l.starts_with(key))
            .and_then(|l| l.split_whitespace().nth(1))
            .and_then(|v| v.parse::<u64>().ok())
            .map(|v| v * 1024)
    };
    MemoryUsage {
        rss_bytes: kib("VmRSS:"),
        vm_size_bytes: kib("VmSize:"),
    }
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_proc_stat(stat: &str) -> CpuUsage {
    // comm may contain spaces; fields resume after the closing paren.
    let fields: Vec<&str> = match stat.rfind(')') {
        Some(end) => stat[end + 1..].split_whitespace().collect(),
        None => return CpuUsage::default(),
    };
    // utime and stime are fields 14 and 15; `fields[0]` is field 3.
    CpuUsage {
        user: fields.get(11).and_then(|v| v.parse().ok()),
        system: fields.get(12).and_then(|v| v.parse().ok()),
    }
}
