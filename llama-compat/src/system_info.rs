//! Description of the machine the tests ran on, included at the top of every report.

use core::fmt;
use std::process::Stdio;
use std::time::Duration;

use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};
use tokio::process::Command;

const GPU_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemInfo {
    pub os_name: Option<String>,
    pub os_version: Option<String>,
    pub kernel_version: Option<String>,
    pub arch: String,
    pub cpu_brand: Option<String>,
    pub physical_cores: Option<usize>,
    pub logical_cores: usize,
    /// MHz
    pub cpu_frequency: Option<u64>,
    pub total_memory: u64,
    pub available_memory: u64,
    pub used_memory: u64,
    pub total_swap: u64,
    pub used_swap: u64,
    pub gpus: Vec<String>,
}

impl SystemInfo {
    pub async fn collect() -> Self {
        let system = System::new_with_specifics(
            RefreshKind::nothing()
                .with_cpu(CpuRefreshKind::everything())
                .with_memory(MemoryRefreshKind::everything()),
        );

        let cpus = system.cpus();
        let cpu_brand = cpus
            .first()
            .map(|cpu| cpu.brand().trim().to_owned())
            .filter(|brand| !brand.is_empty());
        let cpu_frequency = cpus.iter().map(|cpu| cpu.frequency()).max().filter(|mhz| *mhz > 0);

        let gpus = detect_gpus().await;

        Self {
            os_name: System::name(),
            os_version: System::long_os_version().or_else(System::os_version),
            kernel_version: System::kernel_version(),
            arch: System::cpu_arch(),
            cpu_brand,
            physical_cores: System::physical_core_count(),
            logical_cores: cpus.len(),
            cpu_frequency,
            total_memory: system.total_memory(),
            available_memory: system.available_memory(),
            used_memory: system.used_memory(),
            total_swap: system.total_swap(),
            used_swap: system.used_swap(),
            gpus,
        }
    }
}

impl fmt::Display for SystemInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNKNOWN: &str = "unknown";

        writeln!(f, "PLATFORM:")?;
        writeln!(f, "{}", "-".repeat(40))?;
        writeln!(
            f,
            "OS: {} {}",
            self.os_name.as_deref().unwrap_or(UNKNOWN),
            self.os_version.as_deref().unwrap_or_default()
        )?;
        writeln!(f, "Kernel: {}", self.kernel_version.as_deref().unwrap_or(UNKNOWN))?;
        writeln!(f, "Architecture: {}", self.arch)?;
        writeln!(f)?;

        writeln!(f, "CPU:")?;
        writeln!(f, "{}", "-".repeat(40))?;
        writeln!(f, "Processor: {}", self.cpu_brand.as_deref().unwrap_or(UNKNOWN))?;
        match self.physical_cores {
            Some(cores) => writeln!(f, "Physical Cores: {cores}")?,
            None => writeln!(f, "Physical Cores: {UNKNOWN}")?,
        }
        writeln!(f, "Total Cores: {}", self.logical_cores)?;
        if let Some(mhz) = self.cpu_frequency {
            writeln!(f, "Frequency: {mhz} MHz")?;
        }
        writeln!(f)?;

        writeln!(f, "MEMORY:")?;
        writeln!(f, "{}", "-".repeat(40))?;
        writeln!(f, "Total RAM: {}", ByteSize(self.total_memory))?;
        writeln!(f, "Available RAM: {}", ByteSize(self.available_memory))?;
        writeln!(
            f,
            "Used RAM: {} ({:.1}%)",
            ByteSize(self.used_memory),
            percentage(self.used_memory, self.total_memory)
        )?;
        writeln!(f, "Swap Total: {}", ByteSize(self.total_swap))?;
        writeln!(
            f,
            "Swap Used: {} ({:.1}%)",
            ByteSize(self.used_swap),
            percentage(self.used_swap, self.total_swap)
        )?;
        writeln!(f)?;

        writeln!(f, "GPU:")?;
        writeln!(f, "{}", "-".repeat(40))?;
        if self.gpus.is_empty() {
            writeln!(f, "No GPUs detected")?;
        }
        for (idx, gpu) in self.gpus.iter().enumerate() {
            writeln!(f, "GPU {}: {gpu}", idx + 1)?;
        }

        Ok(())
    }
}

struct ByteSize(u64);

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];

        let mut value = self.0 as f64;

        for unit in UNITS {
            if value < 1024.0 {
                return write!(f, "{value:.2} {unit}");
            }
            value /= 1024.0;
        }

        write!(f, "{value:.2} PB")
    }
}

fn percentage(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 * 100.0 / total as f64
    }
}

async fn detect_gpus() -> Vec<String> {
    match std::env::consts::OS {
        "macos" => run_query("system_profiler", &["SPDisplaysDataType"])
            .await
            .map(|output| parse_system_profiler(&output)),
        "linux" => run_query("lspci", &["-v"]).await.map(|output| parse_lspci(&output)),
        "windows" => run_query("wmic", &["path", "win32_VideoController", "get", "name"])
            .await
            .map(|output| parse_wmic(&output)),
        _ => None,
    }
    .unwrap_or_default()
}

/// Runs a query command, giving up after a few seconds. Any failure yields `None`.
async fn run_query(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(GPU_QUERY_TIMEOUT, output).await {
        Ok(Ok(output)) if output.status.success() => Some(String::from_utf8_lossy(&output.stdout).into_owned()),
        Ok(Ok(output)) => {
            debug!(program, status = %output.status, "GPU query failed");
            None
        }
        Ok(Err(error)) => {
            debug!(program, %error, "GPU query could not run");
            None
        }
        Err(_) => {
            debug!(program, "GPU query timed out");
            None
        }
    }
}

fn parse_system_profiler(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.trim().strip_prefix("Chipset Model:"))
        .map(|name| name.trim().to_owned())
        .filter(|name| !name.is_empty())
        .collect()
}

fn parse_lspci(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|line| !line.starts_with(char::is_whitespace))
        .filter(|line| line.contains("VGA") || line.contains("3D controller"))
        .filter_map(|line| line.rsplit(": ").next())
        .map(|name| name.trim().to_owned())
        .filter(|name| !name.is_empty())
        .collect()
}

fn parse_wmic(output: &str) -> Vec<String> {
    output
        .lines()
        .skip(1)
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}
