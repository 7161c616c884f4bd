//! Server executables discovered in a release directory.

use core::fmt;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};

const FILE_NAME_PREFIX: &str = "llama-server";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Platform {
    MacOs,
    Linux,
    Windows,
}

impl Platform {
    pub fn current() -> Option<Self> {
        match std::env::consts::OS {
            "macos" => Some(Self::MacOs),
            "linux" => Some(Self::Linux),
            "windows" => Some(Self::Windows),
            _ => None,
        }
    }

    /// Token used in release asset names.
    pub fn token(self) -> &'static str {
        match self {
            Self::MacOs => "macos",
            Self::Linux => "linux",
            Self::Windows => "windows",
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        match token {
            "macos" | "darwin" | "mac" => Some(Self::MacOs),
            "linux" => Some(Self::Linux),
            "windows" | "win" => Some(Self::Windows),
            _ => None,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::MacOs => "macOS",
            Self::Linux => "Linux",
            Self::Windows => "Windows",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Arch {
    X86_64,
    Arm64,
}

impl Arch {
    pub fn current() -> Option<Self> {
        match std::env::consts::ARCH {
            "x86_64" => Some(Self::X86_64),
            "aarch64" => Some(Self::Arm64),
            _ => None,
        }
    }

    pub fn token(self) -> &'static str {
        match self {
            Self::X86_64 => "x86_64",
            Self::Arm64 => "arm64",
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        match token {
            "arm64" | "aarch64" => Some(Self::Arm64),
            "x86_64" | "x64" | "amd64" => Some(Self::X86_64),
            _ => None,
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// One candidate binary under test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerExecutable {
    platform: Platform,
    arch: Arch,
    path: Utf8PathBuf,
    is_executable: bool,
}

impl ServerExecutable {
    /// Recognizes `llama-server-*` files and infers platform and architecture from the name.
    ///
    /// Returns `None` for anything that is not a server executable.
    pub fn from_path(path: &Utf8Path) -> Option<Self> {
        let file_name = path.file_name()?;

        if !file_name.starts_with(FILE_NAME_PREFIX) {
            return None;
        }

        let (stem, is_exe) = match file_name.strip_suffix(".exe") {
            Some(stem) => (stem, true),
            None => (file_name, false),
        };

        let tokens: Vec<String> = stem.split('-').map(str::to_ascii_lowercase).collect();

        let platform = tokens
            .iter()
            .find_map(|token| Platform::from_token(token))
            .or(is_exe.then_some(Platform::Windows))?;

        let arch = tokens
            .iter()
            .find_map(|token| Arch::from_token(token))
            .unwrap_or(match platform {
                Platform::MacOs => Arch::Arm64,
                Platform::Linux | Platform::Windows => Arch::X86_64,
            });

        let is_executable = if is_exe { true } else { has_execute_permission(path) };

        Some(Self {
            platform,
            arch,
            path: path.to_owned(),
            is_executable,
        })
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn name(&self) -> &str {
        self.path.file_name().unwrap_or(self.path.as_str())
    }

    pub fn is_executable(&self) -> bool {
        self.is_executable
    }

    pub fn matches(&self, platform: Platform, arch: Arch) -> bool {
        self.platform == platform && self.arch == arch
    }

    pub fn matches_host(&self) -> bool {
        match (Platform::current(), Arch::current()) {
            (Some(platform), Some(arch)) => self.matches(platform, arch),
            _ => false,
        }
    }
}

impl fmt::Display for ServerExecutable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}/{})", self.name(), self.platform, self.arch)
    }
}

/// Recursively lists server executables under `dir`, sorted by path.
pub fn discover(dir: &Utf8Path) -> io::Result<Vec<ServerExecutable>> {
    let mut found = Vec::new();
    let mut pending = vec![dir.to_owned()];

    while let Some(current) = pending.pop() {
        for entry in current.read_dir_utf8()? {
            let entry = entry?;
            let file_type = entry.file_type()?;

            if file_type.is_dir() {
                pending.push(entry.into_path());
            } else if let Some(executable) = ServerExecutable::from_path(entry.path()) {
                trace!(path = %executable.path, "Found server executable");
                found.push(executable);
            }
        }
    }

    found.sort_by(|a, b| a.path.cmp(&b.path));

    Ok(found)
}

#[cfg(unix)]
fn has_execute_permission(path: &Utf8Path) -> bool {
    use std::os::unix::fs::PermissionsExt as _;

    std::fs::metadata(path)
        .map(|metadata| metadata.is_file() && metadata.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn has_execute_permission(path: &Utf8Path) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("exe"))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("llama-server-macos-cpu", Platform::MacOs, Arch::Arm64)]
    #[case("llama-server-macos-metal", Platform::MacOs, Arch::Arm64)]
    #[case("llama-server-macos-x86_64", Platform::MacOs, Arch::X86_64)]
    #[case("llama-server-linux-cpu", Platform::Linux, Arch::X86_64)]
    #[case("llama-server-linux-aarch64", Platform::Linux, Arch::Arm64)]
    #[case("llama-server-windows-arm64.exe", Platform::Windows, Arch::Arm64)]
    #[case("llama-server-haswell.exe", Platform::Windows, Arch::X86_64)]
    #[case("llama-server-Linux-AMD64", Platform::Linux, Arch::X86_64)]
    fn recognizes_asset_names(#[case] name: &str, #[case] platform: Platform, #[case] arch: Arch) {
        let executable = ServerExecutable::from_path(Utf8Path::new(name)).unwrap();
        assert_eq!(executable.platform(), platform);
        assert_eq!(executable.arch(), arch);
        assert_eq!(executable.name(), name);
    }

    #[rstest]
    #[case("release.json")]
    #[case("latest.txt")]
    #[case("llama-server-haswell")]
    #[case("llama-cli-linux-x86_64")]
    fn ignores_other_files(#[case] name: &str) {
        assert!(ServerExecutable::from_path(Utf8Path::new(name)).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn discover_walks_nested_directories() {
        use std::os::unix::fs::PermissionsExt as _;

        let tempdir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(tempdir.path()).unwrap();
        let nested = root.join("b1234");
        std::fs::create_dir_all(&nested).unwrap();

        let runnable = nested.join("llama-server-linux-x86_64");
        std::fs::write(&runnable, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&runnable, std::fs::Permissions::from_mode(0o755)).unwrap();

        let not_runnable = root.join("llama-server-macos-metal");
        std::fs::write(&not_runnable, "").unwrap();
        std::fs::set_permissions(&not_runnable, std::fs::Permissions::from_mode(0o644)).unwrap();

        std::fs::write(nested.join("release.json"), "{}").unwrap();

        let found = discover(root).unwrap();

        assert_eq!(found.len(), 2);
        let linux = found.iter().find(|e| e.platform() == Platform::Linux).unwrap();
        assert!(linux.is_executable());
        let macos = found.iter().find(|e| e.platform() == Platform::MacOs).unwrap();
        assert!(!macos.is_executable());
    }
}
