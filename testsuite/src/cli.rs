#![allow(clippy::unwrap_used, reason = "test infrastructure can panic on errors")]

use std::sync::LazyLock;

use camino::{Utf8Path, Utf8PathBuf};
use server_harness::{Arch, Platform};
use sysinfo::{ProcessStatus, ProcessesToUpdate, System};

static LLAMA_COMPAT_BIN_PATH: LazyLock<std::path::PathBuf> = LazyLock::new(|| {
    escargot::CargoBuild::new()
        .manifest_path("../llama-compat/Cargo.toml")
        .bin("llama-compat")
        .current_release()
        .current_target()
        .run()
        .expect("build llama-compat")
        .path()
        .to_path_buf()
});

static STUB_SERVER_BIN_PATH: LazyLock<std::path::PathBuf> = LazyLock::new(|| {
    escargot::CargoBuild::new()
        .manifest_path("../tools/stub-llama-server/Cargo.toml")
        .bin("stub-llama-server")
        .current_release()
        .current_target()
        .run()
        .expect("build stub-llama-server")
        .path()
        .to_path_buf()
});

pub fn llama_compat_assert_cmd() -> assert_cmd::Command {
    let mut cmd = assert_cmd::Command::new(&*LLAMA_COMPAT_BIN_PATH);
    cmd.env("RUST_BACKTRACE", "0");
    cmd.env_remove("STUB_LLAMA_MODE");
    cmd
}

/// Release asset name of a server built for the machine running the tests.
pub fn host_server_file_name() -> String {
    let platform = Platform::current().expect("supported test host");
    let arch = Arch::current().expect("supported test host");

    let mut name = format!("llama-server-{}-{}", platform.token(), arch.token());

    if platform == Platform::Windows {
        name.push_str(".exe");
    }

    name
}

/// Copies the stub server into `dir` under a release asset name matching the host.
pub fn install_stub_server(dir: &Utf8Path) -> Utf8PathBuf {
    install_stub_server_as(dir, &host_server_file_name())
}

pub fn install_stub_server_as(dir: &Utf8Path, file_name: &str) -> Utf8PathBuf {
    std::fs::create_dir_all(dir).unwrap();

    let path = dir.join(file_name);
    std::fs::copy(&*STUB_SERVER_BIN_PATH, &path).unwrap();

    path
}

/// Installs the stub server behind a `/bin/sh` script named after the host release asset.
///
/// `{stub}` in `body` is replaced by the path of the stub server. Returns the script and the stub.
#[cfg(unix)]
pub fn install_stub_script(dir: &Utf8Path, body: &str) -> (Utf8PathBuf, Utf8PathBuf) {
    use std::os::unix::fs::PermissionsExt as _;

    let stub = install_stub_server_as(dir, "stub-llama-server");
    let script = dir.join(host_server_file_name());

    std::fs::write(&script, format!("#!/bin/sh\n{}\n", body.replace("{stub}", stub.as_str()))).unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

    (script, stub)
}

/// Pids of the live processes running `executable`.
pub fn processes_running(executable: &Utf8Path) -> Vec<u32> {
    let executable = std::fs::canonicalize(executable).unwrap();

    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);

    system
        .processes()
        .iter()
        .filter(|(_, process)| {
            process.thread_kind().is_none()
                && process.status() != ProcessStatus::Zombie
                && process.exe() == Some(executable.as_path())
        })
        .map(|(pid, _)| pid.as_u32())
        .collect()
}

/// Writes a placeholder model file; the stub server only checks that it exists.
pub fn write_model(dir: &Utf8Path) -> Utf8PathBuf {
    std::fs::create_dir_all(dir).unwrap();

    let path = dir.join("tiny.gguf");
    std::fs::write(&path, b"GGUF").unwrap();

    path
}

pub fn utf8_tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
    let tempdir = tempfile::tempdir().unwrap();
    let path = Utf8Path::from_path(tempdir.path()).unwrap().to_owned();
    (tempdir, path)
}
