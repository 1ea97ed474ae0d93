//! Shared fixtures driving the dispatcher through a local fake transport.
//!
//! The fake transport is an executable script invoked exactly like a real
//! `connect_cmd`: it receives the `user@host` address followed by the remote
//! script, drops the address, and executes the script in a local shell. The
//! full wrapper protocol (START daemonisation, heartbeats, CHECK, FETCH)
//! therefore runs for real, just against the local filesystem.
#![allow(dead_code)] // each test binary uses its own subset of the fixtures

use std::fs;
use std::os::unix::fs::PermissionsExt;

use camino::{Utf8Path, Utf8PathBuf};
use kssh::machines::MachineConfig;

/// Converts a std tempdir path into a UTF-8 one.
pub fn utf8(path: &std::path::Path) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(path.to_path_buf()).expect("utf-8 test path")
}

/// Writes an executable script under `dir` and returns its path.
pub fn write_script(dir: &Utf8Path, name: &str, body: &str) -> Utf8PathBuf {
    let path = dir.join(name);
    fs::write(path.as_std_path(), body).expect("write script");
    let mut perms = fs::metadata(path.as_std_path()).expect("stat script").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path.as_std_path(), perms).expect("chmod script");
    path
}

/// A transport that runs every remote script locally.
pub fn fake_transport(dir: &Utf8Path) -> Utf8PathBuf {
    write_script(
        dir,
        "fake_ssh",
        "#!/bin/sh\n# drop the user@host argument and run the script locally\nshift\nexec /bin/sh -c \"$1\"\n",
    )
}

/// A transport that always fails to connect.
pub fn broken_transport(dir: &Utf8Path) -> Utf8PathBuf {
    write_script(dir, "broken_ssh", "#!/bin/sh\nexit 255\n")
}

/// A transport that fails the first invocation, then behaves normally.
pub fn flaky_transport(dir: &Utf8Path) -> Utf8PathBuf {
    let marker = dir.join("flaky_marker");
    write_script(
        dir,
        "flaky_ssh",
        &format!(
            "#!/bin/sh\nif [ ! -e {marker} ]; then : > {marker}; exit 255; fi\nshift\nexec /bin/sh -c \"$1\"\n"
        ),
    )
}

/// A transport that delays every operation before running it locally.
pub fn slow_transport(dir: &Utf8Path, delay_secs: u32) -> Utf8PathBuf {
    write_script(
        dir,
        "slow_ssh",
        &format!("#!/bin/sh\nsleep {delay_secs}\nshift\nexec /bin/sh -c \"$1\"\n"),
    )
}

/// A machines entry pointing `hostname` at `transport` with short timeouts
/// suited to tests.
pub fn machine(hostname: &str, transport: &Utf8Path, wd: &Utf8Path) -> MachineConfig {
    MachineConfig {
        hostname: hostname.into(),
        username: None,
        wd: wd.to_string(),
        connect_cmd: transport.to_string(),
        poll_interval: 1,
        poll_timeout: 10,
        upload_timeout: 10,
        download_timeout: 10,
        init_timeout: 10,
    }
}

/// Writes `count` numbered lines into `name` under `dir`.
pub fn numbered_lines(dir: &Utf8Path, name: &str, count: usize) -> Utf8PathBuf {
    let path = dir.join(name);
    let body: String = (0..count).map(|i| format!("{i}\n")).collect();
    fs::write(path.as_std_path(), body).expect("write input");
    path
}
