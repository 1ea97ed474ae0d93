//! Whole-binary wiring: machines file, CLI parsing, and a full run.

mod support;

use std::fs;

use clap::Parser;
use kssh::cli::Cli;

use support::{fake_transport, numbered_lines, utf8};

#[test]
fn a_machines_file_and_cli_drive_a_complete_lines_run() {
    let guard = tempfile::tempdir().expect("tempdir");
    let root = utf8(guard.path());
    let transport = fake_transport(&root);
    let wd = root.join("wd");
    fs::create_dir_all(wd.as_std_path()).expect("create wd");
    let input = numbered_lines(&root, "input.txt", 7);
    let output = root.join("result.txt");

    let machines = root.join("machines.json");
    fs::write(
        machines.as_std_path(),
        format!(
            r#"[
                {{"hostname": "default", "connect_cmd": "{transport}", "poll_interval": 1}},
                {{"hostname": "w1", "wd": "{wd}"}}
            ]"#
        ),
    )
    .expect("write machines");

    let cli = Cli::parse_from([
        "kssh",
        "--input",
        input.as_str(),
        "--machines",
        machines.as_str(),
        "--task",
        "rev",
        "--temp-directory",
        root.join("tmp").as_str(),
        "--output",
        output.as_str(),
    ]);
    kssh::execute(cli).expect("run");

    let got = fs::read_to_string(output.as_std_path()).expect("read output");
    let want: String = (0..7).map(|i| format!("{i}\n")).collect();
    assert_eq!(got, want, "rev over single digits is the identity");
}

#[test]
fn files_mode_without_an_output_directory_is_a_fatal_error() {
    let guard = tempfile::tempdir().expect("tempdir");
    let root = utf8(guard.path());
    let a = numbered_lines(&root, "a.txt", 1);
    let b = numbered_lines(&root, "b.txt", 1);
    let machines = root.join("machines.json");
    fs::write(machines.as_std_path(), r#"[{"hostname": "w1"}]"#).expect("write machines");

    let cli = Cli::parse_from([
        "kssh",
        "--input",
        a.as_str(),
        b.as_str(),
        "--machines",
        machines.as_str(),
    ]);
    assert!(kssh::execute(cli).is_err());
}

#[test]
fn a_missing_machines_file_is_a_fatal_error() {
    let guard = tempfile::tempdir().expect("tempdir");
    let root = utf8(guard.path());
    let input = numbered_lines(&root, "input.txt", 1);

    let cli = Cli::parse_from([
        "kssh",
        "--input",
        input.as_str(),
        "--machines",
        root.join("absent.json").as_str(),
    ]);
    assert!(kssh::execute(cli).is_err());
}
