//! End-to-end dispatch of whole-file workloads and the initialization phase.

mod support;

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use kssh::dispatch::{DispatchOptions, Dispatcher};
use kssh::source::BlockSource;
use kssh::worker::Worker;
use kssh::workspace::Workspace;

use support::{fake_transport, machine, utf8, write_script};

const KEY: &str = "cafe0123";

fn files_dispatcher(
    root: &Utf8Path,
    transport: &Utf8Path,
    hostnames: &[&str],
    inputs: Vec<Utf8PathBuf>,
    options: DispatchOptions,
) -> (Utf8PathBuf, Dispatcher) {
    let mut workers = Vec::new();
    for hostname in hostnames {
        let wd = root.join(format!("wd_{hostname}"));
        fs::create_dir_all(wd.as_std_path()).expect("create wd");
        workers.push(Worker::new(machine(hostname, transport, &wd), KEY).expect("worker"));
    }
    let out_dir = root.join("out");
    let workspace = Workspace::files(root.join("tmp"), out_dir.clone()).expect("workspace");
    let source = BlockSource::files(inputs);
    let dispatcher = Dispatcher::new(workers, source, workspace, options).expect("dispatcher");
    (out_dir, dispatcher)
}

#[test]
fn each_input_file_lands_as_an_uppercased_output_file() {
    let guard = tempfile::tempdir().expect("tempdir");
    let root = utf8(guard.path());
    let transport = fake_transport(&root);

    let names = ["a.txt", "b.txt", "c.txt", "d.txt"];
    let mut inputs = Vec::new();
    for name in names {
        let path = root.join(name);
        fs::write(path.as_std_path(), format!("payload of {name}\n")).expect("write input");
        inputs.push(path);
    }

    let options = DispatchOptions {
        task: "tr a-z A-Z".into(),
        ..DispatchOptions::default()
    };
    let (out_dir, mut dispatcher) =
        files_dispatcher(&root, &transport, &["w1"], inputs, options);
    dispatcher.run().expect("dispatch");
    dispatcher.finish();

    for name in names {
        let output = out_dir.join(format!("{name}.out"));
        let upper = format!("PAYLOAD OF {}\n", name.to_uppercase());
        assert_eq!(
            fs::read_to_string(output.as_std_path()).expect("read output"),
            upper,
            "wrong contents for {name}"
        );
    }
    assert_eq!(dispatcher.workers()[0].completed(), 4);
}

#[test]
fn input_files_survive_a_files_mode_run() {
    let guard = tempfile::tempdir().expect("tempdir");
    let root = utf8(guard.path());
    let transport = fake_transport(&root);
    let input = root.join("keep.txt");
    fs::write(input.as_std_path(), "keep me\n").expect("write input");

    let (_out_dir, mut dispatcher) = files_dispatcher(
        &root,
        &transport,
        &["w1"],
        vec![input.clone()],
        DispatchOptions::default(),
    );
    dispatcher.run().expect("dispatch");
    dispatcher.finish();

    assert_eq!(
        fs::read_to_string(input.as_std_path()).expect("input must survive"),
        "keep me\n"
    );
}

#[test]
fn init_file_is_uploaded_into_every_working_directory() {
    let guard = tempfile::tempdir().expect("tempdir");
    let root = utf8(guard.path());
    let transport = fake_transport(&root);
    let payload = root.join("corpus.dat");
    fs::write(payload.as_std_path(), "shared corpus\n").expect("write payload");
    let input = root.join("in.txt");
    fs::write(input.as_std_path(), "x\n").expect("write input");

    let (_out_dir, mut dispatcher) = files_dispatcher(
        &root,
        &transport,
        &["w1", "w2"],
        vec![input],
        DispatchOptions::default(),
    );
    dispatcher.initialize(Some(payload.as_path()), None).expect("initialize");
    dispatcher.run().expect("dispatch");
    dispatcher.finish();

    for hostname in ["w1", "w2"] {
        let uploaded = root.join(format!("wd_{hostname}/corpus.dat"));
        assert_eq!(
            fs::read_to_string(uploaded.as_std_path()).expect("uploaded payload"),
            "shared corpus\n"
        );
    }
}

#[test]
fn init_script_runs_in_the_working_directory_before_dispatch() {
    let guard = tempfile::tempdir().expect("tempdir");
    let root = utf8(guard.path());
    let transport = fake_transport(&root);
    let script = write_script(&root, "setup.sh", "#!/bin/sh\necho ready > init_marker\n");
    let input = root.join("in.txt");
    fs::write(input.as_std_path(), "x\n").expect("write input");

    let (out_dir, mut dispatcher) = files_dispatcher(
        &root,
        &transport,
        &["w1"],
        vec![input],
        DispatchOptions::default(),
    );
    dispatcher.initialize(None, Some(script.as_path())).expect("initialize");
    dispatcher.run().expect("dispatch");
    dispatcher.finish();

    let marker = root.join("wd_w1/init_marker");
    assert_eq!(
        fs::read_to_string(marker.as_std_path()).expect("init marker"),
        "ready\n"
    );
    assert!(out_dir.join("in.txt.out").as_std_path().exists());
}

#[test]
fn a_failing_init_script_drops_the_worker() {
    let guard = tempfile::tempdir().expect("tempdir");
    let root = utf8(guard.path());
    let transport = fake_transport(&root);
    let script = write_script(&root, "setup.sh", "#!/bin/sh\nexit 1\n");
    let input = root.join("in.txt");
    fs::write(input.as_std_path(), "x\n").expect("write input");

    let (out_dir, mut dispatcher) = files_dispatcher(
        &root,
        &transport,
        &["w1"],
        vec![input],
        DispatchOptions::default(),
    );
    dispatcher.initialize(None, Some(script.as_path())).expect("initialize");
    dispatcher.run().expect("an empty surviving fleet is not a fatal error");
    dispatcher.finish();

    assert!(dispatcher.workers()[0].excluded());
    assert!(!out_dir.join("in.txt.out").as_std_path().exists());
}
