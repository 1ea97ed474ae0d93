//! Remote execution contract: the shell wrappers run on each worker.
//!
//! All wrappers are templated against the worker's working directory and the
//! per-run KEY. A run leaves four files in the working directory:
//! `kssh_<KEY>_in` (uploaded input), `kssh_<KEY>_out` and `kssh_<KEY>_err`
//! (task streams) and `kssh_<KEY>_pid` (heartbeat/status). The pid file holds
//! the task's PID while it runs, rewritten every second so its mtime acts as
//! a heartbeat, and `Done,<exit_code>` once the task finishes.

use color_eyre::eyre::eyre;
use uuid::Uuid;

use crate::error::ConfigResult;

/// Generates the per-run KEY: the first eight hex digits of a fresh UUID.
///
/// The KEY namespaces every remote file of a run so concurrent runs sharing
/// a working directory cannot collide.
#[must_use]
pub fn generate_key() -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    uuid[..8].to_owned()
}

/// Builds the wrapper scripts for one worker's working directory.
#[derive(Debug, Clone)]
pub struct RemoteScripts {
    wd: String,
    key: String,
}

impl RemoteScripts {
    /// Creates a script builder for `wd`, shell-quoting the directory once.
    pub fn new(wd: &str, key: &str) -> ConfigResult<Self> {
        let quoted = shlex::try_quote(wd)
            .map_err(|err| eyre!("working directory {wd:?} cannot be shell-quoted: {err}"))?;
        Ok(Self {
            wd: quoted.into_owned(),
            key: key.to_owned(),
        })
    }

    fn file(&self, kind: &str) -> String {
        format!("kssh_{}_{kind}", self.key)
    }

    /// START: store stdin as the input file, daemonise a monitor around the
    /// task, and print the initial mtime of the pid file.
    ///
    /// The pid file is created before the monitor detaches so the printed
    /// mtime cannot race the monitor's first heartbeat write. The monitor
    /// rewrites the pid file each second while the task lives and replaces it
    /// with `Done,<exit_code>` when the task exits.
    #[must_use]
    pub fn start(&self, task: &str) -> String {
        let (wd, input, out, err, pid) = (
            &self.wd,
            self.file("in"),
            self.file("out"),
            self.file("err"),
            self.file("pid"),
        );
        format!(
            "mkdir -p {wd} && cd {wd} || exit 1\n\
             cat > {input}\n\
             : > {pid}\n\
             ( ( {task} ) < {input} > {out} 2> {err} &\n\
               pid=$!\n\
               while kill -0 \"$pid\" 2>/dev/null; do\n\
                 echo \"$pid\" > {pid}\n\
                 sleep 1\n\
               done\n\
               wait \"$pid\"\n\
               echo \"Done,$?\" > {pid}\n\
             ) < /dev/null > /dev/null 2>&1 &\n\
             stat -c %Y {pid}\n"
        )
    }

    /// CHECK: print `<mtime>,<pid-file-contents>` on one line, appending the
    /// output file's size once the pid file reports `Done`.
    #[must_use]
    pub fn check(&self) -> String {
        let (wd, out, pid) = (&self.wd, self.file("out"), self.file("pid"));
        format!(
            "cd {wd} || exit 1\n\
             hb=$(stat -c %Y {pid}) || exit 1\n\
             status=$(cat {pid}) || exit 1\n\
             case \"$status\" in\n\
               Done,*) size=$(stat -c %s {out} 2>/dev/null) && status=\"$status,$size\" ;;\n\
             esac\n\
             echo \"$hb,$status\"\n"
        )
    }

    /// FETCH: stream the task's stdout file to stdout and its stderr file to
    /// stderr; the dispatcher redirects both into local temp files.
    #[must_use]
    pub fn fetch(&self) -> String {
        let (wd, out, err) = (&self.wd, self.file("out"), self.file("err"));
        format!(
            "cd {wd} || exit 1\n\
             cat {out}\n\
             cat {err} >&2\n"
        )
    }

    /// CLEANUP: remove the run's files from the working directory.
    /// Destructive, so the dispatcher only issues it behind an opt-in flag.
    #[must_use]
    pub fn cleanup(&self) -> String {
        let (wd, input, out, err, pid) = (
            &self.wd,
            self.file("in"),
            self.file("out"),
            self.file("err"),
            self.file("pid"),
        );
        format!(
            "cd {wd} || exit 1\n\
             rm -f {input} {out} {err} {pid}\n"
        )
    }

    /// Initialization upload: store stdin under `basename` in the working
    /// directory.
    pub fn push_file(&self, basename: &str) -> ConfigResult<String> {
        let name = quote_name(basename)?;
        Ok(format!(
            "mkdir -p {wd} && cd {wd} || exit 1\ncat > {name}\n",
            wd = &self.wd
        ))
    }

    /// Initialization script: store stdin under `basename`, mark it
    /// executable, and run it in the working directory.
    pub fn run_script(&self, basename: &str) -> ConfigResult<String> {
        let name = quote_name(basename)?;
        Ok(format!(
            "mkdir -p {wd} && cd {wd} || exit 1\ncat > {name} && chmod a+x {name} && ./{name}\n",
            wd = &self.wd
        ))
    }
}

fn quote_name(basename: &str) -> ConfigResult<String> {
    let quoted = shlex::try_quote(basename)
        .map_err(|err| eyre!("file name {basename:?} cannot be shell-quoted: {err}"))?;
    Ok(quoted.into_owned())
}
