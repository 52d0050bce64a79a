use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use anyhow::Context;
use rand::Rng;

use crate::common::quote::{quote_arg, quote_args};

const NAME_ALPHABET: &[u8] = b"abcdefghijklmnpqrstuvwxyz";
const NAME_LENGTH: usize = 10;
pub const SCRIPT_SUFFIX: &str = ".sh";

/// Standard output and error file names inside an output directory.
pub const STDOUT_FILE: &str = "o";
pub const STDERR_FILE: &str = "e";

/// Builds the `/bin/sh` script that wraps a user executable.
#[derive(Debug, Clone)]
pub struct BatchScript<'a> {
    executable: &'a str,
    args: &'a [String],
    output_dir: Option<&'a Path>,
}

impl<'a> BatchScript<'a> {
    pub fn new(executable: &'a str, args: &'a [String]) -> Self {
        Self {
            executable,
            args,
            output_dir: None,
        }
    }

    /// Redirects output into `o`/`e` files of `dir` and scrubs the working directory before and
    /// after the run.
    pub fn with_output_dir(mut self, dir: &'a Path) -> Self {
        self.output_dir = Some(dir);
        self
    }

    pub fn render(&self) -> String {
        // The executable is interpolated as given; only its arguments are quoted.
        let executable = self.executable;
        let mut command = executable.to_string();
        if !self.args.is_empty() {
            command.push(' ');
            command.push_str(&quote_args(self.args));
        }

        let (create, append) = match self.output_dir {
            Some(dir) => {
                let out = quote_arg(&dir.join(STDOUT_FILE).to_string_lossy());
                let err = quote_arg(&dir.join(STDERR_FILE).to_string_lossy());
                (
                    format!(" > {out} 2> {err}"),
                    format!(" >> {out} 2>> {err}"),
                )
            }
            None => (String::new(), String::new()),
        };

        let mut script = String::from("#!/bin/sh\n");
        if self.output_dir.is_some() {
            script.push_str("rm -rf *\n");
        }
        script.push_str(&format!("echo $(date) - {executable} starting{create}\n"));
        log::debug!("Exec line for {}: {command}", self.executable);
        script.push_str(&format!("{command}{append}\n"));
        script.push_str("rc=$?\n");
        script.push_str(&format!(
            "echo $(date) - {executable} ending with code $rc{append}\n"
        ));
        if self.output_dir.is_some() {
            script.push_str("rm -rf *\n");
        }
        script.push_str("exit $rc\n");
        script
    }
}

pub fn random_name() -> String {
    let mut rng = rand::rng();
    (0..NAME_LENGTH)
        .map(|_| char::from(NAME_ALPHABET[rng.random_range(0..NAME_ALPHABET.len())]))
        .collect()
}

/// Writes an executable script under a fresh random name inside `dir`.
pub fn write_script(dir: &Path, contents: &str) -> anyhow::Result<PathBuf> {
    loop {
        let path = dir.join(format!("{}{SCRIPT_SUFFIX}", random_name()));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o755)
            .open(&path);
        match file {
            Ok(mut file) => {
                file.write_all(contents.as_bytes())
                    .with_context(|| format!("Cannot write batch script {}", path.display()))?;
                return Ok(path);
            }
            Err(error) if error.kind() == ErrorKind::AlreadyExists => continue,
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("Cannot create batch script {}", path.display()));
            }
        }
    }
}

/// Writes an executable script into a temporary file that is removed on drop.
pub fn write_temp_script(contents: &str) -> anyhow::Result<tempfile::TempPath> {
    let mut file = tempfile::Builder::new()
        .suffix(SCRIPT_SUFFIX)
        .permissions(std::fs::Permissions::from_mode(0o755))
        .tempfile()
        .context("Cannot create temporary script")?;
    file.write_all(contents.as_bytes())
        .context("Cannot write temporary script")?;
    Ok(file.into_temp_path())
}

/// Creates a fresh directory with a random name inside `parent` and returns its name.
pub fn create_unique_dir(parent: &Path) -> anyhow::Result<String> {
    loop {
        let name = random_name();
        match std::fs::create_dir(parent.join(&name)) {
            Ok(()) => return Ok(name),
            Err(error) if error.kind() == ErrorKind::AlreadyExists => continue,
            Err(error) => {
                return Err(error).with_context(|| {
                    format!("Cannot create job directory in {}", parent.display())
                });
            }
        }
    }
}
