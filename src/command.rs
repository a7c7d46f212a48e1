use std::path::Path;
use std::process::{Command, Output, Stdio};

fn io_err(message: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, message.to_string())
}

/// Run `executable` with its output captured. A non-zero exit turns the
/// captured stderr into the returned error.
pub fn run_command(
    executable: &str,
    arguments: Vec<String>,
    cwd: Option<&Path>,
    descriptor: &str,
) -> std::io::Result<Output> {
    let mut command = Command::new(executable);
    command.args(arguments);
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }

    let output = command.output()?;

    if !output.status.success() {
        match String::from_utf8(output.stderr) {
            Ok(text) => return Err(io_err(&format!("{descriptor} failed\n\n{text}"))),
            Err(_) => {
                return Err(io_err(&format!(
                    "{descriptor} failed and the output was not UTF-8"
                )))
            }
        }
    }

    return Ok(output);
}

/// Run `executable` with stdout and stderr passed straight through, for
/// long-running scripts whose progress should be visible as it happens.
pub fn run_streaming(
    executable: &str,
    arguments: Vec<String>,
    cwd: Option<&Path>,
    descriptor: &str,
) -> std::io::Result<()> {
    let mut command = Command::new(executable);
    command.args(arguments).stdin(Stdio::null());
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }

    let mut process = command.spawn()?;
    let exit_status = process.wait()?;

    if !exit_status.success() {
        return Err(io_err(&format!("{descriptor} failed")));
    }

    return Ok(());
}
