use core::time::Duration;
use std::{
    io::{self, Read as _},
    process::{Child, Command, ExitStatus, Stdio},
    thread,
    time::Instant,
};

use log::{debug, trace};
use types::PxeError;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub(crate) struct CommandOutput {
    pub(crate) status: ExitStatus,
    pub(crate) stdout: String,
    pub(crate) stderr: String,
}

pub(crate) fn describe(cmd: &Command) -> String {
    let mut parts = vec![cmd.get_program().to_string_lossy().into_owned()];
    parts.extend(cmd.get_args().map(|a| a.to_string_lossy().into_owned()));
    parts.join(" ")
}

fn drain<R>(pipe: Option<R>) -> thread::JoinHandle<io::Result<Vec<u8>>>
where
    R: io::Read + Send + 'static,
{
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            pipe.read_to_end(&mut buf)?;
        }
        Ok(buf)
    })
}

fn join(handle: thread::JoinHandle<io::Result<Vec<u8>>>) -> Result<String, PxeError> {
    let buf = handle
        .join()
        .map_err(|_e| PxeError::Custom(String::from("Output reader thread panicked")))??;

    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn wait_with_timeout(
    child: &mut Child,
    timeout: Duration,
    desc: &str,
) -> Result<ExitStatus, PxeError> {
    let start = Instant::now();

    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }

        if start.elapsed() >= timeout {
            debug!("Command `{desc}` timed out, killing it");

            child.kill()?;
            child.wait()?;

            return Err(PxeError::CommandTimeout {
                command: desc.to_owned(),
                secs: timeout.as_secs(),
            });
        }

        thread::sleep(POLL_INTERVAL);
    }
}

/// Runs a command to completion and collects its output, whatever its exit status
pub(crate) fn output(cmd: &mut Command, timeout: Duration) -> Result<CommandOutput, PxeError> {
    let desc = describe(cmd);
    debug!("Running `{desc}`");

    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let status = wait_with_timeout(&mut child, timeout, &desc)?;

    let output = CommandOutput {
        status,
        stdout: join(stdout)?,
        stderr: join(stderr)?,
    };

    trace!("`{desc}` exited with {status}");

    Ok(output)
}

/// Like [`output`], but a non-zero exit status is an error
pub(crate) fn run(cmd: &mut Command, timeout: Duration) -> Result<CommandOutput, PxeError> {
    let output = output(cmd, timeout)?;

    if !output.status.success() {
        return Err(PxeError::Command {
            command: describe(cmd),
            status: output.status.to_string(),
            stderr: output.stderr.trim().to_owned(),
        });
    }

    Ok(output)
}

pub(crate) fn tool_available(name: &str) -> bool {
    let found = which::which(name).is_ok();

    if !found {
        debug!("{name} isn't available in PATH");
    }

    found
}
