// SPDX-License-Identifier: GPL-3.0-only

//! External tool execution
//!
//! Every tool runs to completion with stdout and stderr captured. A child
//! that died from a signal (or reports a status above 128) is followed by a
//! short grace sleep before its status is acted upon, so that the same
//! signal has a chance to reach and terminate this process first.

use std::os::unix::process::ExitStatusExt;
use std::process::{Command, ExitStatus};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use nix::sys::signal::Signal;

use crate::{Result, SysError};

static SIGNAL_GRACE_MS: AtomicU64 = AtomicU64::new(1000);

/// Set the sleep applied after a child was terminated by a signal.
pub fn set_signal_grace(grace: Duration) {
    SIGNAL_GRACE_MS.store(grace.as_millis() as u64, Ordering::Relaxed);
}

pub fn render(tool: &str, args: &[&str]) -> String {
    if args.is_empty() {
        tool.to_string()
    } else {
        format!("{} {}", tool, args.join(" "))
    }
}

fn status_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => -1,
    }
}

fn describe_signal(status: ExitStatus) -> String {
    match status.signal().map(Signal::try_from) {
        Some(Ok(signal)) => signal.as_str().to_string(),
        Some(Err(_)) => "unknown signal".to_string(),
        None => format!("status {}", status_code(status)),
    }
}

/// Run `tool` and return its status together with the combined output.
///
/// A non-zero status is not an error here.
pub fn run_with_status(tool: &str, args: &[&str]) -> Result<(i32, String)> {
    let resolved = which::which(tool).map_err(|_| SysError::ToolNotFound(tool.to_string()))?;
    tracing::debug!("exec: {}", render(tool, args));

    let output = Command::new(&resolved).args(args).output()?;
    let status = status_code(output.status);
    if output.status.signal().is_some() || status > 128 {
        tracing::warn!(
            "{} terminated by {}",
            render(tool, args),
            describe_signal(output.status)
        );
        std::thread::sleep(Duration::from_millis(
            SIGNAL_GRACE_MS.load(Ordering::Relaxed),
        ));
    }

    let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        if !combined.is_empty() && !combined.ends_with('\n') {
            combined.push('\n');
        }
        combined.push_str(&stderr);
    }

    Ok((status, combined.trim_end().to_string()))
}

/// Run `tool`, failing with [`SysError::CommandFailed`] on a non-zero status.
pub fn run(tool: &str, args: &[&str]) -> Result<String> {
    let (status, output) = run_with_status(tool, args)?;
    if status != 0 {
        tracing::error!("{} failed with status {status}", render(tool, args));
        return Err(SysError::CommandFailed {
            command: render(tool, args),
            status,
            output,
        });
    }
    Ok(output)
}
