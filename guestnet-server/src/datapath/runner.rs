use anyhow::{Context, Result};
use std::process::Command;
use tracing::debug;

/// Runs host networking tools (`ip`, `sysctl`).
pub trait ProcessRunner {
    /// Run `program` with `args`, returning stdout. A non-zero exit status is
    /// an error carrying stderr.
    fn run(&self, program: &str, args: &[&str]) -> Result<String>;

    fn ip(&self, args: &[&str]) -> Result<()> {
        self.run("ip", args).map(|_| ())
    }

    /// `ip -n <netns> ...`
    fn ip_netns(&self, netns: &str, args: &[&str]) -> Result<()> {
        let mut full = vec!["-n", netns];
        full.extend_from_slice(args);
        self.run("ip", &full).map(|_| ())
    }

    fn sysctl_w(&self, key: &str, value: &str) -> Result<()> {
        let kv = format!("{key}={value}");
        self.run("sysctl", &["-w", &kv]).map(|_| ())
    }
}

/// Spawns the tools with `std::process::Command`.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandRunner;

impl ProcessRunner for CommandRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        let output = Command::new(program)
            .args(args)
            .output()
            .with_context(|| format!("Failed to execute '{program}'"))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow::anyhow!(
                "'{} {}' failed: {}",
                program,
                args.join(" "),
                stderr.trim()
            ));
        }

        debug!("{} {}", program, args.join(" "));
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_runner_reports_stderr() {
        let err = CommandRunner
            .run("sh", &["-c", "echo nope >&2; exit 3"])
            .unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_command_runner_returns_stdout() {
        let out = CommandRunner.run("echo", &["hello"]).unwrap();
        assert_eq!(out.trim(), "hello");
    }
}
