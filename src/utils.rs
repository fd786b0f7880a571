//! Shared helpers: external command execution and small text utilities.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Seam for every external program the console runs (pm2, bash).
/// A missing binary surfaces as `io::ErrorKind::NotFound`.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput>;

    /// Fire-and-forget; the child is not awaited.
    fn spawn_detached(&self, program: &str, args: &[String]) -> std::io::Result<()>;
}

/// Runs programs through `tokio::process`.
#[derive(Debug, Default, Clone)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput> {
        tracing::debug!("exec: {} {}", program, args.join(" "));
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;
        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    fn spawn_detached(&self, program: &str, args: &[String]) -> std::io::Result<()> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        tokio::spawn(async move {
            if let Err(e) = child.wait().await {
                tracing::warn!("Detached command failed: {}", e);
            }
        });
        Ok(())
    }
}

/// `bash -lc <command>` argument vector.
pub fn shell_args(command: &str) -> Vec<String> {
    vec!["-lc".to_string(), command.to_string()]
}

/// Keep the last `max` characters of `s`.
pub fn tail_chars(s: &str, max: usize) -> String {
    let count = s.chars().count();
    if count <= max {
        return s.to_string();
    }
    s.chars().skip(count - max).collect()
}

/// Keep the last `lines` newline-separated lines of `s`.
pub fn tail_lines(s: &str, lines: usize) -> String {
    let all: Vec<&str> = s.split('\n').collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut idx = 0;
    while value >= 1024.0 && idx < UNITS.len() - 1 {
        value /= 1024.0;
        idx += 1;
    }
    format!("{:.1} {}", value, UNITS[idx])
}

pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Parse a `lines` query value and clamp it into `[min, max]`.
pub fn clamp_lines(raw: Option<&str>, default: usize, min: usize, max: usize) -> usize {
    raw.and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
        .clamp(min, max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tail_chars() {
        assert_eq!(tail_chars("abcdef", 3), "def");
        assert_eq!(tail_chars("ab", 3), "ab");
        assert_eq!(tail_chars("äöüß", 2), "üß");
    }

    #[test]
    fn test_tail_lines() {
        assert_eq!(tail_lines("a\nb\nc\nd", 2), "c\nd");
        assert_eq!(tail_lines("only", 10), "only");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512.0 B");
        assert_eq!(format_bytes(256 * 1024 * 1024), "256.0 MB");
    }

    #[test]
    fn test_clamp_lines() {
        assert_eq!(clamp_lines(None, 80, 10, 500), 80);
        assert_eq!(clamp_lines(Some("3"), 80, 10, 500), 10);
        assert_eq!(clamp_lines(Some("9999"), 80, 10, 300), 300);
        assert_eq!(clamp_lines(Some("abc"), 80, 10, 500), 80);
    }

    #[tokio::test]
    async fn test_missing_binary_is_not_found() {
        let err = ProcessRunner
            .run("definitely-not-a-real-binary-xyz", &[])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}
