//! Bootstrap verification: extract shell predicates from `bootstrap.md` and
//! run them before planning starts.
//!
//! Three sources of checks: the Prerequisites table (Tool | Install |
//! Verify), `**Verify:**` lines for credential connectivity, and `.env`
//! variable references. A few built-in checks run regardless.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;

use crate::config::CHECK_TIMEOUT_SECS;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Check {
    pub name: String,
    pub check_type: CheckType,
    pub command: String,
    pub expected: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckType {
    Tool,
    Credential,
    Env,
}

impl CheckType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tool => "tool",
            Self::Credential => "credential",
            Self::Env => "env",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub check: Check,
    pub passed: bool,
    pub output: String,
}

/// Tooling the orchestrator itself needs, verified on every run.
fn builtin_checks() -> Vec<Check> {
    [
        ("claude", "claude --version"),
        ("tmux", "tmux -V"),
        ("git", "git status"),
    ]
    .into_iter()
    .map(|(name, command)| Check {
        name: name.to_string(),
        check_type: CheckType::Tool,
        command: command.to_string(),
        expected: None,
    })
    .collect()
}

pub fn parse_bootstrap(content: &str) -> Vec<Check> {
    let mut checks = Vec::new();
    checks.extend(parse_tool_table(content));
    checks.extend(parse_credential_checks(content));
    checks.extend(parse_env_checks(content));
    checks.extend(builtin_checks());
    checks
}

/// Markdown tables with Tool and Verify columns.
fn parse_tool_table(content: &str) -> Vec<Check> {
    let mut checks = Vec::new();
    let mut tool_idx = 0usize;
    let mut verify_idx = 0usize;
    let mut in_table = false;

    for line in content.lines() {
        let stripped = line.trim();
        if !in_table {
            if stripped.contains('|') {
                let cells: Vec<String> = split_cells(stripped);
                let lower: Vec<String> = cells.iter().map(|c| c.to_lowercase()).collect();
                if let (Some(t), Some(v)) = (
                    lower.iter().position(|c| c == "tool"),
                    lower.iter().position(|c| c == "verify"),
                ) {
                    tool_idx = t;
                    verify_idx = v;
                    in_table = true;
                }
            }
            continue;
        }
        if !stripped.contains('|') {
            in_table = false;
            continue;
        }
        // Separator rows are dashes and colons only.
        if stripped
            .chars()
            .all(|c| matches!(c, '|' | '-' | ':' | ' '))
        {
            continue;
        }
        let cells = split_cells(stripped);
        if cells.len() <= tool_idx.max(verify_idx) {
            continue;
        }
        let tool = strip_markdown(&cells[tool_idx]);
        let verify = strip_markdown(&cells[verify_idx]);
        if verify.is_empty() || verify == "-" {
            continue;
        }
        checks.push(Check {
            name: tool.to_lowercase().replace(' ', "_"),
            check_type: CheckType::Tool,
            command: verify,
            expected: None,
        });
    }
    checks
}

/// `**Verify:** `command`` lines.
fn parse_credential_checks(content: &str) -> Vec<Check> {
    let pattern = Regex::new(r"\*\*Verify:\*\*\s*`([^`]+)`").expect("verify pattern is valid");
    pattern
        .captures_iter(content)
        .map(|captures| {
            let command = captures[1].to_string();
            let base = command
                .split_whitespace()
                .next()
                .and_then(|word| word.rsplit('/').next())
                .unwrap_or("check");
            Check {
                name: format!("credential_{base}"),
                check_type: CheckType::Credential,
                command,
                expected: None,
            }
        })
        .collect()
}

/// `VAR_NAME` references inside .env-related sections become existence
/// checks.
fn parse_env_checks(content: &str) -> Vec<Check> {
    let var = Regex::new(r"`([A-Z][A-Z0-9_]+)`").expect("env pattern is valid");
    let mut checks = Vec::new();
    let mut in_env_section = false;
    for line in content.lines() {
        let lower = line.trim().to_lowercase();
        if lower.contains(".env")
            && ["populate", "create", "variable", "environment", "config"]
                .iter()
                .any(|kw| lower.contains(kw))
        {
            in_env_section = true;
            continue;
        }
        if in_env_section && line.trim_start().starts_with('#') {
            in_env_section = false;
        }
        if in_env_section {
            for captures in var.captures_iter(line) {
                let name = captures[1].to_string();
                checks.push(Check {
                    name: format!("env_{}", name.to_lowercase()),
                    check_type: CheckType::Env,
                    command: name,
                    expected: Some("set".into()),
                });
            }
        }
    }
    checks
}

fn split_cells(line: &str) -> Vec<String> {
    line.split('|')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}

fn strip_markdown(text: &str) -> String {
    text.trim_matches('`').replace("**", "").trim().to_string()
}

/// Run one check in the project directory. Env checks look up the variable;
/// everything else runs through the shell with a timeout.
pub fn run_check(check: &Check, project_dir: &Path) -> CheckResult {
    if check.check_type == CheckType::Env {
        let passed = std::env::var(&check.command).map(|v| !v.is_empty()).unwrap_or(false);
        return CheckResult {
            check: check.clone(),
            passed,
            output: if passed { "set".into() } else { "unset".into() },
        };
    }

    let spawned = Command::new("sh")
        .arg("-c")
        .arg(&check.command)
        .current_dir(project_dir)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn();
    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            return CheckResult {
                check: check.clone(),
                passed: false,
                output: format!("failed to spawn: {e}"),
            }
        }
    };

    let deadline = std::time::Instant::now() + Duration::from_secs(CHECK_TIMEOUT_SECS);
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                let output = child
                    .wait_with_output()
                    .map(|o| {
                        let mut text = String::from_utf8_lossy(&o.stdout).into_owned();
                        text.push_str(&String::from_utf8_lossy(&o.stderr));
                        text.trim().to_string()
                    })
                    .unwrap_or_default();
                return CheckResult {
                    check: check.clone(),
                    passed: status.success(),
                    output,
                };
            }
            Ok(None) => {
                if std::time::Instant::now() >= deadline {
                    let _ = child.kill();
                    return CheckResult {
                        check: check.clone(),
                        passed: false,
                        output: format!("timed out after {CHECK_TIMEOUT_SECS}s"),
                    };
                }
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(e) => {
                return CheckResult {
                    check: check.clone(),
                    passed: false,
                    output: format!("wait failed: {e}"),
                }
            }
        }
    }
}

/// Parse the bootstrap file and run every check, returning the results in
/// order.
pub fn verify(bootstrap_path: &Path, project_dir: &Path) -> Result<Vec<CheckResult>> {
    let content = std::fs::read_to_string(bootstrap_path)?;
    let checks = parse_bootstrap(&content);
    Ok(checks
        .iter()
        .map(|check| run_check(check, project_dir))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tool_table() {
        let content = "\
# Bootstrap

| Tool | Install | Verify |
|------|---------|--------|
| Node | brew install node | `node --version` |
| Docker | - | `docker info` |

Other text.
";
        let checks = parse_tool_table(content);
        assert_eq!(checks.len(), 2);
        assert_eq!(checks[0].name, "node");
        assert_eq!(checks[0].command, "node --version");
        assert_eq!(checks[1].command, "docker info");
    }

    #[test]
    fn parses_credential_verify_lines() {
        let content = "Set up the API key.\n**Verify:** `curl -fsS https://api.example.com/ping`\n";
        let checks = parse_credential_checks(content);
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0].name, "credential_curl");
        assert!(checks[0].command.starts_with("curl"));
    }

    #[test]
    fn parses_env_vars_only_inside_env_sections() {
        let content = "\
Create a .env file with these variables:
- `DATABASE_URL` - connection string
- `API_KEY` - service key

# Next section
`UNRELATED_VAR` outside the section.
";
        let checks = parse_env_checks(content);
        let names: Vec<&str> = checks.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["env_database_url", "env_api_key"]);
    }

    #[test]
    fn builtin_checks_always_present() {
        let checks = parse_bootstrap("nothing relevant");
        let names: Vec<&str> = checks.iter().map(|c| c.name.as_str()).collect();
        assert!(names.contains(&"claude"));
        assert!(names.contains(&"tmux"));
        assert!(names.contains(&"git"));
    }

    #[test]
    fn env_check_reads_process_environment() {
        let check = Check {
            name: "env_path".into(),
            check_type: CheckType::Env,
            command: "PATH".into(),
            expected: Some("set".into()),
        };
        let result = run_check(&check, Path::new("."));
        assert!(result.passed);
    }
}
