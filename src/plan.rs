//! Parse the Agent planner's output into a structured plan.
//!
//! The planner replies in prose around a JSON document, usually inside a
//! markdown code fence. Extraction tries fences first, then falls back to
//! brace matching on the first top-level object.

use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::PLANNING_TIMEOUT_SECS;
use crate::error::{Error, Result};
use crate::models::TaskKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedTask {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_kind", deserialize_with = "deserialize_kind")]
    pub kind: TaskKind,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub relevant_files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedPhase {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tasks: Vec<PlannedTask>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub project_name: String,
    /// Generated agent-standards document, written to CLAUDE.md.
    #[serde(default)]
    pub claude_md: String,
    pub phases: Vec<PlannedPhase>,
}

fn default_kind() -> TaskKind {
    TaskKind::Coding
}

fn deserialize_kind<'de, D>(deserializer: D) -> std::result::Result<TaskKind, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    TaskKind::from_str(&s)
        .ok_or_else(|| serde::de::Error::custom(format!("unknown task kind: {s}")))
}

pub fn parse_planning_output(raw: &str) -> Result<Plan> {
    let json = extract_json(raw)?;
    let plan: Plan = serde_json::from_str(&json)
        .map_err(|e| Error::Validation(format!("malformed plan JSON: {e}")))?;
    validate(&plan)?;
    Ok(plan)
}

fn validate(plan: &Plan) -> Result<()> {
    if plan.phases.is_empty() {
        return Err(Error::Validation("plan has no phases".into()));
    }
    let mut seen = Vec::new();
    for phase in &plan.phases {
        if phase.tasks.is_empty() {
            return Err(Error::Validation(format!(
                "phase '{}' has no tasks",
                phase.name
            )));
        }
        for task in &phase.tasks {
            if task.name.trim().is_empty() {
                return Err(Error::Validation(format!(
                    "phase '{}' contains an unnamed task",
                    phase.name
                )));
            }
            if seen.contains(&task.name) {
                return Err(Error::Validation(format!(
                    "duplicate task name: '{}'",
                    task.name
                )));
            }
            seen.push(task.name.clone());
        }
    }
    Ok(())
}

fn extract_json(raw: &str) -> Result<String> {
    let fence =
        Regex::new(r"(?s)```(?:json)?\s*\n(.*?)\n\s*```").expect("fence pattern is valid");
    if let Some(captures) = fence.captures(raw) {
        return Ok(captures[1].trim().to_string());
    }

    let start = raw
        .find('{')
        .ok_or_else(|| Error::Validation("no JSON object found in planning output".into()))?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in raw[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Ok(raw[start..start + offset + ch.len_utf8()].to_string());
                }
            }
            _ => {}
        }
    }
    Err(Error::Validation(
        "unclosed JSON object in planning output".into(),
    ))
}

/// Run the agent's planning mode headless with the rendered planning brief
/// on stdin and return its raw output.
pub fn invoke_planner(project_dir: &Path, brief: &str) -> Result<String> {
    let mut child = Command::new("claude")
        .args(["-p", "--output-format", "text"])
        .current_dir(project_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            Error::Infrastructure(format!(
                "claude CLI not found ({e}); install Claude Code to plan"
            ))
        })?;

    if let Some(stdin) = child.stdin.take() {
        let mut stdin = stdin;
        stdin.write_all(brief.as_bytes())?;
    }

    let deadline = Instant::now() + Duration::from_secs(PLANNING_TIMEOUT_SECS);
    loop {
        match child.try_wait()? {
            Some(status) => {
                let output = child.wait_with_output()?;
                if !status.success() {
                    return Err(Error::Infrastructure(format!(
                        "planner exited with {}: {}",
                        status,
                        String::from_utf8_lossy(&output.stderr).trim()
                    )));
                }
                return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
            }
            None => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    return Err(Error::Infrastructure(format!(
                        "planning session timed out after {PLANNING_TIMEOUT_SECS}s"
                    )));
                }
                std::thread::sleep(Duration::from_millis(200));
            }
        }
    }
}
