//! Brief assembly: render the prompt handed to the agent for one task.
//!
//! The template set is fixed (coding, review, retry variants, replan) and
//! rendering is deterministic for given inputs.

use minijinja::{context, Environment};
use serde::Serialize;

use crate::error::Result;
use crate::models::{Phase, Task, TaskKind};

const CODING_TEMPLATE: &str = include_str!("templates/coding.md");
const REVIEW_TEMPLATE: &str = include_str!("templates/review.md");
const RETRY_CODING_TEMPLATE: &str = include_str!("templates/retry_coding.md");
const RETRY_REVIEW_TEMPLATE: &str = include_str!("templates/retry_review.md");
const REPLAN_TEMPLATE: &str = include_str!("templates/replan.md");

/// A finished upstream task summarized for the brief.
#[derive(Debug, Clone, Serialize)]
pub struct CompletedWork {
    pub name: String,
    pub summary: Option<String>,
    pub files_changed: Vec<String>,
}

/// Everything a task brief can draw on.
#[derive(Debug, Clone, Serialize, Default)]
pub struct BriefContext {
    pub project_name: String,
    pub project_overview: String,
    pub total_phases: i64,
    pub completed: Vec<CompletedWork>,
    /// Findings from the review that requested these changes.
    pub review_findings: Vec<String>,
    /// Failure context from the prior attempt, present on retries.
    pub error_context: Option<String>,
    /// For review tasks: what the reviewed task changed.
    pub files_under_review: Vec<String>,
}

pub struct BriefRenderer {
    env: Environment<'static>,
}

impl BriefRenderer {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("coding", CODING_TEMPLATE)
            .expect("coding template should be valid");
        env.add_template("review", REVIEW_TEMPLATE)
            .expect("review template should be valid");
        env.add_template("retry_coding", RETRY_CODING_TEMPLATE)
            .expect("retry_coding template should be valid");
        env.add_template("retry_review", RETRY_REVIEW_TEMPLATE)
            .expect("retry_review template should be valid");
        env.add_template("replan", REPLAN_TEMPLATE)
            .expect("replan template should be valid");
        Self { env }
    }

    /// Render the brief for a task, selecting the retry variant when the
    /// task carries failure context from a prior attempt.
    pub fn render_task_brief(
        &self,
        task: &Task,
        phase: &Phase,
        ctx: &BriefContext,
    ) -> Result<String> {
        let name = match (task.kind, ctx.error_context.is_some()) {
            (TaskKind::Coding, false) => "coding",
            (TaskKind::Coding, true) => "retry_coding",
            (TaskKind::Review, false) => "review",
            (TaskKind::Review, true) => "retry_review",
        };
        let template = self.env.get_template(name)?;
        let rendered = template.render(context! {
            task => task,
            phase => phase,
            ctx => ctx,
        })?;
        Ok(rendered)
    }

    /// Render the planning brief from the PRD (used for plan and replan).
    pub fn render_planning_brief(&self, prd: &str, bootstrap: Option<&str>) -> Result<String> {
        let template = self.env.get_template("replan")?;
        let rendered = template.render(context! {
            prd => prd.trim(),
            bootstrap => bootstrap.map(str::trim).filter(|s| !s.is_empty()),
        })?;
        Ok(rendered)
    }
}

impl Default for BriefRenderer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PhaseStatus, TaskStatus};
    use chrono::Utc;
    use uuid::Uuid;

    fn fixture() -> (Task, Phase) {
        let phase = Phase {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            sequence: 1,
            name: "Foundation".into(),
            description: Some("Scaffolding".into()),
            status: PhaseStatus::Running,
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
        };
        let task = Task {
            id: Uuid::new_v4(),
            phase_id: phase.id,
            project_id: phase.project_id,
            sequence: 1,
            name: "Set up project".into(),
            description: Some("Create the skeleton".into()),
            kind: TaskKind::Coding,
            brief_path: None,
            status: TaskStatus::Pending,
            retry_count: 0,
            error_context: None,
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
        };
        (task, phase)
    }

    #[test]
    fn coding_brief_includes_task_and_reporting_contract() {
        let renderer = BriefRenderer::new();
        let (task, phase) = fixture();
        let ctx = BriefContext {
            project_name: "todo-api".into(),
            total_phases: 2,
            ..BriefContext::default()
        };
        let brief = renderer.render_task_brief(&task, &phase, &ctx).unwrap();
        assert!(brief.contains("Set up project"));
        assert!(brief.contains(&task.id.to_string()));
        assert!(brief.contains("tc_report_completion"));
    }

    #[test]
    fn retry_variant_selected_when_error_context_present() {
        let renderer = BriefRenderer::new();
        let (task, phase) = fixture();
        let ctx = BriefContext {
            error_context: Some("Previous attempt failed: syntax error".into()),
            ..BriefContext::default()
        };
        let brief = renderer.render_task_brief(&task, &phase, &ctx).unwrap();
        assert!(brief.contains("syntax error"));
        assert!(brief.contains("previous attempt"));
    }

    #[test]
    fn review_brief_lists_files_and_verdict_contract() {
        let renderer = BriefRenderer::new();
        let (mut task, phase) = fixture();
        task.kind = TaskKind::Review;
        let ctx = BriefContext {
            files_under_review: vec!["src/lib.rs".into(), "src/db.rs".into()],
            ..BriefContext::default()
        };
        let brief = renderer.render_task_brief(&task, &phase, &ctx).unwrap();
        assert!(brief.contains("src/lib.rs"));
        assert!(brief.contains("tc_report_review"));
        assert!(brief.contains("changes_requested"));
    }

    #[test]
    fn rendering_is_deterministic() {
        let renderer = BriefRenderer::new();
        let (task, phase) = fixture();
        let ctx = BriefContext::default();
        let first = renderer.render_task_brief(&task, &phase, &ctx).unwrap();
        let second = renderer.render_task_brief(&task, &phase, &ctx).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn planning_brief_embeds_prd() {
        let renderer = BriefRenderer::new();
        let brief = renderer
            .render_planning_brief("Build a todo API", Some("Requires docker"))
            .unwrap();
        assert!(brief.contains("Build a todo API"));
        assert!(brief.contains("Requires docker"));
        assert!(brief.contains("phases"));
    }
}
