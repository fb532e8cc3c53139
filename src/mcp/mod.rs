//! MCP stdio server the agent connects to from inside its pane session.
//! Thin transport over the operations in `control`; every tool call carries
//! the task id issued in the brief.

mod config;

pub use config::{generate_mcp_config, write_mcp_config};

use std::future::Future;
use std::time::Duration;

use rmcp::{
    handler::server::tool::{Parameters, ToolRouter},
    model::{CallToolResult, Content, ServerInfo},
    schemars::JsonSchema,
    tool, tool_handler, tool_router,
    ErrorData as McpError, ServerHandler, ServiceExt,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::control::{self, ReviewVerdict};
use crate::db::Database;
use crate::error::Error;
use crate::events::EventBus;

const HUMAN_INPUT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Clone)]
pub struct McpServer {
    db: Database,
    bus: EventBus,
    tool_router: ToolRouter<Self>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ReportProgressRequest {
    #[schemars(description = "The task ID from your brief")]
    pub task_id: String,
    #[schemars(description = "What you just did or are about to do")]
    pub note: String,
    #[schemars(description = "Estimated completion percentage (0-100)")]
    pub percent: Option<u8>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ReportCompletionRequest {
    #[schemars(description = "The task ID from your brief")]
    pub task_id: String,
    #[schemars(description = "Summary of what was built and how it was verified")]
    pub summary: String,
    #[schemars(description = "Paths of files you changed")]
    #[serde(default)]
    pub files_changed: Vec<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ReportFailureRequest {
    #[schemars(description = "The task ID from your brief")]
    pub task_id: String,
    #[schemars(description = "Short description of what failed")]
    pub message: String,
    #[schemars(description = "Error output or other context for the retry")]
    pub context: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ReportReviewRequest {
    #[schemars(description = "The review task ID from your brief")]
    pub task_id: String,
    #[schemars(description = "Either 'approved' or 'changes_requested'")]
    pub verdict: String,
    #[schemars(description = "One entry per concrete problem found")]
    #[serde(default)]
    pub findings: Vec<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct GetContextRequest {
    #[schemars(description = "The task ID from your brief")]
    pub task_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct RequestHumanInputRequest {
    #[schemars(description = "The task ID from your brief")]
    pub task_id: String,
    #[schemars(description = "The question for the operator")]
    pub question: String,
    #[schemars(description = "Optional multiple-choice answers")]
    #[serde(default)]
    pub choices: Vec<String>,
}

impl McpServer {
    pub fn new(db: Database, bus: EventBus) -> Self {
        Self {
            db,
            bus,
            tool_router: Self::tool_router(),
        }
    }

    fn parse_task_id(s: &str) -> Result<Uuid, McpError> {
        Uuid::parse_str(s)
            .map_err(|e| McpError::invalid_params(format!("invalid task id: {e}"), None))
    }

    /// Precondition violations are non-retriable for the agent: the engine
    /// has already moved on.
    fn map_err(err: Error) -> McpError {
        match &err {
            Error::Precondition(_) | Error::NotFound(_) => {
                McpError::invalid_params(format!("PRECONDITION: {err}"), None)
            }
            _ => McpError::internal_error(err.to_string(), None),
        }
    }
}

#[tool_router]
impl McpServer {
    #[tool(description = "Report progress on the current task")]
    async fn tc_report_progress(
        &self,
        params: Parameters<ReportProgressRequest>,
    ) -> Result<CallToolResult, McpError> {
        let req = params.0;
        let task_id = Self::parse_task_id(&req.task_id)?;
        control::report_progress(&self.db, &self.bus, task_id, req.percent, &req.note)
            .map_err(Self::map_err)?;
        Ok(CallToolResult::success(vec![Content::text(
            "Progress recorded",
        )]))
    }

    #[tool(description = "Report that the current coding task is complete and verified")]
    async fn tc_report_completion(
        &self,
        params: Parameters<ReportCompletionRequest>,
    ) -> Result<CallToolResult, McpError> {
        let req = params.0;
        let task_id = Self::parse_task_id(&req.task_id)?;
        let review = control::report_completion(
            &self.db,
            &self.bus,
            task_id,
            &req.summary,
            &req.files_changed,
        )
        .map_err(Self::map_err)?;
        Ok(CallToolResult::success(vec![Content::text(format!(
            "Task completed; review {} enqueued",
            review.id
        ))]))
    }

    #[tool(description = "Report that the current task has failed")]
    async fn tc_report_failure(
        &self,
        params: Parameters<ReportFailureRequest>,
    ) -> Result<CallToolResult, McpError> {
        let req = params.0;
        let task_id = Self::parse_task_id(&req.task_id)?;
        control::report_failure(
            &self.db,
            &self.bus,
            task_id,
            &req.message,
            req.context.as_deref(),
        )
        .map_err(Self::map_err)?;
        Ok(CallToolResult::success(vec![Content::text(
            "Failure recorded",
        )]))
    }

    #[tool(description = "Submit the verdict of a review task")]
    async fn tc_report_review(
        &self,
        params: Parameters<ReportReviewRequest>,
    ) -> Result<CallToolResult, McpError> {
        let req = params.0;
        let task_id = Self::parse_task_id(&req.task_id)?;
        let verdict = ReviewVerdict::from_str(&req.verdict).ok_or_else(|| {
            McpError::invalid_params(
                format!("verdict must be 'approved' or 'changes_requested', got '{}'", req.verdict),
                None,
            )
        })?;
        let followup =
            control::report_review(&self.db, &self.bus, task_id, verdict, &req.findings)
                .map_err(Self::map_err)?;
        let message = match followup {
            Some(task) => format!("Verdict recorded; rework task {} enqueued", task.id),
            None => "Verdict recorded".to_string(),
        };
        Ok(CallToolResult::success(vec![Content::text(message)]))
    }

    #[tool(description = "Get briefs, completed work, findings, and recent events for a task")]
    async fn tc_get_context(
        &self,
        params: Parameters<GetContextRequest>,
    ) -> Result<CallToolResult, McpError> {
        let req = params.0;
        let task_id = Self::parse_task_id(&req.task_id)?;
        let context = control::get_context(&self.db, task_id).map_err(Self::map_err)?;
        let json = serde_json::to_string_pretty(&context)
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        Ok(CallToolResult::success(vec![Content::text(json)]))
    }

    #[tool(description = "Ask the operator a question and wait for their answer")]
    async fn tc_request_human_input(
        &self,
        params: Parameters<RequestHumanInputRequest>,
    ) -> Result<CallToolResult, McpError> {
        let req = params.0;
        let task_id = Self::parse_task_id(&req.task_id)?;
        let response = control::request_human_input(
            &self.db,
            &self.bus,
            task_id,
            &req.question,
            &req.choices,
            HUMAN_INPUT_TIMEOUT,
        )
        .await
        .map_err(Self::map_err)?;
        let message = match response {
            Some(answer) => format!("Operator responded: {answer}"),
            None => "No response within the timeout; proceed with your best judgment and note the open question in your report".to_string(),
        };
        Ok(CallToolResult::success(vec![Content::text(message)]))
    }
}

#[tool_handler]
impl ServerHandler for McpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "Terminal Coder control plane: report progress, completion, failure, and review verdicts for your assigned task".into(),
            ),
            ..Default::default()
        }
    }
}

pub async fn run_stdio_server(db: Database, bus: EventBus) -> anyhow::Result<()> {
    use tokio::io::{stdin, stdout};

    tracing::info!("starting MCP server via stdio");

    let service = McpServer::new(db, bus);
    let server = service.serve((stdin(), stdout())).await?;

    let quit_reason = server.waiting().await?;
    tracing::info!("MCP server stopped: {:?}", quit_reason);

    Ok(())
}
