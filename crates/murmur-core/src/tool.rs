//! Tool declarations, dispatch, and planner binding.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono_tz::Tz;
use murmur_provider::{LlmMessage, RoleGateway, ToolDef};
use murmur_schema::{AgentPlan, CancelToken, LlmError, ToolCall, ToolErrorKind, ToolExecutionResult};

/// Smallest slice of the round budget a single call may get.
pub const MIN_CALL_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ToolDecl {
    pub name: String,
    pub description: String,
    pub schema: serde_json::Value,
    pub enabled: bool,
    pub priority: i32,
}

/// Per-invocation context handed to every tool.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub channel_ref: String,
    pub user_ref: String,
    pub guild_ref: Option<String>,
    pub timezone: Tz,
}

impl ToolContext {
    pub fn new(channel_ref: impl Into<String>, user_ref: impl Into<String>, timezone: Tz) -> Self {
        Self {
            channel_ref: channel_ref.into(),
            user_ref: user_ref.into(),
            guild_ref: None,
            timezone,
        }
    }

    pub fn with_guild(mut self, guild_ref: Option<String>) -> Self {
        self.guild_ref = guild_ref;
        self
    }
}

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    fn decl(&self) -> ToolDecl;

    async fn execute(
        &self,
        task_id: &str,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> anyhow::Result<ToolExecutionResult>;
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn ToolExecutor>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn ToolExecutor>) {
        self.tools.push(tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn ToolExecutor>> {
        self.tools.iter().find(|t| t.decl().name == name)
    }

    pub fn list(&self, enabled_only: bool) -> Vec<ToolDecl> {
        let mut decls: Vec<ToolDecl> = self
            .tools
            .iter()
            .map(|t| t.decl())
            .filter(|d| !enabled_only || d.enabled)
            .collect();
        decls.sort_by_key(|d| d.priority);
        decls
    }

    pub fn priority_of(&self, name: &str) -> i32 {
        self.get(name).map(|t| t.decl().priority).unwrap_or(i32::MAX)
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.get(name).map(|t| t.decl().enabled).unwrap_or(false)
    }

    /// Declarations advertised to the planner model.
    pub fn tool_defs(&self) -> Vec<ToolDef> {
        self.list(true)
            .into_iter()
            .map(|d| ToolDef {
                name: d.name,
                description: d.description,
                input_schema: d.schema,
            })
            .collect()
    }

    /// Execute one call under its slice of the round budget. Failures of any
    /// kind come back as a `success=false` envelope, never as `Err`.
    pub async fn dispatch(
        &self,
        call: &ToolCall,
        ctx: &ToolContext,
        timeout: Duration,
    ) -> ToolExecutionResult {
        let Some(tool) = self.get(&call.name) else {
            return ToolExecutionResult::failed(
                &call.task_id,
                &call.name,
                ToolErrorKind::NotFound,
                format!("未知的工具: {}", call.name),
            );
        };
        if !tool.decl().enabled {
            return ToolExecutionResult::failed(
                &call.task_id,
                &call.name,
                ToolErrorKind::Disabled,
                format!("工具 {} 未啟用", call.name),
            );
        }

        let timeout = timeout.max(MIN_CALL_TIMEOUT);
        match tokio::time::timeout(
            timeout,
            tool.execute(&call.task_id, call.arguments.clone(), ctx),
        )
        .await
        {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                tracing::warn!(tool = %call.name, "tool execution failed: {e:#}");
                ToolExecutionResult::failed(
                    &call.task_id,
                    &call.name,
                    ToolErrorKind::Internal,
                    format!("工具執行失敗: {e}"),
                )
            }
            Err(_) => {
                tracing::warn!(tool = %call.name, timeout_ms = timeout.as_millis() as u64, "tool timed out");
                ToolExecutionResult::failed(
                    &call.task_id,
                    &call.name,
                    ToolErrorKind::Timeout,
                    format!("工具 {} 執行逾時", call.name),
                )
            }
        }
    }

    /// Split the round budget evenly across `calls`, floored at the minimum.
    pub fn per_call_timeout(round_budget: Duration, calls: usize) -> Duration {
        if calls == 0 {
            return round_budget;
        }
        (round_budget / calls as u32).max(MIN_CALL_TIMEOUT)
    }
}

/// A gateway with this registry's tools advertised to the planner, parsing
/// structured calls back into prioritized `ToolCall` records.
pub struct BoundPlanner {
    registry: Arc<ToolRegistry>,
    gateway: Arc<RoleGateway>,
}

impl BoundPlanner {
    pub fn new(registry: Arc<ToolRegistry>, gateway: Arc<RoleGateway>) -> Self {
        Self { registry, gateway }
    }

    pub async fn plan(
        &self,
        system: Option<String>,
        messages: Vec<LlmMessage>,
        cancel: &CancelToken,
    ) -> Result<AgentPlan, LlmError> {
        let defs = self.registry.tool_defs();
        let response = self.gateway.plan(system, messages, defs, cancel).await?;

        let mut calls = Vec::new();
        for (id, name, input) in response.tool_uses() {
            if !self.registry.is_enabled(&name) {
                tracing::warn!(tool = %name, "planner requested unknown or disabled tool, dropping");
                continue;
            }
            calls.push(ToolCall {
                priority: self.registry.priority_of(&name),
                name,
                arguments: input,
                task_id: if id.is_empty() {
                    uuid::Uuid::new_v4().to_string()
                } else {
                    id
                },
            });
        }

        Ok(AgentPlan {
            needs_tools: !calls.is_empty(),
            tool_calls: calls,
            reasoning: response.text,
        })
    }
}
