//! Reminder tool: parses the time phrase and returns the side effect.
//! Scheduling is the orchestrator's job, never this tool's.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

use murmur_schema::{ReminderDetails, ToolErrorKind, ToolExecutionResult};

use crate::tool::{ToolContext, ToolDecl, ToolExecutor};

pub struct ReminderTool {
    enabled: bool,
    priority: i32,
}

impl ReminderTool {
    pub fn new(enabled: bool, priority: i32) -> Self {
        Self { enabled, priority }
    }
}

/// Accepts RFC 3339 or a naive `YYYY-MM-DDTHH:MM:SS` interpreted in the
/// configured timezone.
fn parse_target_time(raw: &str, tz: Tz) -> Result<DateTime<Utc>, String> {
    if let Ok(absolute) = DateTime::parse_from_rfc3339(raw) {
        return Ok(absolute.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S"))
        .map_err(|e| format!("無法解析時間格式: {e}"))?;
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| "該時間在此時區不存在".to_string())
}

#[async_trait]
impl ToolExecutor for ReminderTool {
    fn decl(&self) -> ToolDecl {
        ToolDecl {
            name: "set_reminder".into(),
            description: "根據使用者提供的訊息和時間設定提醒。時間使用 ISO 8601 格式（例如 2024-07-26T10:00:00）。".into(),
            schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "message": {
                        "type": "string",
                        "description": "提醒的內容"
                    },
                    "target_time": {
                        "type": "string",
                        "description": "提醒時間，ISO 8601 格式"
                    }
                },
                "required": ["message", "target_time"]
            }),
            enabled: self.enabled,
            priority: self.priority,
        }
    }

    async fn execute(
        &self,
        task_id: &str,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> anyhow::Result<ToolExecutionResult> {
        let message = args["message"].as_str().unwrap_or_default().trim().to_string();
        let raw_time = args["target_time"].as_str().unwrap_or_default();
        if message.is_empty() || raw_time.is_empty() {
            return Ok(ToolExecutionResult::failed(
                task_id,
                "set_reminder",
                ToolErrorKind::InvalidArguments,
                "需要提供 message 和 target_time 兩個參數",
            ));
        }

        let fire_at = match parse_target_time(raw_time, ctx.timezone) {
            Ok(fire_at) => fire_at,
            Err(reason) => {
                return Ok(ToolExecutionResult::failed(
                    task_id,
                    "set_reminder",
                    ToolErrorKind::InvalidArguments,
                    format!("無效的時間格式，請使用 ISO 8601 (YYYY-MM-DDTHH:MM:SS)。{reason}"),
                ));
            }
        };

        let now = Utc::now();
        if fire_at <= now {
            return Ok(ToolExecutionResult::failed(
                task_id,
                "set_reminder",
                ToolErrorKind::InvalidArguments,
                "提醒時間必須為未來時間，請提供一個晚於現在的時間。",
            ));
        }

        let local = fire_at.with_timezone(&ctx.timezone);
        let mut result = ToolExecutionResult::ok(
            task_id,
            "set_reminder",
            format!(
                "提醒已成功設定：{message}，時間：{}。跟使用者講你設定好了!",
                local.format("%Y年%m月%d日 %H:%M:%S")
            ),
        );
        result.side_effect = Some(ReminderDetails {
            content: message,
            fire_at,
            channel_ref: ctx.channel_ref.clone(),
            user_ref: ctx.user_ref.clone(),
            created_at: now,
        });
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ToolContext {
        ToolContext::new("chan-9", "user-7", "Asia/Taipei".parse::<Tz>().unwrap())
    }

    fn tool() -> ReminderTool {
        ReminderTool::new(true, 3)
    }

    #[tokio::test]
    async fn future_time_produces_side_effect() {
        let fire_at = Utc::now() + chrono::Duration::minutes(5);
        let result = tool()
            .execute(
                "t1",
                serde_json::json!({
                    "message": "stretch",
                    "target_time": fire_at.to_rfc3339(),
                }),
                &ctx(),
            )
            .await
            .unwrap();
        assert!(result.success);
        let effect = result.side_effect.unwrap();
        assert_eq!(effect.content, "stretch");
        assert_eq!(effect.channel_ref, "chan-9");
        assert_eq!(effect.user_ref, "user-7");
        assert!((effect.fire_at - fire_at).num_seconds().abs() <= 1);
    }

    #[tokio::test]
    async fn naive_time_is_interpreted_in_configured_timezone() {
        let tz: Tz = "Asia/Taipei".parse().unwrap();
        let local_future = (Utc::now() + chrono::Duration::hours(2)).with_timezone(&tz);
        let naive = local_future.format("%Y-%m-%dT%H:%M:%S").to_string();

        let result = tool()
            .execute(
                "t1",
                serde_json::json!({"message": "m", "target_time": naive}),
                &ctx(),
            )
            .await
            .unwrap();
        assert!(result.success);
        let effect = result.side_effect.unwrap();
        // Round-trips through UTC to within a second.
        assert!((effect.fire_at - local_future.with_timezone(&Utc)).num_seconds().abs() <= 1);
    }

    #[tokio::test]
    async fn past_time_is_rejected_without_side_effect() {
        let result = tool()
            .execute(
                "t1",
                serde_json::json!({
                    "message": "too late",
                    "target_time": "2020-01-01T00:00:00",
                }),
                &ctx(),
            )
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.side_effect.is_none());
        assert_eq!(result.error_kind, Some(ToolErrorKind::InvalidArguments));
    }

    #[tokio::test]
    async fn garbage_time_is_invalid_arguments() {
        let result = tool()
            .execute(
                "t1",
                serde_json::json!({"message": "m", "target_time": "next tuesday-ish"}),
                &ctx(),
            )
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ToolErrorKind::InvalidArguments));
    }

    #[tokio::test]
    async fn missing_fields_are_invalid_arguments() {
        let result = tool()
            .execute("t1", serde_json::json!({"message": "m"}), &ctx())
            .await
            .unwrap();
        assert_eq!(result.error_kind, Some(ToolErrorKind::InvalidArguments));
    }
}
