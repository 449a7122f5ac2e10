use async_graphql::*;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, QueryOrder, QuerySelect};

use crate::jobs::{self, JobContext};
use crate::storage;

fn job_context<'a>(ctx: &'a Context<'_>) -> Result<&'a JobContext> {
    ctx.data::<JobContext>()
        .map_err(|_| Error::new("Job context not available"))
}

/// Custom mutations for admin operations
#[derive(Default)]
pub struct AdminMutation;

#[Object]
impl AdminMutation {
    /// Manually trigger a background job by name
    async fn trigger_job(&self, ctx: &Context<'_>, job_name: String) -> Result<JobTriggerResult> {
        let jobs_ctx = job_context(ctx)?;

        match jobs::trigger_job_manually(jobs_ctx, &job_name).await {
            Ok(records) => Ok(JobTriggerResult {
                success: true,
                message: format!("Job '{}' completed: {} records", job_name, records),
                records_processed: Some(records),
                job_name,
            }),
            Err(e) => Ok(JobTriggerResult {
                success: false,
                message: format!("Failed to trigger job '{}': {}", job_name, e),
                records_processed: None,
                job_name,
            }),
        }
    }
}

/// Result of triggering a job
#[derive(SimpleObject)]
pub struct JobTriggerResult {
    pub success: bool,
    pub message: String,
    pub job_name: String,
    pub records_processed: Option<i64>,
}

/// Custom queries for admin operations
#[derive(Default)]
pub struct AdminQuery;

#[Object]
impl AdminQuery {
    /// Get recent job executions with optional filtering
    async fn job_logs(
        &self,
        ctx: &Context<'_>,
        #[graphql(desc = "Filter by job name")] job_name: Option<String>,
        #[graphql(desc = "Limit number of results", default = 100)] limit: i64,
        #[graphql(desc = "Only show failed jobs")] only_failures: Option<bool>,
    ) -> Result<Vec<JobLog>> {
        let jobs_ctx = job_context(ctx)?;

        use crate::entities::job_execution::{Column, Entity};

        let mut query = Entity::find();

        if let Some(name) = job_name {
            query = query.filter(Column::JobName.eq(name));
        }

        if let Some(true) = only_failures {
            query = query.filter(Column::Success.eq(0));
        }

        let results = query
            .order_by_desc(Column::StartedAt)
            .limit(limit.clamp(1, 1000) as u64)
            .all(&jobs_ctx.db)
            .await
            .map_err(|e| Error::new(format!("Database error: {}", e)))?;

        Ok(results
            .into_iter()
            .map(|model| JobLog {
                id: model.id,
                job_name: model.job_name,
                started_at: model.started_at,
                completed_at: model.completed_at,
                success: model.success,
                error_message: model.error_message,
                records_processed: model.records_processed,
            })
            .collect())
    }

    /// Get list of available jobs that can be triggered
    async fn available_jobs(&self) -> Result<Vec<JobInfo>> {
        Ok(jobs::JOBS
            .iter()
            .map(|spec| JobInfo {
                name: spec.name.to_string(),
                description: spec.description.to_string(),
                schedule: spec.schedule.to_string(),
            })
            .collect())
    }

    /// Row counts plus live real-time connections
    async fn stats(&self, ctx: &Context<'_>) -> Result<AdminStats> {
        let jobs_ctx = job_context(ctx)?;
        let stats = storage::system_stats(&jobs_ctx.db)
            .await
            .map_err(|e| Error::new(format!("Database error: {}", e)))?;
        Ok(AdminStats {
            users: stats.users,
            farmers: stats.farmers,
            activities: stats.activities,
            advisories: stats.advisories,
            pending_notifications: stats.pending_notifications,
            kb_documents: stats.kb_documents,
            live_connections: jobs_ctx.hub.connection_count() as u64,
            connected_farmers: jobs_ctx.hub.connected_farmers() as u64,
        })
    }
}

/// Job log entry
#[derive(SimpleObject)]
pub struct JobLog {
    pub id: i64,
    pub job_name: String,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub success: Option<i64>,
    pub error_message: Option<String>,
    pub records_processed: Option<i64>,
}

/// Information about an available job
#[derive(SimpleObject)]
pub struct JobInfo {
    pub name: String,
    pub description: String,
    pub schedule: String,
}

#[derive(SimpleObject)]
pub struct AdminStats {
    pub users: u64,
    pub farmers: u64,
    pub activities: u64,
    pub advisories: u64,
    pub pending_notifications: u64,
    pub kb_documents: u64,
    pub live_connections: u64,
    pub connected_farmers: u64,
}

#[cfg(test)]
mod tests {
    use crate::admin_graphql::build_jobs_schema;
    use crate::jobs::tests::test_context;

    #[tokio::test]
    async fn test_available_jobs_and_trigger() {
        let t = test_context().await;
        let schema = build_jobs_schema(t.ctx.clone());

        let resp = schema.execute("{ availableJobs { name schedule } }").await;
        assert!(resp.errors.is_empty(), "{:?}", resp.errors);
        let data = resp.data.into_json().unwrap();
        assert_eq!(data["availableJobs"].as_array().unwrap().len(), 7);

        let resp = schema
            .execute(r#"mutation { triggerJob(jobName: "purge_media_tmp") { success recordsProcessed } }"#)
            .await;
        assert!(resp.errors.is_empty(), "{:?}", resp.errors);
        let data = resp.data.into_json().unwrap();
        assert_eq!(data["triggerJob"]["success"], true);
        assert_eq!(data["triggerJob"]["recordsProcessed"], 0);

        let resp = schema
            .execute(r#"{ jobLogs(jobName: "purge_media_tmp") { jobName success } stats { users liveConnections } }"#)
            .await;
        assert!(resp.errors.is_empty(), "{:?}", resp.errors);
        let data = resp.data.into_json().unwrap();
        assert_eq!(data["jobLogs"][0]["success"], 1);
        assert_eq!(data["stats"]["liveConnections"], 0);
    }

    #[tokio::test]
    async fn test_trigger_unknown_job_reports_failure() {
        let t = test_context().await;
        let schema = build_jobs_schema(t.ctx.clone());
        let resp = schema
            .execute(r#"mutation { triggerJob(jobName: "nope") { success message } }"#)
            .await;
        let data = resp.data.into_json().unwrap();
        assert_eq!(data["triggerJob"]["success"], false);
    }
}
