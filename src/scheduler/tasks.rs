use std::sync::Arc;

use tracing::info;

use super::Scheduler;
use crate::pipeline::Pipeline;

const HEARTBEAT_CRON: &str = "0 0 * * * *";

/// Register the cache sweep and the hourly heartbeat.
pub async fn register_maintenance_tasks(
    scheduler: &mut Scheduler,
    pipeline: Arc<Pipeline>,
    cleanup_cron: &str,
) -> anyhow::Result<()> {
    scheduler
        .add_cron_job(cleanup_cron, "cache-cleanup", move || {
            let pipeline = pipeline.clone();
            Box::pin(async move {
                pipeline.sweep_caches().await;
            })
        })
        .await?;

    scheduler
        .add_cron_job(HEARTBEAT_CRON, "heartbeat", || {
            Box::pin(async {
                info!("Heartbeat: bot is alive");
            })
        })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::CommandRegistry;
    use crate::config::Config;
    use crate::responder::CannedReply;
    use crate::testing::context_with;

    fn pipeline() -> Arc<Pipeline> {
        let (ctx, _) = context_with(Config::default());
        Arc::new(Pipeline::new(
            ctx,
            Arc::new(CommandRegistry::new()),
            Arc::new(CannedReply::new("Away")),
        ))
    }

    #[tokio::test]
    async fn test_registers_cleanup_and_heartbeat() {
        let mut scheduler = Scheduler::new().await.unwrap();
        register_maintenance_tasks(&mut scheduler, pipeline(), "0 */10 * * * *")
            .await
            .unwrap();
        assert_eq!(scheduler.job_names(), vec!["cache-cleanup", "heartbeat"]);
    }

    #[tokio::test]
    async fn test_invalid_cron_is_an_error() {
        let mut scheduler = Scheduler::new().await.unwrap();
        let result = register_maintenance_tasks(&mut scheduler, pipeline(), "every ten minutes").await;
        assert!(result.is_err());
        assert!(scheduler.job_names().is_empty());
    }
}
