use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid schedule expression {expression:?}: {reason}")]
    Validation { expression: String, reason: String },
    #[error("scheduler failure: {0}")]
    Scheduler(String),
}

/// Work bound to the active schedule.
#[async_trait]
pub trait ScheduledTask: Send + Sync {
    async fn run_scheduled(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleState {
    Stopped,
    Running,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleStatus {
    pub state: ScheduleState,
    pub expression: Option<String>,
}

#[derive(Debug, Default)]
struct ActiveSchedule {
    expression: Option<String>,
    job_id: Option<Uuid>,
}

/// Owns the single scheduled job. Every transition happens under one lock, so two
/// reconfigurations never leave two jobs registered.
pub struct ScheduleController {
    scheduler: JobScheduler,
    task: Arc<dyn ScheduledTask>,
    active: Mutex<ActiveSchedule>,
}

impl ScheduleController {
    pub async fn new(task: Arc<dyn ScheduledTask>) -> Result<Self, ScheduleError> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|err| ScheduleError::Scheduler(err.to_string()))?;
        scheduler
            .start()
            .await
            .map_err(|err| ScheduleError::Scheduler(err.to_string()))?;
        Ok(Self {
            scheduler,
            task,
            active: Mutex::new(ActiveSchedule::default()),
        })
    }

    fn build_job(&self, expression: &str) -> Result<Job, ScheduleError> {
        let cron = with_seconds_field(expression)?;
        let task = Arc::clone(&self.task);
        Job::new_async(cron.as_str(), move |_job_id, _scheduler| {
            let task = Arc::clone(&task);
            Box::pin(async move {
                task.run_scheduled().await;
            })
        })
        .map_err(|err| ScheduleError::Validation {
            expression: expression.to_string(),
            reason: err.to_string(),
        })
    }

    /// Validates `expression`, stops the running job if any and starts a new one.
    ///
    /// An invalid expression leaves the current schedule untouched. A batch already
    /// running under the old job is not interrupted.
    pub async fn reconfigure(&self, expression: &str) -> Result<ScheduleStatus, ScheduleError> {
        let job = self.build_job(expression)?;
        let mut active = self.active.lock().await;

        if let Some(old) = active.job_id.take() {
            self.scheduler
                .remove(&old)
                .await
                .map_err(|err| ScheduleError::Scheduler(err.to_string()))?;
            info!(job_id = %old, "stopped scheduled sync");
        }
        active.expression = None;

        let job_id = self
            .scheduler
            .add(job)
            .await
            .map_err(|err| ScheduleError::Scheduler(err.to_string()))?;
        active.job_id = Some(job_id);
        active.expression = Some(expression.trim().to_string());
        info!(%job_id, expression = expression.trim(), "started scheduled sync");

        Ok(status_of(&active))
    }

    pub async fn stop(&self) -> Result<ScheduleStatus, ScheduleError> {
        let mut active = self.active.lock().await;
        if let Some(old) = active.job_id.take() {
            self.scheduler
                .remove(&old)
                .await
                .map_err(|err| ScheduleError::Scheduler(err.to_string()))?;
            info!(job_id = %old, "stopped scheduled sync");
        }
        active.expression = None;
        Ok(status_of(&active))
    }

    pub async fn status(&self) -> ScheduleStatus {
        status_of(&*self.active.lock().await)
    }

    pub async fn shutdown(mut self) {
        if let Err(err) = self.scheduler.shutdown().await {
            warn!(error = %err, "scheduler shutdown failed");
        }
    }
}

/// The scheduler parses six-field cron (leading seconds). Five-field expressions
/// fire at second zero; six- and seven-field ones pass through unchanged.
fn with_seconds_field(expression: &str) -> Result<String, ScheduleError> {
    let fields = expression.split_whitespace().collect::<Vec<_>>();
    match fields.len() {
        0 => Err(ScheduleError::Validation {
            expression: expression.to_string(),
            reason: "expression is empty".to_string(),
        }),
        5 => Ok(format!("0 {}", fields.join(" "))),
        6 | 7 => Ok(fields.join(" ")),
        n => Err(ScheduleError::Validation {
            expression: expression.to_string(),
            reason: format!("expected 5 to 7 fields, got {n}"),
        }),
    }
}

fn status_of(active: &ActiveSchedule) -> ScheduleStatus {
    ScheduleStatus {
        state: if active.job_id.is_some() {
            ScheduleState::Running
        } else {
            ScheduleState::Stopped
        },
        expression: active.expression.clone(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulePreset {
    pub label: String,
    pub expression: String,
}

#[derive(Debug, Deserialize)]
struct PresetFile {
    presets: Vec<SchedulePreset>,
}

pub fn builtin_presets() -> Vec<SchedulePreset> {
    [
        ("Daily at 2 AM", "0 2 * * *"),
        ("Every 6 hours", "0 */6 * * *"),
        ("Every 12 hours", "0 */12 * * *"),
        ("Weekly on Sunday at 2 AM", "0 2 * * 0"),
    ]
    .into_iter()
    .map(|(label, expression)| SchedulePreset {
        label: label.to_string(),
        expression: expression.to_string(),
    })
    .collect()
}

/// Reads `schedules.yaml` under `workspace_root`, falling back to the built-in list
/// when the file does not exist.
pub async fn load_schedule_presets(workspace_root: &Path) -> anyhow::Result<Vec<SchedulePreset>> {
    let path = workspace_root.join("schedules.yaml");
    let text = match tokio::fs::read_to_string(&path).await {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(builtin_presets()),
        Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
    };
    let file: PresetFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(file.presets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingTask {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl ScheduledTask for CountingTask {
        async fn run_scheduled(&self) {
            self.runs.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn controller() -> ScheduleController {
        ScheduleController::new(Arc::new(CountingTask::default()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn starts_stopped_and_runs_after_reconfigure() {
        let controller = controller().await;
        assert_eq!(controller.status().await.state, ScheduleState::Stopped);

        let status = controller.reconfigure("0 2 * * *").await.unwrap();
        assert_eq!(status.state, ScheduleState::Running);
        assert_eq!(status.expression.as_deref(), Some("0 2 * * *"));

        let status = controller.stop().await.unwrap();
        assert_eq!(status.state, ScheduleState::Stopped);
        assert_eq!(status.expression, None);
    }

    #[tokio::test]
    async fn invalid_expression_keeps_current_schedule() {
        let controller = controller().await;
        controller.reconfigure("0 2 * * *").await.unwrap();

        let err = controller.reconfigure("every tuesday-ish").await.unwrap_err();
        assert!(matches!(err, ScheduleError::Validation { .. }));
        assert!(matches!(
            controller.reconfigure("   ").await.unwrap_err(),
            ScheduleError::Validation { .. }
        ));

        let status = controller.status().await;
        assert_eq!(status.state, ScheduleState::Running);
        assert_eq!(status.expression.as_deref(), Some("0 2 * * *"));
    }

    #[tokio::test]
    async fn concurrent_reconfigurations_leave_one_schedule() {
        let controller = Arc::new(controller().await);
        let expressions = ["0 1 * * *", "0 */6 * * *", "0 3 * * *", "30 4 * * 0"];
        let handles = expressions
            .iter()
            .map(|expr| {
                let controller = Arc::clone(&controller);
                let expr = expr.to_string();
                tokio::spawn(async move { controller.reconfigure(&expr).await })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let status = controller.status().await;
        assert_eq!(status.state, ScheduleState::Running);
        let active = status.expression.unwrap();
        assert!(expressions.contains(&active.as_str()));
    }

    #[test]
    fn five_field_expressions_gain_a_seconds_field() {
        assert_eq!(with_seconds_field(" 0 2 * * * ").unwrap(), "0 0 2 * * *");
        assert_eq!(with_seconds_field("15 0 2 * * *").unwrap(), "15 0 2 * * *");
        assert!(matches!(
            with_seconds_field("sometimes"),
            Err(ScheduleError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn every_shipped_expression_can_be_scheduled() {
        let controller = controller().await;
        let shipped = load_schedule_presets(Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/../..")))
            .await
            .unwrap();
        let mut expressions = builtin_presets()
            .into_iter()
            .chain(shipped)
            .map(|preset| preset.expression)
            .collect::<Vec<_>>();
        expressions.push(crate::SyncConfig::DEFAULT_SYNC_CRON.to_string());

        for expression in expressions {
            let status = controller
                .reconfigure(&expression)
                .await
                .unwrap_or_else(|err| panic!("{expression}: {err}"));
            assert_eq!(status.state, ScheduleState::Running);
            assert_eq!(status.expression.as_deref(), Some(expression.as_str()));
        }
    }

    #[tokio::test]
    async fn presets_fall_back_to_builtin_list() {
        let dir = tempfile::tempdir().unwrap();
        let presets = load_schedule_presets(dir.path()).await.unwrap();
        assert_eq!(presets, builtin_presets());

        std::fs::write(
            dir.path().join("schedules.yaml"),
            "presets:\n  - label: Hourly\n    expression: \"0 * * * *\"\n",
        )
        .unwrap();
        let presets = load_schedule_presets(dir.path()).await.unwrap();
        assert_eq!(presets.len(), 1);
        assert_eq!(presets[0].expression, "0 * * * *");
    }
}
