//! Axum JSON API for cftrack.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use cftrack_analytics::{StudentAnalytics, DEFAULT_LEADERBOARD_SIZE};
use cftrack_core::{ContestRecord, NewStudent, ProblemRecord, Student, StudentUpdate};
use cftrack_sync::{ScheduleController, SchedulePreset, ScheduleStatus, SyncService};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;
use uuid::Uuid;

mod error;

pub use error::{ApiError, ErrorBody};

pub const CRATE_NAME: &str = "cftrack-web";

type ApiResult<T> = Result<T, ApiError>;

#[derive(Clone)]
pub struct AppState {
    pub sync: Arc<SyncService>,
    pub schedule: Arc<ScheduleController>,
    pub presets: Arc<Vec<SchedulePreset>>,
}

impl AppState {
    pub fn new(
        sync: Arc<SyncService>,
        schedule: Arc<ScheduleController>,
        presets: Vec<SchedulePreset>,
    ) -> Self {
        Self {
            sync,
            schedule,
            presets: Arc::new(presets),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/students", get(list_students).post(create_student))
        .route(
            "/api/students/{id}",
            get(get_student).put(update_student).delete(delete_student),
        )
        .route("/api/students/{id}/toggle-reminders", post(toggle_reminders))
        .route("/api/students/{id}/profile", get(student_profile))
        .route("/api/sync", post(sync_all))
        .route("/api/sync/{id}", post(sync_student))
        .route(
            "/api/schedule",
            get(get_schedule).put(update_schedule).delete(stop_schedule),
        )
        .route("/api/analytics/leaderboard", get(leaderboard))
        .route("/api/analytics/department-stats", get(department_stats))
        .route("/api/analytics/global-stats", get(global_stats))
        .route("/api/analytics/student/{id}", get(student_analytics))
        .route("/api/analytics/achievements/{id}", get(achievements))
        .with_state(state)
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn require_student(state: &AppState, id: Uuid) -> ApiResult<Student> {
    state
        .sync
        .store()
        .get_student(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("student {id} not found")))
}

async fn list_students(State(state): State<AppState>) -> ApiResult<Json<Vec<Student>>> {
    Ok(Json(state.sync.store().list_students().await?))
}

async fn create_student(
    State(state): State<AppState>,
    Json(draft): Json<NewStudent>,
) -> ApiResult<impl IntoResponse> {
    let student = state.sync.store().insert_student(draft).await?;
    info!(student_id = %student.id, handle = %student.handle, "student created");
    Ok((StatusCode::CREATED, Json(student)))
}

async fn get_student(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Student>> {
    Ok(Json(require_student(&state, id).await?))
}

async fn update_student(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(update): Json<StudentUpdate>,
) -> ApiResult<Json<Student>> {
    Ok(Json(state.sync.update_student(id, update).await?))
}

async fn delete_student(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<StatusCode> {
    if state.sync.delete_student(id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("student {id} not found")))
    }
}

async fn toggle_reminders(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Student>> {
    Ok(Json(state.sync.toggle_reminders(id).await?))
}

#[derive(Debug, Serialize)]
struct StudentProfile {
    student: Student,
    contests: Vec<ContestRecord>,
    problems: Vec<ProblemRecord>,
    analytics: StudentAnalytics,
}

async fn student_profile(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<StudentProfile>> {
    let student = require_student(&state, id).await?;
    let store = state.sync.store();
    let mut contests = store.list_contests(id).await?;
    // newest first for display
    contests.reverse();
    let mut problems = store.list_problems(id).await?;
    problems.reverse();
    let analytics = state.sync.get_student_analytics(id).await?;
    Ok(Json(StudentProfile {
        student,
        contests,
        problems,
        analytics,
    }))
}

async fn sync_all(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let report = state.sync.sync_all().await?;
    Ok(Json(report))
}

async fn sync_student(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Student>> {
    Ok(Json(state.sync.sync_one(id).await?))
}

#[derive(Debug, Serialize)]
struct ScheduleView {
    #[serde(flatten)]
    status: ScheduleStatus,
    presets: Vec<SchedulePreset>,
}

async fn get_schedule(State(state): State<AppState>) -> Json<ScheduleView> {
    Json(ScheduleView {
        status: state.schedule.status().await,
        presets: state.presets.as_ref().clone(),
    })
}

#[derive(Debug, Deserialize)]
struct ScheduleUpdate {
    expression: String,
}

async fn update_schedule(
    State(state): State<AppState>,
    Json(update): Json<ScheduleUpdate>,
) -> ApiResult<Json<ScheduleStatus>> {
    Ok(Json(state.schedule.reconfigure(&update.expression).await?))
}

async fn stop_schedule(State(state): State<AppState>) -> ApiResult<Json<ScheduleStatus>> {
    Ok(Json(state.schedule.stop().await?))
}

#[derive(Debug, Default, Deserialize)]
struct LeaderboardQuery {
    limit: Option<usize>,
}

async fn leaderboard(
    State(state): State<AppState>,
    Query(query): Query<LeaderboardQuery>,
) -> ApiResult<impl IntoResponse> {
    let limit = query.limit.unwrap_or(DEFAULT_LEADERBOARD_SIZE);
    Ok(Json(state.sync.get_leaderboard(limit).await?))
}

async fn department_stats(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.sync.get_department_stats().await?))
}

async fn global_stats(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.sync.get_global_stats().await?))
}

async fn student_analytics(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<StudentAnalytics>> {
    Ok(Json(state.sync.get_student_analytics(id).await?))
}

#[derive(Debug, Serialize)]
struct AchievementView {
    code: &'static str,
    label: &'static str,
    new: bool,
}

async fn achievements(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let report = state.sync.get_achievements(id).await?;
    let views = report
        .held
        .iter()
        .map(|a| AchievementView {
            code: a.code(),
            label: a.label(),
            new: report.newly_granted.contains(a),
        })
        .collect::<Vec<_>>();
    Ok(Json(serde_json::json!({
        "evaluated_at": Utc::now(),
        "achievements": views,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request};
    use cftrack_adapters::{FixtureJudgeClient, JudgeClient, UpstreamError};
    use cftrack_core::{Profile, RatingChange, Submission};
    use cftrack_storage::MemoryStore;
    use cftrack_sync::{builtin_presets, SyncSettings, TracingMailer};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::path::PathBuf;
    use tower::ServiceExt;

    fn fixtures_root() -> PathBuf {
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures/codeforces")
            .canonicalize()
            .unwrap()
    }

    struct BlockedJudge;

    #[async_trait]
    impl JudgeClient for BlockedJudge {
        async fn fetch_profile(&self, _handle: &str) -> Result<Profile, UpstreamError> {
            Err(UpstreamError::Blocked("http 403".into()))
        }

        async fn fetch_rating_history(&self, _handle: &str) -> Result<Vec<RatingChange>, UpstreamError> {
            Err(UpstreamError::Blocked("http 403".into()))
        }

        async fn fetch_submissions(
            &self,
            _handle: &str,
            _limit: usize,
        ) -> Result<Vec<Submission>, UpstreamError> {
            Err(UpstreamError::Blocked("http 403".into()))
        }
    }

    async fn state_with(judge: Arc<dyn JudgeClient>) -> AppState {
        let sync = Arc::new(SyncService::new(
            Arc::new(MemoryStore::new()),
            judge,
            Arc::new(TracingMailer),
            SyncSettings::default(),
        ));
        let schedule = Arc::new(ScheduleController::new(sync.clone()).await.unwrap());
        AppState::new(sync, schedule, builtin_presets())
    }

    async fn fixture_state() -> AppState {
        state_with(Arc::new(FixtureJudgeClient::new(fixtures_root()))).await
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn empty_request(method: &str, uri: &str) -> Request<Body> {
        Request::builder().method(method).uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_json(resp: axum::response::Response) -> Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn create(app: &Router, handle: &str) -> Value {
        let resp = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/students",
                serde_json::json!({
                    "name": "Ada Lovelace",
                    "email": format!("{handle}@example.com"),
                    "phone": format!("555-{handle}"),
                    "handle": handle,
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        body_json(resp).await
    }

    #[tokio::test]
    async fn create_rejects_missing_fields_and_duplicate_handles() {
        let app = app(fixture_state().await);
        create(&app, "ada_l").await;

        let dup = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/students",
                serde_json::json!({"name": "X", "email": "x@example.com", "phone": "1", "handle": "ADA_L"}),
            ))
            .await
            .unwrap();
        assert_eq!(dup.status(), StatusCode::CONFLICT);

        let invalid = app
            .oneshot(json_request(
                "POST",
                "/api/students",
                serde_json::json!({"name": "X", "email": "", "phone": "", "handle": "x"}),
            ))
            .await
            .unwrap();
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(invalid).await["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn sync_then_profile_and_analytics() {
        let app = app(fixture_state().await);
        let student = create(&app, "ada_l").await;
        let id = student["id"].as_str().unwrap().to_string();

        let synced = app
            .clone()
            .oneshot(empty_request("POST", &format!("/api/sync/{id}")))
            .await
            .unwrap();
        assert_eq!(synced.status(), StatusCode::OK);
        let synced = body_json(synced).await;
        assert_eq!(synced["current_rating"], 1480);
        assert_eq!(synced["max_rating"], 1512);

        let profile = app
            .clone()
            .oneshot(empty_request("GET", &format!("/api/students/{id}/profile")))
            .await
            .unwrap();
        assert_eq!(profile.status(), StatusCode::OK);
        let profile = body_json(profile).await;
        assert_eq!(profile["contests"].as_array().unwrap().len(), 3);
        assert_eq!(profile["analytics"]["history"].as_array().unwrap().len(), 3);

        let board = app
            .oneshot(empty_request("GET", "/api/analytics/leaderboard?limit=5"))
            .await
            .unwrap();
        let board = body_json(board).await;
        assert_eq!(board[0]["handle"], "ada_l");
        assert_eq!(board[0]["rank"], 1);
    }

    #[tokio::test]
    async fn blocked_sync_maps_to_service_unavailable() {
        let app = app(state_with(Arc::new(BlockedJudge)).await);
        let student = create(&app, "ada_l").await;
        let id = student["id"].as_str().unwrap().to_string();

        let resp = app
            .oneshot(empty_request("POST", &format!("/api/sync/{id}")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(resp).await["code"], "UPSTREAM_BLOCKED");
    }

    #[tokio::test]
    async fn unknown_student_is_not_found() {
        let app = app(fixture_state().await);
        let resp = app
            .clone()
            .oneshot(empty_request("POST", &format!("/api/sync/{}", Uuid::new_v4())))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = app
            .oneshot(empty_request("DELETE", &format!("/api/students/{}", Uuid::new_v4())))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn toggle_flips_reminder_flag() {
        let app = app(fixture_state().await);
        let student = create(&app, "ada_l").await;
        assert_eq!(student["email_reminders_enabled"], true);
        let id = student["id"].as_str().unwrap().to_string();

        let resp = app
            .oneshot(empty_request("POST", &format!("/api/students/{id}/toggle-reminders")))
            .await
            .unwrap();
        assert_eq!(body_json(resp).await["email_reminders_enabled"], false);
    }

    #[tokio::test]
    async fn schedule_update_validates_expression() {
        let app = app(fixture_state().await);

        let initial = body_json(
            app.clone()
                .oneshot(empty_request("GET", "/api/schedule"))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(initial["state"], "stopped");
        assert!(!initial["presets"].as_array().unwrap().is_empty());

        let bad = app
            .clone()
            .oneshot(json_request("PUT", "/api/schedule", serde_json::json!({"expression": "sometimes"})))
            .await
            .unwrap();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);

        let ok = app
            .clone()
            .oneshot(json_request("PUT", "/api/schedule", serde_json::json!({"expression": "0 */6 * * *"})))
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        let status = body_json(ok).await;
        assert_eq!(status["state"], "running");
        assert_eq!(status["expression"], "0 */6 * * *");

        let stopped = app
            .oneshot(empty_request("DELETE", "/api/schedule"))
            .await
            .unwrap();
        assert_eq!(stopped.status(), StatusCode::OK);
        let status = body_json(stopped).await;
        assert_eq!(status["state"], "stopped");
        assert_eq!(status["expression"], Value::Null);
    }

    #[tokio::test]
    async fn update_edits_fields_and_rejects_taken_handle() {
        let app = app(fixture_state().await);
        let ada = create(&app, "ada_l").await;
        create(&app, "bob").await;
        let id = ada["id"].as_str().unwrap().to_string();

        let dup = app
            .clone()
            .oneshot(json_request(
                "PUT",
                &format!("/api/students/{id}"),
                serde_json::json!({"handle": "Bob"}),
            ))
            .await
            .unwrap();
        assert_eq!(dup.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(dup).await["code"], "CONFLICT");

        let blank = app
            .clone()
            .oneshot(json_request(
                "PUT",
                &format!("/api/students/{id}"),
                serde_json::json!({"phone": ""}),
            ))
            .await
            .unwrap();
        assert_eq!(blank.status(), StatusCode::BAD_REQUEST);

        let ok = app
            .clone()
            .oneshot(json_request(
                "PUT",
                &format!("/api/students/{id}"),
                serde_json::json!({"department": "Mathematics", "year": 3}),
            ))
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        let body = body_json(ok).await;
        assert_eq!(body["department"], "Mathematics");
        assert_eq!(body["year"], 3);
        assert_eq!(body["handle"], "ada_l");

        let missing = app
            .oneshot(json_request(
                "PUT",
                &format!("/api/students/{}", Uuid::new_v4()),
                serde_json::json!({"year": 2}),
            ))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn achievements_endpoint_reports_held_codes() {
        let app = app(fixture_state().await);
        let student = create(&app, "ada_l").await;
        let id = student["id"].as_str().unwrap().to_string();
        app.clone()
            .oneshot(empty_request("POST", &format!("/api/sync/{id}")))
            .await
            .unwrap();

        let resp = app
            .oneshot(empty_request("GET", &format!("/api/analytics/achievements/{id}")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        let codes = body["achievements"]
            .as_array()
            .unwrap()
            .iter()
            .map(|a| a["code"].as_str().unwrap().to_string())
            .collect::<Vec<_>>();
        assert!(codes.contains(&"first_contest".to_string()));
        assert!(codes.contains(&"rating_1000".to_string()));
    }
}
