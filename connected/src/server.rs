use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use rocket::http::Status;
use rocket::request::{FromRequest, Outcome, Request};
use rocket::serde::json::Json;
use rocket::{get, post, routes, State};
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use tracing::error;

use common::Config;

use crate::brief::{self, BriefStats, Edition};
use crate::llm::Router;
use crate::pipeline::{self, PipelineStats};
use crate::storage::{self, SourceSeed};

/// Application state stored inside Rocket managed state.
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub config: Arc<Config>,
    pub router: Option<Arc<Router>>,
}

/// Request guard for the static admin credential: the X-Admin-Key header
/// must match the env var named in `admin.api_key_env`. An unconfigured
/// credential refuses all admin calls rather than letting them through.
pub struct AdminKey;

#[rocket::async_trait]
impl<'r> FromRequest<'r> for AdminKey {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let Some(state) = req.rocket().state::<AppState>() else {
            return Outcome::Error((Status::InternalServerError, ()));
        };
        let expected = state
            .config
            .admin
            .as_ref()
            .and_then(|a| a.api_key_env.as_deref())
            .and_then(|env| std::env::var(env).ok());
        let Some(expected) = expected else {
            error!("admin credential not configured; refusing admin request");
            return Outcome::Error((Status::InternalServerError, ()));
        };

        match req.headers().get_one("X-Admin-Key") {
            Some(provided) if provided == expected => Outcome::Success(AdminKey),
            _ => Outcome::Error((Status::Unauthorized, ())),
        }
    }
}

#[get("/health")]
async fn health() -> Json<Value> {
    Json(json!({"ok": true}))
}

/// Credential presence flags only; never the values.
#[get("/config")]
async fn config_flags(state: &State<AppState>) -> Json<Value> {
    let has_env = |name: Option<&str>| {
        name.map(|n| std::env::var(n).is_ok()).unwrap_or(false)
    };
    let llm = state.config.llm.as_ref();
    Json(json!({
        "has_openai_key": has_env(
            llm.and_then(|l| l.openai.as_ref()).and_then(|p| p.api_key_env.as_deref())
        ),
        "has_anthropic_key": has_env(
            llm.and_then(|l| l.anthropic.as_ref()).and_then(|p| p.api_key_env.as_deref())
        ),
        "has_admin_key": has_env(
            state.config.admin.as_ref().and_then(|a| a.api_key_env.as_deref())
        ),
    }))
}

#[post("/jobs/news/run")]
async fn run_news_job(
    _admin: AdminKey,
    state: &State<AppState>,
) -> Result<Json<PipelineStats>, Status> {
    let router = state.router.as_deref();
    pipeline::run_news_pipeline(&state.db, &state.config, router)
        .await
        .map(Json)
        .map_err(|e| {
            error!(error = %e, "news job failed");
            Status::InternalServerError
        })
}

#[post("/jobs/brief/run?<audience>&<edition>&<force>")]
async fn run_brief_job(
    _admin: AdminKey,
    state: &State<AppState>,
    audience: Option<String>,
    edition: Option<String>,
    force: Option<bool>,
) -> Result<Json<BriefStats>, Status> {
    let audience = audience.unwrap_or_else(|| "global".to_string());
    let edition: Edition = edition
        .as_deref()
        .unwrap_or("morning")
        .parse()
        .map_err(|_| Status::BadRequest)?;

    let router = state.router.as_deref();
    brief::run_daily_brief(
        &state.db,
        &state.config,
        router,
        &audience,
        edition,
        force.unwrap_or(false),
    )
    .await
    .map(Json)
    .map_err(|e| {
        error!(error = %e, "brief job failed");
        Status::InternalServerError
    })
}

#[derive(Debug, Deserialize)]
pub struct SeedSourcesRequest {
    pub sources: Vec<SourceSeed>,
}

#[post("/admin/news/sources/seed", data = "<payload>")]
async fn seed_news_sources(
    _admin: AdminKey,
    state: &State<AppState>,
    payload: Json<SeedSourcesRequest>,
) -> Result<Json<Value>, Status> {
    let written = storage::seed_sources(&state.db, &payload.sources)
        .await
        .map_err(|e| {
            error!(error = %e, "source seeding failed");
            Status::InternalServerError
        })?;
    Ok(Json(json!({"inserted": written})))
}

#[get("/news/feed?<limit>")]
async fn get_news_feed(state: &State<AppState>, limit: Option<i64>) -> Result<Json<Value>, Status> {
    let limit = limit.unwrap_or(50).clamp(1, 200);
    let rows = storage::latest_feed_cards(&state.db, limit)
        .await
        .map_err(|e| {
            error!(error = %e, "failed to read feed cards");
            Status::InternalServerError
        })?;

    let data: Vec<Value> = rows
        .iter()
        .map(|r| {
            json!({
                "cluster_id": r.cluster_id,
                "category": r.category,
                "card": r.card_value(),
                "updated_at": r.updated_at.to_rfc3339(),
            })
        })
        .collect();
    Ok(Json(json!({"data": data})))
}

#[get("/news/brief?<audience>&<brief_date>&<edition>")]
async fn get_news_brief(
    state: &State<AppState>,
    audience: Option<String>,
    brief_date: Option<String>,
    edition: Option<String>,
) -> Result<Json<Value>, Status> {
    let audience = audience.unwrap_or_else(|| "global".to_string());
    let brief_date = brief_date.unwrap_or_else(|| Utc::now().date_naive().to_string());

    let row = storage::get_brief_day(&state.db, &brief_date, &audience)
        .await
        .map_err(|e| {
            error!(error = %e, "failed to read daily brief");
            Status::InternalServerError
        })?;

    let (editions, latest_edition) = match row {
        Some(row) => (row.editions_value(), row.latest_edition),
        None => (json!({}), None),
    };

    let body = match edition {
        Some(name) => json!({
            "audience": audience,
            "brief_date": brief_date,
            "brief": editions.get(name.as_str()).cloned().unwrap_or(Value::Null),
            "edition": name,
        }),
        None => json!({
            "audience": audience,
            "brief_date": brief_date,
            "latest_edition": latest_edition,
            "editions": editions,
        }),
    };
    Ok(Json(body))
}

/// Launch the Rocket server with the shared pool, config and provider ladder.
pub async fn launch_rocket(
    db: SqlitePool,
    config: Arc<Config>,
    router: Option<Arc<Router>>,
) -> Result<()> {
    let state = AppState { db, config, router };
    rocket::build()
        .manage(state)
        .mount(
            "/",
            routes![
                health,
                config_flags,
                run_news_job,
                run_brief_job,
                seed_news_sources,
                get_news_feed,
                get_news_brief,
            ],
        )
        .launch()
        .await
        .context("rocket server failed")?;
    Ok(())
}
