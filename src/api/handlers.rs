use std::net::IpAddr;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use uuid::Uuid;

use super::routes::AppState;
use super::types::{
    AnalyticsListResponse, HealthResponse, IpEntryRequest, IpListsResponse, IpStatusResponse,
    ProtectionRulesRequest, RegisterWebsiteRequest, TrackClickResponse,
};
use crate::core::website::UrlRepair;
use crate::core::{
    AnalyticsView, BlocklistEntry, DiagnosticsReport, IpListEntry, Overview, TenantRules, Website,
};
use crate::error::{ApiError, ApiResult};
use crate::service::{ClickFraudService, ClickSubmission};
use crate::utils::{EngineError, ValidationError};

pub async fn track_click(
    State(state): State<AppState>,
    Json(submission): Json<ClickSubmission>,
) -> ApiResult<Json<TrackClickResponse>> {
    let outcome = state.service.track_click(submission).await?;
    Ok(Json(outcome.into()))
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    match state.service.store().ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok",
                store: "up",
            }),
        ),
        Err(err) => {
            tracing::warn!(error = %err, "health check could not reach store");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "degraded",
                    store: "down",
                }),
            )
        }
    }
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed".to_string()),
    }
}

pub async fn register_website(
    State(state): State<AppState>,
    Json(request): Json<RegisterWebsiteRequest>,
) -> ApiResult<(StatusCode, Json<Website>)> {
    if request.name.trim().is_empty() {
        return Err(ApiError::BadRequest("website name is empty".to_string()));
    }
    let website = state
        .service
        .websites()
        .register(&request.name, &request.url)
        .await?;
    Ok((StatusCode::CREATED, Json(website)))
}

pub async fn list_websites(State(state): State<AppState>) -> ApiResult<Json<Vec<Website>>> {
    Ok(Json(state.service.websites().list().await?))
}

pub async fn get_website(
    State(state): State<AppState>,
    Path(website_id): Path<String>,
) -> ApiResult<Json<Website>> {
    Ok(Json(state.service.websites().get(&website_id).await?))
}

pub async fn get_protection_rules(
    State(state): State<AppState>,
    Path(website_id): Path<String>,
) -> ApiResult<Json<TenantRules>> {
    Ok(Json(state.service.rules().get(&website_id).await?))
}

pub async fn replace_protection_rules(
    State(state): State<AppState>,
    Path(website_id): Path<String>,
    Json(request): Json<ProtectionRulesRequest>,
) -> ApiResult<Json<TenantRules>> {
    let current = existing_rules(&state.service, &website_id).await?;
    let rules = request.into_rules(Some(&current))?;
    Ok(Json(state.service.rules().replace(&website_id, rules).await?))
}

pub async fn list_ip_entries(
    State(state): State<AppState>,
    Path(website_id): Path<String>,
) -> ApiResult<Json<IpListsResponse>> {
    let rules = state.service.rules().get(&website_id).await?;
    Ok(Json(rules.into()))
}

pub async fn add_ip_entry(
    State(state): State<AppState>,
    Path(website_id): Path<String>,
    Json(request): Json<IpEntryRequest>,
) -> ApiResult<(StatusCode, Json<IpListEntry>)> {
    let entry = request.into_entry()?;
    let entry = state.service.rules().add_ip_entry(&website_id, entry).await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

pub async fn remove_ip_entry(
    State(state): State<AppState>,
    Path((website_id, entry_id)): Path<(String, Uuid)>,
) -> ApiResult<Json<IpListEntry>> {
    Ok(Json(
        state
            .service
            .rules()
            .remove_ip_entry(&website_id, entry_id)
            .await?,
    ))
}

pub async fn list_blocklist(
    State(state): State<AppState>,
    Path(website_id): Path<String>,
) -> ApiResult<Json<Vec<BlocklistEntry>>> {
    state.service.websites().get(&website_id).await?;
    Ok(Json(state.service.blocklist().list(&website_id, Utc::now()).await?))
}

pub async fn ip_status(
    State(state): State<AppState>,
    Path((website_id, ip)): Path<(String, String)>,
) -> ApiResult<Json<IpStatusResponse>> {
    let ip: IpAddr = ip
        .parse()
        .map_err(|_| ValidationError::InvalidPattern(ip.clone()))?;
    let rules = state.service.rules().get(&website_id).await?;
    let status = state
        .service
        .blocklist()
        .status(&website_id, &ip, &rules, Utc::now())
        .await?;
    Ok(Json(IpStatusResponse::new(&ip, status)))
}

pub async fn unblock_ip(
    State(state): State<AppState>,
    Path((website_id, ip)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let ip: IpAddr = ip
        .parse()
        .map_err(|_| ValidationError::InvalidPattern(ip.clone()))?;
    state.service.blocklist().unblock(&website_id, &ip).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_analytics(State(state): State<AppState>) -> Json<AnalyticsListResponse> {
    match state.service.websites().ids().await {
        Ok(ids) => Json(AnalyticsListResponse {
            websites: state.service.analytics().views(&ids).await,
            warning: None,
        }),
        Err(err) => {
            tracing::warn!(error = %err, "cannot list websites for analytics");
            Json(AnalyticsListResponse {
                websites: Vec::new(),
                warning: Some(format!("analytics unavailable: {}", err)),
            })
        }
    }
}

pub async fn get_analytics(
    State(state): State<AppState>,
    Path(website_id): Path<String>,
) -> Json<AnalyticsView> {
    Json(state.service.analytics().view(&website_id).await)
}

pub async fn overview(State(state): State<AppState>) -> Json<Overview> {
    match state.service.websites().ids().await {
        Ok(ids) => Json(state.service.analytics().overview(&ids).await),
        Err(err) => {
            tracing::warn!(error = %err, "cannot list websites for overview");
            let mut empty = state.service.analytics().overview(&[]).await;
            empty.warning = Some(format!("analytics unavailable: {}", err));
            Json(empty)
        }
    }
}

pub async fn diagnostics(State(state): State<AppState>) -> Json<DiagnosticsReport> {
    Json(state.service.diagnostics().run().await)
}

pub async fn repair_urls(State(state): State<AppState>) -> ApiResult<Json<Vec<UrlRepair>>> {
    Ok(Json(state.service.websites().repair_urls().await?))
}

/// Current rules of a tenant; unknown tenants are rejected before any write
async fn existing_rules(service: &ClickFraudService, website_id: &str) -> Result<TenantRules, ApiError> {
    match service.rules().get(website_id).await {
        Ok(rules) => Ok(rules),
        Err(EngineError::NotFound { .. }) => {
            service.websites().get(website_id).await?;
            Ok(TenantRules::new(service.rules().defaults()))
        }
        Err(err) => Err(err.into()),
    }
}
