//! Endpoint handlers.

use super::error::ApiError;
use super::extract::{Caller, ClientIp, FormFields};
use super::{AppState, KindState};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use selfserve_db::AccountDb;
use selfserve_engine::queue::is_valid_job_id;
use selfserve_engine::{Reply, ReviewAction};
use serde_json::json;

type ApiResult = Result<Response, ApiError>;

fn reply(reply: Reply) -> Response {
    Json(reply).into_response()
}

// ============================================================================
// Account requests
// ============================================================================

/// POST `/api/<kind>-account`
pub async fn submit(
    State(state): State<KindState>,
    ClientIp(ip): ClientIp,
    form: FormFields,
) -> ApiResult {
    let submitted = state.engine.submit(&form.fields, &ip).await?;
    Ok(reply(submitted.reply))
}

/// GET `/api/<kind>-account?<token>`
pub async fn verify(State(state): State<KindState>, form: FormFields) -> ApiResult {
    let token = form
        .token()
        .ok_or_else(|| ApiError::bad_request("No verification token provided"))?;
    Ok(reply(state.engine.verify(&token).await?))
}

/// `/api/<kind>-exists`
pub async fn exists(
    State(state): State<KindState>,
    ClientIp(ip): ClientIp,
    form: FormFields,
) -> ApiResult {
    let userid = form.get_str("userid").unwrap_or_default();
    let found = state.engine.check_exists(userid, &ip).await?;
    Ok(Json(json!({ "found": found })).into_response())
}

/// `/api/<kind>-project-blocked`
pub async fn project_blocked(
    State(state): State<KindState>,
    ClientIp(ip): ClientIp,
    form: FormFields,
) -> ApiResult {
    let project = form.get_str("project").unwrap_or_default();
    let blocked = state.engine.check_scope_blocked(project, &ip).await?;
    Ok(Json(json!({ "blocked": blocked })).into_response())
}

/// GET `/api/<kind>-account-review`
pub async fn review_fetch(
    State(state): State<KindState>,
    caller: Caller,
    form: FormFields,
) -> ApiResult {
    let actor = caller.require()?;
    let token = form.get_str("token").unwrap_or_default();
    let entry = state.engine.review_fetch(token, &actor).await?;
    Ok(Json(json!({ "success": true, "entry": entry })).into_response())
}

/// POST `/api/<kind>-account-review`
pub async fn review_action(
    State(state): State<KindState>,
    caller: Caller,
    form: FormFields,
) -> ApiResult {
    let actor = caller.require()?;
    let token = form.get_str("token").unwrap_or_default();
    let action: ReviewAction = form.get_str("action").unwrap_or_default().parse()?;
    let reason = form.get_str("reason");
    Ok(reply(
        state
            .engine
            .review_action(token, &actor, action, reason)
            .await?,
    ))
}

// ============================================================================
// Reactivation
// ============================================================================

/// `/api/<kind>-account-activate`
pub async fn activate(
    State(state): State<KindState>,
    ClientIp(ip): ClientIp,
    form: FormFields,
) -> ApiResult {
    let service = state.reactivation()?;
    Ok(reply(
        service
            .request(&form.fields, &ip, AccountDb::now_secs())
            .await?,
    ))
}

/// `/api/<kind>-account-activate-confirm`
pub async fn activate_confirm(State(state): State<KindState>, form: FormFields) -> ApiResult {
    let service = state.reactivation()?;
    let token = form.token().unwrap_or_default();
    let done = service.confirm(&token, AccountDb::now_secs()).await?;
    Ok(Json(json!({
        "success": true,
        "activated": true,
        "message": done.message,
    }))
    .into_response())
}

// ============================================================================
// Portal-wide
// ============================================================================

/// POST `/api/mailinglist`
pub async fn mailinglist(
    State(state): State<AppState>,
    caller: Caller,
    form: FormFields,
) -> ApiResult {
    let actor = caller.require()?;
    let done = state
        .portal
        .mailing_lists
        .request(&actor, &form.fields, AccountDb::now_secs())
        .await?;
    Ok(reply(done))
}

// ============================================================================
// Spaces and projects
// ============================================================================

/// `/api/confluence-create`
pub async fn create_space(
    State(state): State<AppState>,
    caller: Caller,
    form: FormFields,
) -> ApiResult {
    let actor = caller.require()?;
    Ok(reply(state.portal.resources.create_space(&actor, &form.fields).await?))
}

/// POST `/api/confluence-archive`
pub async fn archive_space(
    State(state): State<AppState>,
    caller: Caller,
    form: FormFields,
) -> ApiResult {
    let actor = caller.require()?;
    Ok(reply(state.portal.resources.archive_space(&actor, &form.fields).await?))
}

/// POST `/api/jira-project-create`
pub async fn create_jira_project(
    State(state): State<AppState>,
    caller: Caller,
    form: FormFields,
) -> ApiResult {
    let actor = caller.require()?;
    Ok(reply(
        state
            .portal
            .resources
            .create_jira_project(&actor, &form.fields)
            .await?,
    ))
}

/// GET `/api/jira-project-schemes`
pub async fn jira_schemes(State(state): State<AppState>, caller: Caller) -> ApiResult {
    caller.require()?;
    Ok(Json(state.portal.resources.jira_schemes().await).into_response())
}

/// GET `/api/queue`: list pending jobs, or `rm=<file>` to drop a processed one.
pub async fn queue(State(state): State<AppState>, caller: Caller, form: FormFields) -> ApiResult {
    let actor = caller.require()?;
    if !actor.is_role_account {
        return Err(ApiError::forbidden(
            "This endpoint is only available to role accounts",
        ));
    }
    let queue = &state.portal.queue;

    if let Some(item) = form.get_str("rm").filter(|s| !s.is_empty()) {
        if !is_valid_job_id(item) {
            return Err(ApiError::bad_request("Invalid queue item name"));
        }
        let removed = queue.remove(item).await.map_err(selfserve_engine::RequestError::from)?;
        if !removed {
            return Ok((
                StatusCode::NOT_FOUND,
                Json(json!({ "success": false, "message": "Item not found in queue" })),
            )
                .into_response());
        }
        return Ok(reply(Reply::ok("Item removed from queue")));
    }

    let items = queue.list().await.map_err(selfserve_engine::RequestError::from)?;
    Ok(Json(items).into_response())
}

/// GET `/api/session`
pub async fn session(State(state): State<AppState>, caller: Caller) -> ApiResult {
    let actor = caller.require()?;
    let all_projects: Vec<String> = state
        .portal
        .projects
        .snapshot()
        .projects
        .iter()
        .cloned()
        .collect();
    Ok(Json(json!({
        "uid": actor.uid,
        "name": actor.name,
        "projects": actor.projects,
        "pmcs": actor.pmcs,
        "root": actor.is_root,
        "member": actor.is_member,
        "chair": actor.is_chair,
        "roleaccount": actor.is_role_account,
        "all_projects": all_projects,
    }))
    .into_response())
}
