use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use mcproxy_api::model::{
    BlacklistEntrySummary, CreateBlacklistEntry, CreateWhitelistEntry, GroupStatsSummary,
    OutboundSummary, ServerSummary, SessionSummary, WhitelistEntrySummary,
};
use mcproxy_api::ApiResponse;

use crate::SharedEnv;

/// List every configured server.
#[utoipa::path(
    get,
    path = "/servers",
    tag = "servers",
    responses((status = 200, description = "All configured servers", body = [ServerSummary]))
)]
pub async fn servers(State(env): State<SharedEnv>) -> Json<ApiResponse<Vec<ServerSummary>>> {
    Json(ApiResponse::ok(env.api.list_servers().await))
}

/// Get one server by id.
#[utoipa::path(
    get,
    path = "/servers/{id}",
    tag = "servers",
    params(("id" = String, Path, description = "Server id")),
    responses(
        (status = 200, description = "Found server", body = ServerSummary),
        (status = 404, description = "No such server"),
    )
)]
pub async fn server(
    State(env): State<SharedEnv>,
    Path(id): Path<String>,
) -> (StatusCode, Json<ApiResponse<ServerSummary>>) {
    match env.api.get_server(&id).await {
        Some(server) => (StatusCode::OK, Json(ApiResponse::ok(server))),
        None => (StatusCode::NOT_FOUND, Json(ApiResponse::err("unknown server"))),
    }
}

/// Re-enable a disabled server.
#[utoipa::path(
    post,
    path = "/servers/{id}/enable",
    tag = "servers",
    params(("id" = String, Path, description = "Server id")),
    responses((status = 200, description = "Server enabled"))
)]
pub async fn enable_server(
    State(env): State<SharedEnv>,
    Path(id): Path<String>,
) -> (StatusCode, Json<ApiResponse<()>>) {
    write_result(env.api.enable_server(&id).await)
}

/// Disable a server without removing its configuration.
#[utoipa::path(
    post,
    path = "/servers/{id}/disable",
    tag = "servers",
    params(("id" = String, Path, description = "Server id")),
    responses((status = 200, description = "Server disabled"))
)]
pub async fn disable_server(
    State(env): State<SharedEnv>,
    Path(id): Path<String>,
) -> (StatusCode, Json<ApiResponse<()>>) {
    write_result(env.api.disable_server(&id).await)
}

/// Atomically stop and restart a server's listener from the latest
/// configuration.
#[utoipa::path(
    post,
    path = "/servers/{id}/reload",
    tag = "servers",
    params(("id" = String, Path, description = "Server id")),
    responses((status = 200, description = "Server reloaded"))
)]
pub async fn reload_server(
    State(env): State<SharedEnv>,
    Path(id): Path<String>,
) -> (StatusCode, Json<ApiResponse<()>>) {
    write_result(env.api.reload_server(&id).await)
}

/// List every live session across all servers.
#[utoipa::path(
    get,
    path = "/sessions",
    tag = "sessions",
    responses((status = 200, description = "Live sessions", body = [SessionSummary]))
)]
pub async fn sessions(State(env): State<SharedEnv>) -> Json<ApiResponse<Vec<SessionSummary>>> {
    Json(ApiResponse::ok(env.api.list_sessions().await))
}

/// Disconnect every session for a player by display name.
#[utoipa::path(
    post,
    path = "/sessions/{name}/kick",
    tag = "sessions",
    params(("name" = String, Path, description = "Player display name")),
    responses((status = 200, description = "Number of sessions kicked", body = usize))
)]
pub async fn kick_player(
    State(env): State<SharedEnv>,
    Path(name): Path<String>,
) -> (StatusCode, Json<ApiResponse<usize>>) {
    match env.api.kick_player(&name).await {
        Ok(count) => (StatusCode::OK, Json(ApiResponse::ok(count))),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, Json(ApiResponse::err(err.to_string()))),
    }
}

/// List every configured outbound tunnel with its last known health.
#[utoipa::path(
    get,
    path = "/outbounds",
    tag = "outbounds",
    responses((status = 200, description = "Outbound tunnels", body = [OutboundSummary]))
)]
pub async fn outbounds(State(env): State<SharedEnv>) -> Json<ApiResponse<Vec<OutboundSummary>>> {
    Json(ApiResponse::ok(env.api.list_outbounds().await))
}

/// Delete an outbound; any server referencing it is rewritten to
/// dial its target directly.
#[utoipa::path(
    delete,
    path = "/outbounds/{name}",
    tag = "outbounds",
    params(("name" = String, Path, description = "Outbound name")),
    responses((status = 200, description = "Outbound deleted"))
)]
pub async fn delete_outbound(
    State(env): State<SharedEnv>,
    Path(name): Path<String>,
) -> (StatusCode, Json<ApiResponse<()>>) {
    write_result(env.api.delete_outbound(&name).await)
}

/// List the distinct outbound group names in use.
#[utoipa::path(
    get,
    path = "/outbounds/groups",
    tag = "outbounds",
    responses((status = 200, description = "Outbound group names", body = [String]))
)]
pub async fn groups(State(env): State<SharedEnv>) -> Json<ApiResponse<Vec<String>>> {
    Json(ApiResponse::ok(env.api.list_groups().await))
}

/// Aggregate health stats for one outbound group.
#[utoipa::path(
    get,
    path = "/outbounds/groups/{group}/stats",
    tag = "outbounds",
    params(("group" = String, Path, description = "Outbound group name")),
    responses(
        (status = 200, description = "Group stats", body = GroupStatsSummary),
        (status = 404, description = "No such group"),
    )
)]
pub async fn group_stats(
    State(env): State<SharedEnv>,
    Path(group): Path<String>,
) -> (StatusCode, Json<ApiResponse<GroupStatsSummary>>) {
    match env.api.group_stats(&group).await {
        Some(stats) => (StatusCode::OK, Json(ApiResponse::ok(stats))),
        None => (StatusCode::NOT_FOUND, Json(ApiResponse::err("unknown group"))),
    }
}

/// List blacklist entries across every scope.
#[utoipa::path(
    get,
    path = "/acl/blacklist",
    tag = "acl",
    responses((status = 200, description = "Blacklist entries", body = [BlacklistEntrySummary]))
)]
pub async fn blacklist(State(env): State<SharedEnv>) -> Json<ApiResponse<Vec<BlacklistEntrySummary>>> {
    Json(ApiResponse::ok(env.api.list_blacklist().await))
}

/// Add a blacklist entry.
#[utoipa::path(
    post,
    path = "/acl/blacklist",
    tag = "acl",
    request_body = CreateBlacklistEntry,
    responses((status = 200, description = "Entry added"))
)]
pub async fn add_blacklist_entry(
    State(env): State<SharedEnv>,
    Json(entry): Json<CreateBlacklistEntry>,
) -> (StatusCode, Json<ApiResponse<()>>) {
    write_result(env.api.add_blacklist_entry(entry).await)
}

/// Remove a blacklist entry by id, from every scope it appears in.
#[utoipa::path(
    delete,
    path = "/acl/blacklist/{id}",
    tag = "acl",
    params(("id" = String, Path, description = "Blacklist entry id")),
    responses((status = 200, description = "Entry removed"))
)]
pub async fn remove_blacklist_entry(
    State(env): State<SharedEnv>,
    Path(id): Path<String>,
) -> (StatusCode, Json<ApiResponse<()>>) {
    write_result(env.api.remove_blacklist_entry(&id).await)
}

/// List whitelist entries across every scope.
#[utoipa::path(
    get,
    path = "/acl/whitelist",
    tag = "acl",
    responses((status = 200, description = "Whitelist entries", body = [WhitelistEntrySummary]))
)]
pub async fn whitelist(State(env): State<SharedEnv>) -> Json<ApiResponse<Vec<WhitelistEntrySummary>>> {
    Json(ApiResponse::ok(env.api.list_whitelist().await))
}

/// Add a whitelist entry.
#[utoipa::path(
    post,
    path = "/acl/whitelist",
    tag = "acl",
    request_body = CreateWhitelistEntry,
    responses((status = 200, description = "Entry added"))
)]
pub async fn add_whitelist_entry(
    State(env): State<SharedEnv>,
    Json(entry): Json<CreateWhitelistEntry>,
) -> (StatusCode, Json<ApiResponse<()>>) {
    write_result(env.api.add_whitelist_entry(entry).await)
}

/// Remove a whitelist entry by id, from every scope it appears in.
#[utoipa::path(
    delete,
    path = "/acl/whitelist/{id}",
    tag = "acl",
    params(("id" = String, Path, description = "Whitelist entry id")),
    responses((status = 200, description = "Entry removed"))
)]
pub async fn remove_whitelist_entry(
    State(env): State<SharedEnv>,
    Path(id): Path<String>,
) -> (StatusCode, Json<ApiResponse<()>>) {
    write_result(env.api.remove_whitelist_entry(&id).await)
}

fn write_result(result: anyhow::Result<()>) -> (StatusCode, Json<ApiResponse<()>>) {
    match result {
        Ok(()) => (StatusCode::OK, Json(ApiResponse::ok(()))),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, Json(ApiResponse::err(err.to_string()))),
    }
}
