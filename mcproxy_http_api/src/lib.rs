//! mcproxy admin HTTP API.

use std::{net::SocketAddr, str::FromStr, sync::Arc};

use axum::{
    routing::{delete, get, post},
    Router,
};
use mcproxy_api::model::{
    BlacklistEntrySummary, CreateBlacklistEntry, CreateWhitelistEntry, GroupStatsSummary,
    OutboundSummary, ServerSummary, SessionSummary, WhitelistEntrySummary,
};
use mcproxy_api::provider::{AdminApiRead, AdminApiWrite};
use mcproxy_api::ApiResponse;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod resources;

pub type SharedEnv = Arc<AppEnv>;

/// Combines read and write access so the admin API only needs one
/// trait object per node.
pub trait AdminApi: AdminApiRead + AdminApiWrite {}
impl<T: AdminApiRead + AdminApiWrite> AdminApi for T {}

pub struct AppEnv {
    pub api: Arc<dyn AdminApi>,
}

/// Starts the HTTP admin API server.
///
/// ## Arguments
///
/// * `bind` - Address to bind to
/// * `api` - node-local admin provider, typically an
///   `Arc<mcproxy_core::controller::ProxyServer>`
pub async fn start(bind: &str, api: Arc<dyn AdminApi>) -> anyhow::Result<()> {
    #[derive(OpenApi)]
    #[openapi(
        paths(
            resources::servers,
            resources::server,
            resources::enable_server,
            resources::disable_server,
            resources::reload_server,
            resources::sessions,
            resources::kick_player,
            resources::outbounds,
            resources::delete_outbound,
            resources::groups,
            resources::group_stats,
            resources::blacklist,
            resources::add_blacklist_entry,
            resources::remove_blacklist_entry,
            resources::whitelist,
            resources::add_whitelist_entry,
            resources::remove_whitelist_entry,
        ),
        components(
            schemas(
                ServerSummary,
                SessionSummary,
                OutboundSummary,
                GroupStatsSummary,
                BlacklistEntrySummary,
                WhitelistEntrySummary,
                CreateBlacklistEntry,
                CreateWhitelistEntry,
            ),
        ),
        tags(
            (name = "servers", description = "Proxied servers: status, enable/disable, reload"),
            (name = "sessions", description = "Live client sessions"),
            (name = "outbounds", description = "Outbound tunnels and groups"),
            (name = "acl", description = "Blacklist/whitelist management"),
        ),
    )]
    struct ApiDoc;

    let env = Arc::new(AppEnv { api });

    let v0 = Router::new()
        .route("/servers", get(resources::servers))
        .route("/servers/:id", get(resources::server))
        .route("/servers/:id/enable", post(resources::enable_server))
        .route("/servers/:id/disable", post(resources::disable_server))
        .route("/servers/:id/reload", post(resources::reload_server))
        .route("/sessions", get(resources::sessions))
        .route("/sessions/:name/kick", post(resources::kick_player))
        .route("/outbounds", get(resources::outbounds))
        .route("/outbounds/:name", delete(resources::delete_outbound))
        .route("/outbounds/groups", get(resources::groups))
        .route("/outbounds/groups/:group/stats", get(resources::group_stats))
        .route(
            "/acl/blacklist",
            get(resources::blacklist).post(resources::add_blacklist_entry),
        )
        .route("/acl/blacklist/:id", delete(resources::remove_blacklist_entry))
        .route(
            "/acl/whitelist",
            get(resources::whitelist).post(resources::add_whitelist_entry),
        )
        .route("/acl/whitelist/:id", delete(resources::remove_whitelist_entry));

    let router = Router::new()
        .merge(SwaggerUi::new("/v0/swagger-ui").url("/v0/openapi.json", ApiDoc::openapi()))
        .nest("/v0", v0)
        .with_state(env);

    let bind_addr = SocketAddr::from_str(bind)?;
    log::info!("admin HTTP API listening on {bind_addr}");
    axum::Server::bind(&bind_addr)
        .serve(router.into_make_service())
        .await?;
    Ok(())
}
