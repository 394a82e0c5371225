use axum::response::IntoResponse;
use serde::Serialize;
use utoipa::ToSchema;
use utoipa_axum::router::OpenApiRouter;

use crate::{app_error::StdResponse, app_state::AppState};

pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    OpenApiRouter::new().routes(utoipa_axum::routes!(health))
}

#[derive(Serialize, ToSchema)]
pub struct HealthRes {
    status: &'static str,
    version: &'static str,
}

/// Liveness probe.
#[utoipa::path(
    get,
    path = "/health",
    tags = ["Health"],
    responses(
        (status = 200, description = "Service is up", body = StdResponse<HealthRes, String>)
    )
)]
async fn health() -> impl IntoResponse {
    StdResponse {
        data: Some(HealthRes {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
        }),
        message: None::<String>,
    }
}
