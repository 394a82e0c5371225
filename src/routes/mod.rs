pub mod health;
pub mod payments;

use axum::Router;
use tower_http::trace::TraceLayer;
use utoipa_axum::router::OpenApiRouter;
use utoipa_swagger_ui::SwaggerUi;

use crate::app_state::AppState;

/// Full HTTP application: routes, OpenAPI document at `/api-docs/openapi.json`
/// and Swagger UI at `/swagger-ui`.
pub fn app(state: AppState) -> Router {
    let (router, mut openapi) = OpenApiRouter::new()
        .merge(payments::routes_with_openapi())
        .merge(health::routes_with_openapi())
        .split_for_parts();

    openapi.info = utoipa::openapi::InfoBuilder::new()
        .title("Marketplace Payments API")
        .version(env!("CARGO_PKG_VERSION"))
        .build();

    router
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", openapi))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
