use axum::{extract::Request, middleware::Next, response::Response};

use crate::app_error::AppError;

/// Header set by the upstream authentication layer.
pub const ACTOR_HEADER: &str = "x-user-id";

/// Authenticated user behind a request, if any. Requests without the header
/// are treated as system calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Actor(pub Option<i32>);

/// Reads [`ACTOR_HEADER`] into an [`Actor`] extension.
pub async fn actor_identity(mut req: Request, next: Next) -> Result<Response, AppError> {
    let actor = match req.headers().get(ACTOR_HEADER) {
        Some(value) => {
            let id = value
                .to_str()
                .ok()
                .and_then(|raw| raw.trim().parse::<i32>().ok())
                .ok_or_else(|| AppError::Validation(format!("Invalid {} header", ACTOR_HEADER)))?;
            Actor(Some(id))
        }
        None => Actor(None),
    };

    req.extensions_mut().insert(actor);
    Ok(next.run(req).await)
}
