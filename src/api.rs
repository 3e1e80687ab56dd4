use std::{path::Path as FsPath, sync::Arc, time::Duration};

use anyhow::Context;
use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing,
};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use tower_http::{
    services::{ServeDir, ServeFile},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::{
    url_repo::UrlMapping,
    url_service::{DeleteError, ResolveError, ShortenError, UrlService},
};

#[derive(Deserialize)]
pub struct ShortenPayload {
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct MappingResponse {
    pub id: String,
    pub code: String,
    pub original_url: String,
    /// Timestamp in RFC 3339 format
    pub created_at: String,
    /// Timestamp in RFC 3339 format
    pub updated_at: String,
}

#[derive(Serialize)]
pub struct Error {
    error: String,
    error_id: String,
}

#[derive(Serialize)]
pub struct Health {
    status: &'static str,
}

/// Builds the full HTTP application around `url_service`.
pub fn app(
    url_service: Arc<dyn UrlService>,
    request_timeout: Duration,
    static_dir: &FsPath,
) -> Router {
    Router::new()
        .route("/shorten", routing::post(shorten))
        .route("/url/{id}", routing::delete(delete_url))
        .route("/health", routing::get(liveness))
        .route("/ready", routing::get(readiness))
        .route("/{code}", routing::get(redirect))
        .route_service("/", ServeFile::new(static_dir.join("index.html")))
        .nest_service("/static", ServeDir::new(static_dir))
        .with_state(url_service)
        .layer(TimeoutLayer::with_status_code(
            StatusCode::SERVICE_UNAVAILABLE,
            request_timeout,
        ))
        .layer(TraceLayer::new_for_http())
}

fn error_response(status: StatusCode, error: String, err_uuid: Uuid) -> Response {
    (
        status,
        Json(Error {
            error,
            error_id: err_uuid.to_string(),
        }),
    )
        .into_response()
}

fn internal_error(err_uuid: Uuid) -> Response {
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "Internal server error".to_owned(),
        err_uuid,
    )
}

#[instrument(skip(url_service, payload))]
async fn shorten(
    State(url_service): State<Arc<dyn UrlService>>,
    payload: Result<Json<ShortenPayload>, JsonRejection>,
) -> Response {
    let url = match payload {
        Ok(Json(ShortenPayload { url })) if !url.is_empty() => url,
        Ok(_) => {
            let err_uuid = Uuid::new_v4();
            info!(?err_uuid, "User submitted a request without a URL");
            return error_response(
                StatusCode::BAD_REQUEST,
                "url is required".to_owned(),
                err_uuid,
            );
        }
        Err(rejection) => {
            let err_uuid = Uuid::new_v4();
            info!(?err_uuid, ?rejection, "User submitted a malformed body");
            return error_response(StatusCode::BAD_REQUEST, rejection.body_text(), err_uuid);
        }
    };

    let result = url_service
        .shorten(&url)
        .await
        .map_err(|error| {
            let err_uuid = Uuid::new_v4();
            match error {
                ShortenError::InvalidUrl(_) => {
                    info!(?err_uuid, ?error, "User submitted a bad request");
                    error_response(StatusCode::BAD_REQUEST, error.to_string(), err_uuid)
                }
                ShortenError::CodeAllocationExhausted { .. }
                | ShortenError::RandomSource(_)
                | ShortenError::Store(_) => {
                    error!(?err_uuid, ?error, "Encountered an error during a request");
                    internal_error(err_uuid)
                }
            }
        })
        .and_then(|mapping| {
            MappingResponse::try_from(mapping).map_err(|err| {
                let err_uuid = Uuid::new_v4();
                error!(
                    ?err_uuid,
                    ?err,
                    "Failed to convert mapping into external format"
                );
                internal_error(err_uuid)
            })
        });

    match result {
        Ok(body) => (StatusCode::CREATED, Json(body)).into_response(),
        Err(response) => response,
    }
}

#[instrument(skip(url_service))]
async fn redirect(
    State(url_service): State<Arc<dyn UrlService>>,
    Path(code): Path<String>,
) -> Response {
    match url_service.resolve(&code).await {
        Ok(mapping) => (
            StatusCode::FOUND,
            [(header::LOCATION, mapping.original_url)],
        )
            .into_response(),
        Err(ResolveError::NotFound) => {
            error_response(StatusCode::NOT_FOUND, "Not found".to_owned(), Uuid::new_v4())
        }
        Err(error @ ResolveError::Store(_)) => {
            let err_uuid = Uuid::new_v4();
            error!(?err_uuid, ?error, "Encountered an error during a request");
            internal_error(err_uuid)
        }
    }
}

#[instrument(skip(url_service))]
async fn delete_url(
    State(url_service): State<Arc<dyn UrlService>>,
    Path(id): Path<String>,
) -> Response {
    let Ok(id) = Uuid::parse_str(&id) else {
        let err_uuid = Uuid::new_v4();
        info!(?err_uuid, %id, "User submitted a malformed id");
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("{id} is not a valid id"),
            err_uuid,
        );
    };

    match url_service.delete(id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(DeleteError::NotFound) => {
            error_response(StatusCode::NOT_FOUND, "Not found".to_owned(), Uuid::new_v4())
        }
        Err(error @ DeleteError::Store(_)) => {
            let err_uuid = Uuid::new_v4();
            error!(?err_uuid, ?error, "Encountered an error during a request");
            internal_error(err_uuid)
        }
    }
}

async fn liveness() -> Json<Health> {
    Json(Health { status: "ok" })
}

#[instrument(skip(url_service))]
async fn readiness(State(url_service): State<Arc<dyn UrlService>>) -> impl IntoResponse {
    match url_service.ping().await {
        Ok(()) => (StatusCode::OK, Json(Health { status: "ok" })),
        Err(err) => {
            error!(?err, "Store is not reachable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(Health {
                    status: "unavailable",
                }),
            )
        }
    }
}

impl TryFrom<UrlMapping> for MappingResponse {
    type Error = anyhow::Error;

    fn try_from(
        UrlMapping {
            id,
            code,
            original_url,
            created_at,
            updated_at,
        }: UrlMapping,
    ) -> Result<Self, Self::Error> {
        Ok(Self {
            id: id.to_string(),
            code: code.into_inner(),
            original_url,
            created_at: created_at
                .format(&Rfc3339)
                .context("Failed to format created_at")?,
            updated_at: updated_at
                .format(&Rfc3339)
                .context("Failed to format updated_at")?,
        })
    }
}
