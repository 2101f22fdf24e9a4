use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures::{Stream, StreamExt};
use stock_bridge::WireFrame;
use stock_core::ProductChangeEvent;
use tokio_stream::wrappers::ReceiverStream;

use crate::dto::{
    HealthResponse, ListProductResponse, ProductResponse, QuantityProductResponse,
    UpdateQuantityProduct,
};
use crate::error::ApiError;
use crate::server::AppState;

pub const PRODUCT_QUANTITY_UPDATED_EVENT: &str = "product-quantity-updated";

/// `GET /api/v1/products`
pub async fn list_products(
    State(state): State<AppState>,
) -> Result<Json<ListProductResponse>, ApiError> {
    let products = state.store.find_all().await?;
    Ok(Json(ListProductResponse {
        produits: products.into_iter().map(ProductResponse::from).collect(),
    }))
}

/// `PUT /api/v1/products/{ean}`
pub async fn update_quantity(
    State(state): State<AppState>,
    Path(ean): Path<String>,
    Json(body): Json<UpdateQuantityProduct>,
) -> Result<Json<QuantityProductResponse>, ApiError> {
    let product = state.store.apply_quantity_delta(&ean, body.quantity).await?;
    tracing::info!(ean = %product.ean, delta = body.quantity, total = product.quantity, "quantity updated");
    Ok(Json(QuantityProductResponse::from(&product)))
}

/// `GET /api/v1/products/listen-product-quantity-updated`
pub async fn listen_product_quantity_updated(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let session = state.sessions.open_product_stream(
        PRODUCT_QUANTITY_UPDATED_EVENT,
        |event: ProductChangeEvent| QuantityProductResponse::from(event),
        state.stream_timeout,
    );
    let (handle, frames) = session.into_parts();
    tracing::debug!(session_id = %handle.id(), "quantity stream attached");

    Sse::new(ReceiverStream::new(frames).map(|frame| Ok(sse_event(frame))))
}

pub fn sse_event(frame: WireFrame) -> Event {
    Event::default().id(frame.id).event(frame.event).data(frame.data)
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let running = state.listener.is_running();
    let hub = state.sessions.hub();
    let body = HealthResponse {
        status: if running { "healthy" } else { "unhealthy" }.to_string(),
        subscribers: hub.subscriber_count(),
        listener: if running { "running" } else { "stopped" }.to_string(),
        events_published: hub.published(),
        notifications: state.listener.stats(),
    };
    let status = if running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}
