use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Value};
use stock_bridge::{
    BroadcastHub, ChannelListener, ListenerHandle, MemoryNotificationSource, NotificationInjector,
    StreamSessions,
};
use stock_core::{Price, Product};
use stock_server::{start, ServerConfig, ServerHandle};
use stock_store::MemoryProductStore;

const CHANNEL: &str = "product_quantity_updated";

struct Harness {
    server: ServerHandle,
    listener: ListenerHandle,
    injector: NotificationInjector,
    hub: BroadcastHub,
}

impl Harness {
    fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.server.port, path)
    }
}

async fn harness(stream_timeout: Option<Duration>) -> Harness {
    let store = Arc::new(MemoryProductStore::with_products([
        Product::new("123", "Widget", 5, Price::from_cents(1299)),
        Product::new("456", "Gadget", 0, Price::from_cents(500)),
    ]));
    let hub = BroadcastHub::new(64);
    let sessions = StreamSessions::new(hub.clone(), Duration::from_secs(15), 16);

    let (source, injector) = MemoryNotificationSource::new();
    let listener = ChannelListener::start(CHANNEL, source, hub.clone(), Duration::from_millis(20))
        .await
        .unwrap();

    let config = ServerConfig {
        host: "127.0.0.1".into(),
        port: 0,
        stream_timeout,
        ..Default::default()
    };
    let server = start(config, store, sessions, listener.monitor())
        .await
        .unwrap();

    Harness {
        server,
        listener,
        injector,
        hub,
    }
}

#[derive(Debug, Default, PartialEq)]
struct SseFrame {
    id: String,
    event: String,
    data: String,
}

type Body = std::pin::Pin<Box<dyn futures::Stream<Item = reqwest::Result<Vec<u8>>> + Send>>;

/// Incremental `text/event-stream` reader over a reqwest body.
struct SseReader {
    body: Body,
    buffer: String,
}

impl SseReader {
    fn new(resp: reqwest::Response) -> Self {
        Self {
            body: Box::pin(resp.bytes_stream().map(|chunk| chunk.map(|b| b.to_vec()))),
            buffer: String::new(),
        }
    }

    /// Next complete frame, or `None` when the server ends the stream.
    async fn next(&mut self) -> Option<SseFrame> {
        loop {
            if let Some(end) = self.buffer.find("\n\n") {
                let block: String = self.buffer.drain(..end + 2).collect();
                if let Some(frame) = parse_block(&block) {
                    return Some(frame);
                }
                continue;
            }
            let chunk = tokio::time::timeout(Duration::from_secs(5), self.body.next())
                .await
                .expect("timed out waiting for stream data")?
                .ok()?;
            self.buffer.push_str(&String::from_utf8_lossy(&chunk));
        }
    }

    async fn next_data(&mut self) -> Option<SseFrame> {
        loop {
            let frame = self.next().await?;
            if frame.event != "heartbeat" {
                return Some(frame);
            }
        }
    }
}

fn parse_block(block: &str) -> Option<SseFrame> {
    let mut frame = SseFrame::default();
    let mut seen = false;
    for line in block.lines() {
        let Some((field, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.strip_prefix(' ').unwrap_or(value);
        seen = true;
        match field {
            "id" => frame.id = value.to_string(),
            "event" => frame.event = value.to_string(),
            "data" => frame.data.push_str(value),
            _ => {}
        }
    }
    seen.then_some(frame)
}

#[tokio::test]
async fn lists_products_with_french_field_names() {
    let h = harness(None).await;
    let resp = reqwest::get(h.url("/api/v1/products")).await.unwrap();
    assert_eq!(resp.status(), 200);

    let body: Value = resp.json().await.unwrap();
    assert_eq!(
        body,
        json!({
            "produits": [
                {"ean": "123", "nom": "Widget", "quantite": 5, "prix": 12.99},
                {"ean": "456", "nom": "Gadget", "quantite": 0, "prix": 5.0}
            ]
        })
    );
}

#[tokio::test]
async fn update_applies_delta() {
    let h = harness(None).await;
    let client = reqwest::Client::new();

    let resp = client
        .put(h.url("/api/v1/products/123"))
        .json(&json!({"quantity": 3}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({"ean": "123", "totalQuantity": 8}));

    let resp = client
        .put(h.url("/api/v1/products/123"))
        .json(&json!({"quantity": -10}))
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["totalQuantity"], -2);
}

#[tokio::test]
async fn update_unknown_product_is_404() {
    let h = harness(None).await;
    let resp = reqwest::Client::new()
        .put(h.url("/api/v1/products/999"))
        .json(&json!({"quantity": 1}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("999"));
}

#[tokio::test]
async fn notification_reaches_stream_client() {
    let h = harness(None).await;
    let resp = reqwest::get(h.url("/api/v1/products/listen-product-quantity-updated"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let mut reader = SseReader::new(resp);
    let first = reader.next().await.unwrap();
    assert_eq!(
        first,
        SseFrame {
            id: "heartbeat-1".into(),
            event: "heartbeat".into(),
            data: String::new(),
        }
    );

    h.injector
        .notify(CHANNEL, r#"{"ean":"123","nom":"Widget","quantite":5}"#);
    let frame = reader.next_data().await.unwrap();
    assert_eq!(frame.id, "0");
    assert_eq!(frame.event, "product-quantity-updated");
    let data: Value = serde_json::from_str(&frame.data).unwrap();
    assert_eq!(data, json!({"ean": "123", "totalQuantity": 5}));
}

#[tokio::test]
async fn bad_notification_does_not_break_stream() {
    let h = harness(None).await;
    let resp = reqwest::get(h.url("/api/v1/products/listen-product-quantity-updated"))
        .await
        .unwrap();
    let mut reader = SseReader::new(resp);
    reader.next().await.unwrap();

    h.injector.notify(CHANNEL, "{not json");
    h.injector
        .notify(CHANNEL, r#"{"ean":"456","nom":"Gadget","quantite":2}"#);

    let frame = reader.next_data().await.unwrap();
    assert_eq!(frame.id, "0");
    assert!(frame.data.contains("\"456\""));
    assert_eq!(h.listener.stats().skipped, 1);

    let health: Value = reqwest::get(h.url("/health")).await.unwrap().json().await.unwrap();
    assert_eq!(health["eventsPublished"], 1);
    assert_eq!(health["notifications"]["received"], 2);
    assert_eq!(health["notifications"]["skipped"], 1);
    assert_eq!(health["notifications"]["delivered"], 1);
}

#[tokio::test]
async fn listener_stop_ends_streams_and_fails_health() {
    let h = harness(None).await;
    let resp = reqwest::get(h.url("/api/v1/products/listen-product-quantity-updated"))
        .await
        .unwrap();
    let mut reader = SseReader::new(resp);
    reader.next().await.unwrap();
    assert_eq!(h.hub.subscriber_count(), 1);

    h.listener.stop().await.unwrap();
    assert!(reader.next().await.is_none());

    let resp = reqwest::get(h.url("/health")).await.unwrap();
    assert_eq!(resp.status(), 503);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["listener"], "stopped");
    assert_eq!(body["subscribers"], 0);

    h.server.shutdown().await;
}

#[tokio::test]
async fn client_disconnect_releases_subscription() {
    let h = harness(None).await;
    let resp = reqwest::get(h.url("/api/v1/products/listen-product-quantity-updated"))
        .await
        .unwrap();
    let mut reader = SseReader::new(resp);
    reader.next().await.unwrap();
    assert_eq!(h.hub.subscriber_count(), 1);
    drop(reader);

    // The session notices on its next write or when the body is dropped.
    for _ in 0..100 {
        h.injector
            .notify(CHANNEL, r#"{"ean":"123","nom":"Widget","quantite":1}"#);
        if h.hub.subscriber_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(h.hub.subscriber_count(), 0);
}

#[tokio::test]
async fn stream_timeout_closes_connection() {
    let h = harness(Some(Duration::from_millis(200))).await;
    let resp = reqwest::get(h.url("/api/v1/products/listen-product-quantity-updated"))
        .await
        .unwrap();
    let mut reader = SseReader::new(resp);
    assert_eq!(reader.next().await.unwrap().event, "heartbeat");
    assert!(reader.next().await.is_none());
}

#[tokio::test]
async fn cors_allows_configured_origin() {
    let h = harness(None).await;
    let resp = reqwest::Client::new()
        .get(h.url("/api/v1/products"))
        .header("Origin", "http://localhost:8081")
        .send()
        .await
        .unwrap();
    assert_eq!(
        resp.headers()["access-control-allow-origin"],
        "http://localhost:8081"
    );
}
