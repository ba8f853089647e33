// HTTP API tests against an in-memory fleet
// Run with: cargo test -p labelq-control-plane --test api_test

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use labelq_control_plane::api::{build_app, DEFAULT_MAX_UPLOAD_BYTES};
use labelq_fleet::{
    CorrelationId, FleetConfig, FleetDeps, FleetService, InMemoryChannel, InMemoryCompute,
    InMemoryCorrelationStore, Job, MessageChannel, Reply,
};
use serde_json::Value;
use tower::ServiceExt;

const BOUNDARY: &str = "labelq-test-boundary";

struct TestFleet {
    jobs: Arc<InMemoryChannel>,
    replies: Arc<InMemoryChannel>,
    service: FleetService,
    app: Router,
}

async fn start_fleet(result_timeout: Duration) -> TestFleet {
    let jobs = Arc::new(InMemoryChannel::new("jobs"));
    let replies = Arc::new(InMemoryChannel::new("replies"));
    let deps = FleetDeps {
        jobs: jobs.clone(),
        replies: replies.clone(),
        store: Arc::new(InMemoryCorrelationStore::new()),
        compute: Arc::new(InMemoryCompute::new()),
    };

    let mut config = FleetConfig::default();
    config.dispatch = config
        .dispatch
        .with_timeout(result_timeout)
        .with_poll_interval(Duration::from_millis(50));

    let service = FleetService::setup(deps, config).await.unwrap();
    service.start().await.unwrap();
    let app = build_app(
        service.dispatcher(),
        service.controller(),
        DEFAULT_MAX_UPLOAD_BYTES,
    );

    TestFleet {
        jobs,
        replies,
        service,
        app,
    }
}

/// Answer every job with `label`, the way a worker would
fn spawn_worker(
    jobs: Arc<InMemoryChannel>,
    replies: Arc<InMemoryChannel>,
    label: &'static str,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let batch = jobs.receive(1, Duration::from_secs(1)).await.unwrap();
            for message in batch {
                let job = Job::from_message(&message).unwrap();
                let reply = Reply::labeled(
                    CorrelationId::new(message.message_id.clone()),
                    &job.name,
                    label,
                );
                replies.send(reply.to_message()).await.unwrap();
                jobs.delete(&message.receipt_handle).await.unwrap();
            }
        }
    })
}

fn multipart_request(field: &str, file_name: &str, data: &[u8]) -> Request<Body> {
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"{field}\"; filename=\"{file_name}\"\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(b"Content-Type: image/jpeg\r\n\r\n");
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

    Request::builder()
        .method(Method::POST)
        .uri("/")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, value)
}

#[tokio::test(start_paused = true)]
async fn test_health() {
    let fleet = start_fleet(Duration::from_secs(5)).await;

    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, body) = send(&fleet.app, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    fleet.service.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_label_image_round_trip() {
    let fleet = start_fleet(Duration::from_secs(30)).await;
    let worker = spawn_worker(fleet.jobs.clone(), fleet.replies.clone(), "tabby cat");

    let (status, body) = send(
        &fleet.app,
        multipart_request("myfile", "test_00.JPEG", b"\xff\xd8pixels"),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::String("tabby cat".to_string()));

    worker.abort();
    fleet.service.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_uploads_get_their_own_labels() {
    let fleet = start_fleet(Duration::from_secs(30)).await;

    // A worker that labels each image with its own stem
    let jobs = fleet.jobs.clone();
    let replies = fleet.replies.clone();
    let worker = tokio::spawn(async move {
        loop {
            for message in jobs.receive(10, Duration::from_secs(1)).await.unwrap() {
                let job = Job::from_message(&message).unwrap();
                let label = format!("label-{}", job.stem());
                let reply = Reply::labeled(
                    CorrelationId::new(message.message_id.clone()),
                    &job.name,
                    &label,
                );
                replies.send(reply.to_message()).await.unwrap();
                jobs.delete(&message.receipt_handle).await.unwrap();
            }
        }
    });

    let uploads = (0..5).map(|i| {
        let app = fleet.app.clone();
        async move {
            let name = format!("img{i}.jpg");
            let (status, body) = send(&app, multipart_request("myfile", &name, b"data")).await;
            (i, status, body)
        }
    });
    for (i, status, body) in futures::future::join_all(uploads).await {
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Value::String(format!("label-img{i}")));
    }

    worker.abort();
    fleet.service.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_missing_image_is_bad_request() {
    let fleet = start_fleet(Duration::from_secs(5)).await;

    let (status, body) = send(&fleet.app, multipart_request("other", "cat.jpg", b"data")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "No image provided");

    let (status, _) = send(&fleet.app, multipart_request("myfile", "cat.jpg", b"")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let not_multipart = Request::builder()
        .method(Method::POST)
        .uri("/")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{}"))
        .unwrap();
    let (status, body) = send(&fleet.app, not_multipart).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "No image provided");

    // Nothing was published
    assert!(fleet.jobs.is_empty());
    fleet.service.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_oversize_upload_is_payload_too_large() {
    let fleet = start_fleet(Duration::from_secs(5)).await;
    let app = build_app(fleet.service.dispatcher(), fleet.service.controller(), 256);

    let (status, body) = send(&app, multipart_request("myfile", "big.jpg", &[7u8; 4096])).await;

    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body["error"], "Image too large");
    assert!(fleet.jobs.is_empty());
    fleet.service.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_no_worker_reply_times_out() {
    let fleet = start_fleet(Duration::from_secs(5)).await;

    let (status, body) = send(&fleet.app, multipart_request("myfile", "cat.jpg", b"data")).await;

    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert!(body["error"].is_string());
    fleet.service.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_pool_lists_warm_worker() {
    let fleet = start_fleet(Duration::from_secs(5)).await;

    let request = Request::builder().uri("/v1/pool").body(Body::empty()).unwrap();
    let (status, body) = send(&fleet.app, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], serde_json::json!(["app-instance-1"]));
    fleet.service.shutdown().await.unwrap();
}
