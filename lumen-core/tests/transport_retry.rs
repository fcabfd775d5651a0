//! Retry, timeout and cancellation behavior of the resilient transport
//! against a local fake origin.

mod common;

use std::time::{Duration, Instant};

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;

use common::{spawn_origin, spawn_server, Origin, IMAGE_BYTES};
use lumen_core::{CancelSignal, FetchOptions, LumenError, ResilientTransport};

fn options(max_retries: u32) -> FetchOptions {
    FetchOptions {
        max_retries,
        retry_delay: Duration::from_millis(10),
        timeout: Duration::from_secs(2),
        cancel: None,
    }
}

#[tokio::test]
async fn test_two_retries_means_three_attempts() {
    let origin = Origin {
        failures: usize::MAX,
        ..Origin::serving(IMAGE_BYTES)
    };
    let url = spawn_origin(origin.clone()).await;

    let err = ResilientTransport::new()
        .unwrap()
        .fetch(&url, &options(2))
        .await
        .unwrap_err();

    assert_eq!(origin.hits(), 3);
    match err {
        LumenError::FetchFailed { url: failed, status, .. } => {
            assert_eq!(failed, url);
            assert_eq!(status, Some(503));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_recovers_after_two_failures() {
    let origin = Origin {
        failures: 2,
        ..Origin::serving(IMAGE_BYTES)
    };
    let url = spawn_origin(origin.clone()).await;

    let response = ResilientTransport::new()
        .unwrap()
        .fetch(&url, &options(2))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.bytes().await.unwrap().as_ref(), IMAGE_BYTES);
    assert_eq!(origin.hits(), 3);
}

#[tokio::test]
async fn test_client_errors_are_not_retried() {
    let origin = Origin {
        status: StatusCode::NOT_FOUND,
        ..Origin::serving(IMAGE_BYTES)
    };
    let url = spawn_origin(origin.clone()).await;

    let response = ResilientTransport::new()
        .unwrap()
        .fetch(&url, &options(3))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(origin.hits(), 1);
}

#[tokio::test]
async fn test_slow_attempts_time_out_and_retry() {
    let router = Router::new().route(
        "/slow",
        get(|| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            "late"
        }),
    );
    let url = format!("{}/slow", spawn_server(router).await);

    let start = Instant::now();
    let err = ResilientTransport::new()
        .unwrap()
        .fetch(
            &url,
            &FetchOptions {
                timeout: Duration::from_millis(100),
                ..options(1)
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, LumenError::FetchFailed { status: None, .. }));
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_cancel_aborts_pending_backoff() {
    let origin = Origin {
        failures: usize::MAX,
        ..Origin::serving(IMAGE_BYTES)
    };
    let url = spawn_origin(origin.clone()).await;

    let cancel = CancelSignal::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel("client went away");
    });

    let start = Instant::now();
    let err = ResilientTransport::new()
        .unwrap()
        .fetch(
            &url,
            &FetchOptions {
                max_retries: 5,
                retry_delay: Duration::from_secs(10),
                timeout: Duration::from_secs(2),
                cancel: Some(cancel),
            },
        )
        .await
        .unwrap_err();

    assert_eq!(err, LumenError::cancelled("client went away"));
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(origin.hits(), 1);
}
