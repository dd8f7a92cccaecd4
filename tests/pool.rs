use std::time::Duration;

use http::{Method, StatusCode};
use http_body_util::BodyExt;

use valet::conn::mock::MockConnector;
use valet::{Body, Config, Error, Pool};

fn init() {
    let _ = tracing_subscriber::fmt::try_init();
}

fn get() -> http::Request<Body> {
    http::Request::get("http://upstream.test/")
        .body(Body::empty())
        .unwrap()
}

fn request(method: Method, body: Body) -> http::Request<Body> {
    http::Request::builder()
        .method(method)
        .uri("http://upstream.test/")
        .body(body)
        .unwrap()
}

#[tokio::test]
async fn sequential_requests_reuse_one_connection() {
    init();
    let connector = MockConnector::new();
    let mut config = Config::default();
    config.max_connections = 1;
    let pool = Pool::new(connector.clone(), config).unwrap();

    for _ in 0..2 {
        let response = pool.request(get()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        response.into_body().collect().await.unwrap();
    }

    assert_eq!(connector.connects(), 1, "connection should be re-used");
    pool.shutdown().await;
}

#[tokio::test]
async fn request_body_reaches_the_handler() {
    init();
    let connector = MockConnector::new();
    connector.respond_with(|request| http::Response::new(request.into_body()));
    let pool = Pool::new(connector.clone(), Config::default()).unwrap();

    let response = pool
        .request(request(Method::PUT, Body::full("payload")))
        .await
        .unwrap();
    let collected = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(collected, "payload");
    pool.shutdown().await;
}

#[tokio::test]
async fn dial_failure_is_retried_for_idempotent_requests() {
    init();
    let connector = MockConnector::new();
    connector.fail_next_connects(1);
    let pool = Pool::new(connector.clone(), Config::default()).unwrap();

    let response = pool.request(get()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(connector.connects(), 2, "one failed dial plus one retry");
    pool.shutdown().await;
}

#[tokio::test]
async fn retry_budget_exhaustion_surfaces_the_failure() {
    init();
    let connector = MockConnector::new();
    connector.fail_next_connects(3);
    let pool = Pool::new(connector.clone(), Config::default()).unwrap();

    let handle = pool.send_with_retries(get(), 1).await.unwrap();
    assert!(matches!(handle.await, Err(Error::Connect(_))));
    assert_eq!(connector.connects(), 2, "the budget allows a single retry");
    pool.shutdown().await;
}

#[tokio::test]
async fn non_idempotent_requests_are_not_retried() {
    init();
    let connector = MockConnector::new();
    connector.fail_next_connects(1);
    let pool = Pool::new(connector.clone(), Config::default()).unwrap();

    let result = pool.request(request(Method::POST, Body::empty())).await;
    assert!(matches!(result, Err(Error::Connect(_))));
    assert_eq!(connector.connects(), 1);
    pool.shutdown().await;
}

#[tokio::test]
async fn connection_death_mid_exchange_is_retried() {
    init();
    let connector = MockConnector::new();
    connector.fail_next_requests(1);
    let pool = Pool::new(connector.clone(), Config::default()).unwrap();

    let response = pool.request(get()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(connector.connects(), 2, "the retry dials a fresh connection");
    pool.shutdown().await;
}

#[tokio::test]
async fn connection_close_directive_prevents_reuse() {
    init();
    let connector = MockConnector::new();
    connector.respond_with(|_| {
        http::Response::builder()
            .header(http::header::CONNECTION, "close")
            .body(Body::empty())
            .unwrap()
    });
    let mut config = Config::default();
    config.max_connections = 1;
    let pool = Pool::new(connector.clone(), config).unwrap();

    for _ in 0..2 {
        let response = pool.request(get()).await.unwrap();
        response.into_body().collect().await.unwrap();
    }

    assert_eq!(connector.connects(), 2, "each exchange needs a new dial");
    pool.shutdown().await;
}

#[tokio::test]
async fn warm_floor_is_established_without_requests() {
    init();
    let connector = MockConnector::new();
    let mut config = Config::default();
    config.min_connections = 2;
    let pool = Pool::new(connector.clone(), config).unwrap();

    for _ in 0..100 {
        if connector.live() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(connector.connects(), 2);
    assert_eq!(connector.live(), 2);
    pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unsubscribed_response_entity_times_out() {
    init();
    let connector = MockConnector::new();
    connector.respond_with(|_| http::Response::new(Body::full("slow reader")));
    let mut config = Config::default();
    config.max_connections = 1;
    config.response_entity_subscription_timeout = Some(Duration::from_secs(1));
    let pool = Pool::new(connector.clone(), config).unwrap();

    let response = pool.request(get()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Sit on the response without touching its entity until the window
    // has passed.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    tokio::task::yield_now().await;

    let error = response.into_body().collect().await.unwrap_err();
    assert!(
        error.to_string().contains("not subscribed"),
        "unexpected error: {error}"
    );

    // The connection was force-closed; the pool recovers with a new dial.
    let response = pool.request(get()).await.unwrap();
    response.into_body().collect().await.unwrap();
    assert_eq!(connector.connects(), 2);
    pool.shutdown().await;
}

#[tokio::test]
async fn shutdown_abandons_in_flight_requests() {
    init();
    let connector = MockConnector::new();
    connector.stall(true);
    let pool = Pool::new(connector.clone(), Config::default()).unwrap();

    let handle = pool.send(get()).await.unwrap();
    pool.shutdown().await;

    assert!(matches!(handle.await, Err(Error::Shutdown)));
}

#[tokio::test]
async fn dropping_the_handle_lets_in_flight_work_finish() {
    init();
    let connector = MockConnector::new();
    connector.respond_with(|_| http::Response::new(Body::full("still delivered")));
    let pool = Pool::new(connector.clone(), Config::default()).unwrap();

    let handle = pool.send(get()).await.unwrap();
    drop(pool);

    let response = handle.await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let collected = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(collected, "still delivered");
}

#[tokio::test]
async fn concurrent_requests_fan_out_across_slots() {
    init();
    let connector = MockConnector::new();
    connector.stall(true);
    let mut config = Config::default();
    config.max_connections = 2;
    let pool = Pool::new(connector.clone(), config).unwrap();

    // Two stalled requests occupy both slots.
    let first = pool.send(get()).await.unwrap();
    let second = pool.send(get()).await.unwrap();

    for _ in 0..100 {
        if connector.live() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(connector.connects(), 2);

    pool.shutdown().await;
    assert!(matches!(first.await, Err(Error::Shutdown)));
    assert!(matches!(second.await, Err(Error::Shutdown)));
}
