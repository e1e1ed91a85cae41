mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use apns_dispatch::{
    ApnsResponse, ClientConfig, ConnectionError, DispatchResult, ErrorReason, Notification,
};
use common::{alert, client, ok, reject, token, FakeConnector, TOPIC};
use futures::StreamExt;
use uuid::Uuid;

#[tokio::test]
async fn test_batch_is_multiplexed_over_one_connection() {
    let connector = FakeConnector::new(|_| async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        ok()
    });
    let client = client(&connector, ClientConfig::default());

    let notifications: Vec<Notification> = (0..20).map(|n| alert(&token(n))).collect();
    let started = Instant::now();
    let results = client.send_batch(notifications, TOPIC).await.unwrap();

    assert_eq!(results.len(), 20);
    assert_eq!(results.success_count(), 20);
    assert_eq!(connector.stats.connects(), 1);
    assert_eq!(connector.stats.max_active(), 20);
    // Sequential sends would take at least a second
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[tokio::test]
async fn test_stream_limit_queues_excess_requests() {
    let connector = FakeConnector::new(|_| async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        ok()
    });
    let client = client(
        &connector,
        ClientConfig::default().with_max_concurrent_streams(2),
    );

    let notifications: Vec<Notification> = (0..6).map(|n| alert(&token(n))).collect();
    let results = client.send_batch(notifications, TOPIC).await.unwrap();

    assert_eq!(results.success_count(), 6);
    assert_eq!(connector.stats.max_active(), 2);
}

#[tokio::test]
async fn test_mixed_results_are_correlated_to_tokens() {
    let bad = token(1);
    let gone = token(2);
    let connector = {
        let (bad, gone) = (bad.clone(), gone.clone());
        FakeConnector::new(move |request| {
            let response = if request.device_token.as_str() == bad {
                reject(400, r#"{"reason":"BadDeviceToken"}"#)
            } else if request.device_token.as_str() == gone {
                reject(410, r#"{"reason":"Unregistered","timestamp":1700000000}"#)
            } else {
                ok()
            };
            async move { response }
        })
    };
    let client = client(&connector, ClientConfig::default());

    let tokens = [token(0), bad.clone(), gone.clone(), token(3)];
    let notifications = tokens.iter().map(|t| alert(t)).collect();
    let results = client.send_batch(notifications, TOPIC).await.unwrap();

    assert_eq!(results.len(), 4);
    assert!(results.get(&tokens[0]).unwrap().is_success());
    assert!(results.get(&tokens[3]).unwrap().is_success());
    assert_eq!(
        results.get(&bad),
        Some(&DispatchResult::Failure {
            status: 400,
            reason: ErrorReason::BadDeviceToken,
            timestamp: None,
        })
    );
    assert_eq!(
        results.get(&gone),
        Some(&DispatchResult::Failure {
            status: 410,
            reason: ErrorReason::Unregistered,
            timestamp: Some(1_700_000_000),
        })
    );
}

#[tokio::test]
async fn test_connection_closed_mid_batch_fails_pending_requests() {
    let first = token(0);
    let second = token(1);
    let connector = {
        let (first, second) = (first.clone(), second.clone());
        FakeConnector::new(move |request| {
            let device_token = request.device_token.to_string();
            let (first, second) = (first.clone(), second.clone());
            async move {
                if device_token == first {
                    ok()
                } else if device_token == second {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Err(ConnectionError::Closed("GOAWAY".into()))
                } else {
                    // Would hang forever if the dead connection did not wake it
                    futures::future::pending().await
                }
            }
        })
    };
    let client = client(&connector, ClientConfig::default());

    let notifications = vec![alert(&first), alert(&second), alert(&token(2))];
    let results = tokio::time::timeout(
        Duration::from_secs(5),
        client.send_batch(notifications, TOPIC),
    )
    .await
    .expect("batch must not hang on a dead connection")
    .unwrap();

    assert_eq!(results.len(), 3);
    assert!(results.get(&first).unwrap().is_success());
    for device_token in [second, token(2)] {
        assert!(matches!(
            results.get(&device_token),
            Some(DispatchResult::ConnectionError { .. })
        ));
    }
    assert_eq!(client.connections().connection_count().await, 0);
}

#[tokio::test]
async fn test_duplicate_tokens_each_get_a_result() {
    let connector = FakeConnector::new(|request| async move {
        let mut response = ApnsResponse::new(200, Vec::new());
        response.apns_id = request
            .headers
            .get("apns-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Ok(response)
    });
    let client = client(&connector, ClientConfig::default());

    let device_token = token(7);
    let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
    let notifications = ids
        .iter()
        .map(|id| alert(&device_token).with_apns_id(*id))
        .collect();
    let results = client.send_batch(notifications, TOPIC).await.unwrap();

    assert_eq!(results.len(), 3);
    assert_eq!(connector.stats.calls(), 3);
    assert_eq!(results.by_token()[&device_token].len(), 3);
    for (item, id) in results.iter().zip(&ids) {
        assert_eq!(
            item.result,
            DispatchResult::Success {
                apns_id: Some(id.hyphenated().to_string())
            }
        );
    }
}

#[tokio::test]
async fn test_empty_batch_returns_no_results() {
    let connector = FakeConnector::new(|_| async { ok() });
    let client = client(&connector, ClientConfig::default());

    let results = client.send_batch(Vec::new(), TOPIC).await.unwrap();
    assert!(results.is_empty());
    assert_eq!(connector.stats.connects(), 0);
}

#[tokio::test]
async fn test_cancelled_batch_leaves_connection_consistent() {
    let slow = token(9);
    let connector = {
        let slow = slow.clone();
        FakeConnector::new(move |request| {
            let hang = request.device_token.as_str() == slow;
            async move {
                if hang {
                    futures::future::pending::<()>().await;
                }
                ok()
            }
        })
    };
    let client = client(&connector, ClientConfig::default());

    let cancelled = tokio::time::timeout(
        Duration::from_millis(50),
        client.send_batch(vec![alert(&token(0)), alert(&slow)], TOPIC),
    )
    .await;
    assert!(cancelled.is_err());

    let connection = client
        .connections()
        .get_connection(&client.target(), client.credentials())
        .await
        .unwrap();
    assert!(connection.is_alive());
    assert_eq!(connection.in_flight(), 0);
    assert_eq!(connection.available_streams(), connection.max_streams());

    let results = client
        .send_batch(vec![alert(&token(1)), alert(&token(2))], TOPIC)
        .await
        .unwrap();
    assert_eq!(results.success_count(), 2);
    assert_eq!(connector.stats.connects(), 1);
}

#[tokio::test]
async fn test_slow_request_times_out_without_stalling_batch() {
    let slow = token(5);
    let connector = {
        let slow = slow.clone();
        FakeConnector::new(move |request| {
            let is_slow = request.device_token.as_str() == slow;
            async move {
                if is_slow {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                }
                ok()
            }
        })
    };
    let config = ClientConfig::default().with_request_timeout(Duration::from_millis(100));
    let client = client(&connector, config);

    let started = Instant::now();
    let results = client
        .send_batch(vec![alert(&token(0)), alert(&slow), alert(&token(1))], TOPIC)
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(results.success_count(), 2);
    assert!(matches!(
        results.get(&slow),
        Some(DispatchResult::ConnectionError { cause }) if cause.contains("timed out")
    ));

    // A timeout is not fatal: the connection is reused
    client.send_one(alert(&token(2)), TOPIC).await.unwrap();
    assert_eq!(connector.stats.connects(), 1);
}

#[tokio::test]
async fn test_reconnects_after_fatal_error() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let connector = {
        let attempts = attempts.clone();
        FakeConnector::new(move |_| {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err(ConnectionError::Closed("connection reset".into()))
                } else {
                    ok()
                }
            }
        })
    };
    let client = client(&connector, ClientConfig::default());

    let first = client.send_one(alert(&token(0)), TOPIC).await.unwrap();
    assert!(matches!(first, DispatchResult::ConnectionError { .. }));

    let second = client.send_one(alert(&token(0)), TOPIC).await.unwrap();
    assert!(second.is_success());
    assert_eq!(connector.stats.connects(), 2);
}

#[tokio::test]
async fn test_rejected_provider_token_is_regenerated() {
    let connector = FakeConnector::new(|_| async {
        reject(403, r#"{"reason":"ExpiredProviderToken"}"#)
    });
    let client = client(&connector, ClientConfig::default());

    let result = client.send_one(alert(&token(0)), TOPIC).await.unwrap();
    assert_eq!(result.reason(), Some(&ErrorReason::ExpiredProviderToken));
    assert!(!client.credentials().is_valid());

    client.credentials().auth_context().unwrap();
    assert!(client.credentials().is_valid());
}

#[tokio::test]
async fn test_late_rejection_keeps_regenerated_token() {
    let slow = token(1);
    let connector = {
        let slow = slow.clone();
        FakeConnector::new(move |request| {
            let is_slow = request.device_token.as_str() == slow;
            async move {
                if is_slow {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                reject(403, r#"{"reason":"ExpiredProviderToken"}"#)
            }
        })
    };
    let client = client(&connector, ClientConfig::default());

    let mut stream = client
        .send_batch_stream(vec![alert(&token(0)), alert(&slow)], TOPIC)
        .await
        .unwrap();

    let first = stream.next().await.unwrap();
    assert_eq!(first.index, 0);
    assert!(!client.credentials().is_valid());
    let regenerated = client.credentials().auth_context().unwrap();

    let second = stream.next().await.unwrap();
    assert_eq!(second.result.reason(), Some(&ErrorReason::ExpiredProviderToken));
    assert!(client.credentials().is_valid());
    assert_eq!(client.credentials().auth_context().unwrap(), regenerated);
}

#[tokio::test]
async fn test_stream_yields_results_as_they_complete() {
    let slow = token(3);
    let connector = {
        let slow = slow.clone();
        FakeConnector::new(move |request| {
            let is_slow = request.device_token.as_str() == slow;
            async move {
                if is_slow {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                ok()
            }
        })
    };
    let client = client(&connector, ClientConfig::default());

    let mut stream = client
        .send_batch_stream(vec![alert(&slow), alert(&token(4))], TOPIC)
        .await
        .unwrap();
    assert_eq!(stream.pending(), 2);

    let first = stream.next().await.unwrap();
    assert_eq!(first.index, 1);
    assert_eq!(stream.pending(), 1);

    let second = stream.next().await.unwrap();
    assert_eq!(second.device_token.as_str(), slow);
    assert_eq!(stream.pending(), 0);
    assert!(stream.next().await.is_none());
}
