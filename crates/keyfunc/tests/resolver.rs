//! Key resolver behaviour against an in-memory fetcher

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{config, document, oct_jwk, rsa_jwk, FakeFetcher};
use futures::future::join_all;
use keyfunc::jsonwebtoken::Algorithm;
use keyfunc::{
    CancellationToken, Config, ConfigError, Error, KeyRequest, KeyResolver, RefreshError,
    ResolveError,
};

fn request(kid: &str, alg: Algorithm) -> KeyRequest {
    KeyRequest::new(alg).with_kid(kid)
}

async fn start(config: &Config, fetcher: &Arc<FakeFetcher>) -> KeyResolver {
    KeyResolver::start_with_fetcher(config, fetcher.clone(), CancellationToken::new())
        .await
        .expect("resolver starts")
}

#[tokio::test]
async fn test_resolves_known_kid() {
    let fetcher = FakeFetcher::serving(document(vec![rsa_jwk("k1", Some("RS256"))]));
    let resolver = start(&config(), &fetcher).await;

    let key = resolver
        .resolve(&request("k1", Algorithm::RS256))
        .await
        .expect("k1 resolves");

    assert_eq!(key.kid(), Some("k1"));
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn test_unknown_kid_without_refresh_on_miss() {
    let fetcher = FakeFetcher::serving(document(vec![rsa_jwk("k1", None)]));
    let resolver = start(&config(), &fetcher).await;

    let err = resolver
        .resolve(&request("k2", Algorithm::RS256))
        .await
        .expect_err("k2 is unknown");

    match err {
        ResolveError::UnknownKey { kid, alg, refresh } => {
            assert_eq!(kid.as_deref(), Some("k2"));
            assert_eq!(alg, Algorithm::RS256);
            assert!(refresh.is_none());
        }
        other => panic!("Expected UnknownKey, got {other:?}"),
    }
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn test_empty_document() {
    let fetcher = FakeFetcher::serving(document(vec![]));
    let resolver = KeyResolver::start_with_fetcher(&config(), fetcher, CancellationToken::new())
        .await
        .expect("empty key set is valid");

    assert!(resolver.current().is_initialized());
    assert!(resolver.current().is_empty());

    assert!(matches!(
        resolver.resolve(&request("k1", Algorithm::RS256)).await,
        Err(ResolveError::UnknownKey { .. })
    ));
    assert!(matches!(
        resolver.resolve(&KeyRequest::new(Algorithm::RS256)).await,
        Err(ResolveError::Ambiguous { candidates: 0, .. })
    ));
}

#[tokio::test]
async fn test_kid_less_request() {
    let fetcher = FakeFetcher::serving(document(vec![rsa_jwk("only", Some("RS256"))]));
    let resolver = start(&config(), &fetcher).await;

    let key = resolver
        .resolve(&KeyRequest::new(Algorithm::RS256))
        .await
        .expect("single key is used");
    assert_eq!(key.kid(), Some("only"));

    // the single-key shortcut still checks the algorithm
    assert!(matches!(
        resolver.resolve(&KeyRequest::new(Algorithm::HS256)).await,
        Err(ResolveError::AlgorithmMismatch { .. })
    ));

    fetcher.serve(document(vec![rsa_jwk("a", None), rsa_jwk("b", None)]));
    resolver.refresh_now().await.expect("refresh succeeds");

    assert!(matches!(
        resolver.resolve(&KeyRequest::new(Algorithm::RS256)).await,
        Err(ResolveError::Ambiguous { candidates: 2, .. })
    ));
}

#[tokio::test]
async fn test_algorithm_mismatch() {
    let fetcher = FakeFetcher::serving(document(vec![rsa_jwk("k1", Some("RS256"))]));
    let resolver = start(&config(), &fetcher).await;

    let err = resolver
        .resolve(&request("k1", Algorithm::HS256))
        .await
        .expect_err("HS256 must not use an RSA key");

    match err {
        ResolveError::AlgorithmMismatch {
            kid,
            declared,
            permitted,
        } => {
            assert_eq!(kid.as_deref(), Some("k1"));
            assert_eq!(declared, Algorithm::HS256);
            assert_eq!(permitted, "RS256");
        }
        other => panic!("Expected AlgorithmMismatch, got {other:?}"),
    }
}

#[tokio::test]
async fn test_key_type_guards_algorithm_without_alg() {
    let fetcher = FakeFetcher::serving(document(vec![rsa_jwk("k1", None)]));
    let resolver = start(&config(), &fetcher).await;

    assert!(resolver.resolve(&request("k1", Algorithm::PS256)).await.is_ok());
    assert!(matches!(
        resolver.resolve(&request("k1", Algorithm::HS256)).await,
        Err(ResolveError::AlgorithmMismatch { .. })
    ));
    assert!(matches!(
        resolver.resolve(&request("k1", Algorithm::ES256)).await,
        Err(ResolveError::AlgorithmMismatch { .. })
    ));
}

#[tokio::test]
async fn test_encryption_key_is_unusable() {
    let mut enc = rsa_jwk("enc", None);
    enc["use"] = serde_json::json!("enc");
    let fetcher = FakeFetcher::serving(document(vec![enc]));
    let resolver = start(&config(), &fetcher).await;

    match resolver.resolve(&request("enc", Algorithm::RS256)).await {
        Err(ResolveError::UnusableKey { kid, key_use }) => {
            assert_eq!(kid.as_deref(), Some("enc"));
            assert_eq!(key_use, "enc");
        }
        other => panic!("Expected UnusableKey, got {other:?}"),
    }
}

#[tokio::test]
async fn test_refresh_on_miss_fetches_once() {
    let fetcher = FakeFetcher::serving(document(vec![rsa_jwk("k1", None)]));
    let config = Config {
        refresh_on_unknown_kid: true,
        ..config()
    };
    let resolver = start(&config, &fetcher).await;

    fetcher.serve(document(vec![rsa_jwk("k1", None), rsa_jwk("k2", None)]));

    let key = resolver
        .resolve(&request("k2", Algorithm::RS256))
        .await
        .expect("k2 found after refresh");
    assert_eq!(key.kid(), Some("k2"));
    assert_eq!(fetcher.calls(), 2);

    // a second miss inside the cooldown does not fetch again
    match resolver.resolve(&request("k3", Algorithm::RS256)).await {
        Err(ResolveError::UnknownKey {
            refresh: Some(RefreshError::RateLimited),
            ..
        }) => {}
        other => panic!("Expected rate limited UnknownKey, got {other:?}"),
    }
    assert_eq!(fetcher.calls(), 2);
}

#[tokio::test]
async fn test_concurrent_misses_share_one_refresh() {
    let fetcher = FakeFetcher::serving(document(vec![rsa_jwk("k1", None)]));
    let config = Config {
        refresh_on_unknown_kid: true,
        ..config()
    };
    let resolver = start(&config, &fetcher).await;

    fetcher.serve(document(vec![rsa_jwk("k1", None), rsa_jwk("k2", None)]));
    fetcher.set_delay(Duration::from_millis(100));

    let results = join_all((0..10).map(|_| {
        let resolver = resolver.clone();
        async move { resolver.resolve(&request("k2", Algorithm::RS256)).await }
    }))
    .await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(fetcher.calls(), 2);
    assert_eq!(resolver.refresh_count(), 2);
}

#[tokio::test]
async fn test_miss_refresh_failure_is_reported() {
    let fetcher = FakeFetcher::serving(document(vec![rsa_jwk("k1", None)]));
    let config = Config {
        refresh_on_unknown_kid: true,
        ..config()
    };
    let resolver = start(&config, &fetcher).await;

    fetcher.fail();

    match resolver.resolve(&request("k2", Algorithm::RS256)).await {
        Err(ResolveError::UnknownKey {
            refresh: Some(RefreshError::Fetch(err)),
            ..
        }) => assert_eq!(err.url(), common::SOURCE),
        other => panic!("Expected UnknownKey caused by a fetch error, got {other:?}"),
    }

    // the last good snapshot is still served
    assert!(resolver.resolve(&request("k1", Algorithm::RS256)).await.is_ok());
}

#[tokio::test]
async fn test_cancellation_wakes_waiting_resolve() {
    let fetcher = FakeFetcher::serving(document(vec![rsa_jwk("k1", None)]));
    let config = Config {
        refresh_on_unknown_kid: true,
        ..config()
    };
    let cancel = CancellationToken::new();
    let resolver = KeyResolver::start_with_fetcher(&config, fetcher.clone(), cancel.clone())
        .await
        .expect("resolver starts");

    fetcher.hang();

    let pending = tokio::spawn({
        let resolver = resolver.clone();
        async move { resolver.resolve(&request("k2", Algorithm::RS256)).await }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_secs(1), pending)
        .await
        .expect("resolve returns promptly")
        .expect("task does not panic");

    assert!(matches!(
        result,
        Err(ResolveError::UnknownKey {
            refresh: Some(RefreshError::Cancelled),
            ..
        })
    ));

    tokio::time::timeout(Duration::from_secs(1), resolver.stopped())
        .await
        .expect("background task exits");

    // resolution keeps working from the installed snapshot
    assert!(resolver.resolve(&request("k1", Algorithm::RS256)).await.is_ok());
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let fetcher = FakeFetcher::serving(document(vec![rsa_jwk("k1", None)]));
    let cancel = CancellationToken::new();
    let resolver = KeyResolver::start_with_fetcher(&config(), fetcher, cancel.clone())
        .await
        .expect("resolver starts");

    resolver.stop();
    resolver.stop();
    resolver.stopped().await;
    resolver.stopped().await;

    // the caller's token is not cancelled by stopping the resolver
    assert!(!cancel.is_cancelled());
    assert!(matches!(
        resolver.refresh_now().await,
        Err(Error::Refresh(RefreshError::Cancelled))
    ));
    assert!(resolver.resolve(&request("k1", Algorithm::RS256)).await.is_ok());
}

#[tokio::test]
async fn test_initial_fetch_failure() {
    let fetcher = FakeFetcher::failing();

    let err =
        KeyResolver::start_with_fetcher(&config(), fetcher.clone(), CancellationToken::new())
            .await
            .expect_err("first fetch is required");
    assert!(matches!(err, Error::InitialFetch(RefreshError::Fetch(_))));

    let lenient = Config {
        require_initial_fetch: false,
        ..config()
    };
    let resolver = start(&lenient, &fetcher).await;
    assert!(!resolver.current().is_initialized());
    assert_eq!(resolver.refresh_state().consecutive_failures, 1);

    fetcher.serve(document(vec![rsa_jwk("k1", None)]));
    resolver.refresh_now().await.expect("refresh succeeds");
    assert!(resolver.resolve(&request("k1", Algorithm::RS256)).await.is_ok());
    assert_eq!(resolver.refresh_state().consecutive_failures, 0);
}

#[tokio::test]
async fn test_invalid_config_starts_nothing() {
    let fetcher = FakeFetcher::failing();
    let err = KeyResolver::start_with_fetcher(
        &Config::default(),
        fetcher.clone(),
        CancellationToken::new(),
    )
    .await
    .expect_err("no sources");

    assert!(matches!(err, Error::Config(ConfigError::EmptySourceList)));
    assert_eq!(fetcher.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_background_refresh_keeps_last_good_snapshot() {
    let fetcher = FakeFetcher::serving(document(vec![rsa_jwk("k1", None)]));
    let config = Config {
        refresh_interval_secs: 60,
        ..config()
    };
    let resolver = start(&config, &fetcher).await;

    fetcher.fail();
    tokio::time::sleep(Duration::from_secs(61)).await;

    assert_eq!(fetcher.calls(), 2);
    assert!(resolver.resolve(&request("k1", Algorithm::RS256)).await.is_ok());
    let state = resolver.refresh_state();
    assert_eq!(state.consecutive_failures, 1);
    assert!(state.sources[0].last_error.is_some());
    assert!(state.sources[0].last_success.is_some());

    // retried after the first backoff step rather than a full interval
    fetcher.serve(document(vec![rsa_jwk("k2", None)]));
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(fetcher.calls(), 3);
    assert!(resolver.current().get("k2").is_some());
    assert_eq!(resolver.refresh_state().consecutive_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn test_timer_tick_joins_inflight_refresh() {
    let fetcher = FakeFetcher::serving(document(vec![rsa_jwk("k1", None)]));
    let config = Config {
        refresh_interval_secs: 60,
        fetch_timeout_secs: 30,
        ..config()
    };
    let resolver = start(&config, &fetcher).await;
    assert_eq!(fetcher.calls(), 1);

    // an on-demand refresh started at t=55 is still running at the t=60 tick
    fetcher.set_delay(Duration::from_secs(10));
    tokio::time::sleep(Duration::from_secs(55)).await;
    let on_demand = tokio::spawn({
        let resolver = resolver.clone();
        async move { resolver.refresh_now().await }
    });

    tokio::time::sleep(Duration::from_secs(11)).await;

    assert!(on_demand.await.expect("task does not panic").is_ok());
    assert_eq!(fetcher.calls(), 2);
    assert_eq!(resolver.refresh_count(), 2);

    // the next tick counts from the end of the shared refresh at t=65
    tokio::time::sleep(Duration::from_secs(58)).await;
    assert_eq!(fetcher.calls(), 2);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(fetcher.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_dropping_last_handle_stops_refresh() {
    let fetcher = FakeFetcher::serving(document(vec![rsa_jwk("k1", None)]));
    let config = Config {
        refresh_interval_secs: 60,
        ..config()
    };
    let resolver = start(&config, &fetcher).await;

    let clone = resolver.clone();
    drop(resolver);
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(fetcher.calls(), 2);

    drop(clone);
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(fetcher.calls(), 2);
}

#[tokio::test]
async fn test_candidates_and_export() {
    let mut enc = rsa_jwk("enc", None);
    enc["use"] = serde_json::json!("enc");
    let fetcher = FakeFetcher::serving(document(vec![
        rsa_jwk("rs", Some("RS256")),
        rsa_jwk("ps", Some("PS256")),
        oct_jwk("hs"),
        enc,
    ]));
    let resolver = start(&config(), &fetcher).await;

    let candidates = resolver.candidates(&KeyRequest::new(Algorithm::RS256));
    let kids: Vec<_> = candidates.iter().filter_map(|key| key.kid()).collect();
    assert_eq!(kids, vec!["rs"]);

    assert!(resolver.candidates(&request("ps", Algorithm::RS256)).is_empty());
    assert_eq!(resolver.candidates(&request("hs", Algorithm::HS256)).len(), 1);

    let all = resolver.jwks_json().expect("serializable");
    let public = resolver.public_jwks_json().expect("serializable");
    assert!(all.contains("\"hs\""));
    assert!(!public.contains("\"hs\""));
    assert!(public.contains("\"rs\""));
}

#[tokio::test]
async fn test_decoding_key_for_token() {
    let fetcher = FakeFetcher::serving(document(vec![rsa_jwk("k1", Some("RS256"))]));
    let resolver = start(&config(), &fetcher).await;

    // {"alg":"RS256","kid":"k1","typ":"JWT"}.{"sub":"1"}.sig
    let token = "eyJhbGciOiJSUzI1NiIsImtpZCI6ImsxIiwidHlwIjoiSldUIn0.eyJzdWIiOiIxIn0.c2ln";
    assert!(resolver.decoding_key_for(token).await.is_ok());

    assert!(matches!(
        resolver.decoding_key_for("garbage").await,
        Err(Error::Header(_))
    ));
}
