//! Shared helpers for keyfunc integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keyfunc::{Config, FetchError, Fetcher, KeySet, Source};
use keyfunc_http::HttpError;
use parking_lot::Mutex;
use serde_json::{json, Value};

pub const SOURCE: &str = "https://idp.example.com/.well-known/jwks.json";

pub const RSA_N: &str = "sXchDaQebHnPiGvyDOAT4saGEUetSyo9MKLOoWFsueri23bOdgWp4Dy1WlUzewbgBHod5pcM9H95GQRV3JDXboIRROSBigeC5yjU1hGzHHyXss8UDprecbAYxknTcQkhslANGRUZmdTOQ5qTRsLAt6BTYuyvVRdhS8exSZEy_c4gs_7svlJJQ4H9_NxsiIoLwAEk7-Q3UXERGYw_75IDrGA84-lA_-Ct4eTlXHBIY2EaV7t7LjJaynVJCpkv4LKjTTAumiGUIuQhrNhZLuF_RJLqHpM2kgWFLU7-VTdL1VbC2tejvcI2BlMkEpk1BzBZI0KQB0GaDWFLN-aEAw3vRw";
pub const OCT_K: &str = "c2VjcmV0LWtleS1tYXRlcmlhbC0xMjMh";

/// RSA verification key, optionally pinned to `alg`
pub fn rsa_jwk(kid: &str, alg: Option<&str>) -> Value {
    let mut jwk = json!({"kid": kid, "kty": "RSA", "n": RSA_N, "e": "AQAB"});
    if let Some(alg) = alg {
        jwk["alg"] = json!(alg);
    }
    jwk
}

/// Symmetric key pinned to HS256
pub fn oct_jwk(kid: &str) -> Value {
    json!({"kid": kid, "kty": "oct", "alg": "HS256", "k": OCT_K})
}

pub fn document(keys: Vec<Value>) -> Value {
    json!({ "keys": keys })
}

/// Config for [`SOURCE`] with on-demand refresh disabled unless set otherwise
pub fn config() -> Config {
    Config {
        refresh_on_unknown_kid: false,
        ..Config::new([SOURCE])
    }
}

/// In-memory [`Fetcher`] serving whatever document it currently holds
#[derive(Debug, Default)]
pub struct FakeFetcher {
    document: Mutex<Option<Value>>,
    delay: Mutex<Duration>,
    hang: AtomicBool,
    calls: AtomicUsize,
}

impl FakeFetcher {
    pub fn serving(document: Value) -> Arc<Self> {
        let fetcher = Self::default();
        fetcher.serve(document);
        Arc::new(fetcher)
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn serve(&self, document: Value) {
        *self.document.lock() = Some(document);
    }

    pub fn fail(&self) {
        self.document.lock().take();
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Make every following fetch never complete
    pub fn hang(&self) {
        self.hang.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for FakeFetcher {
    async fn fetch(&self, source: &Source) -> Result<KeySet, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        let document = self.document.lock().clone();
        match document {
            Some(document) => {
                let body = serde_json::to_vec(&document).map_err(|e| FetchError::Parse {
                    url: source.to_string(),
                    message: e.to_string(),
                })?;
                KeySet::parse(&body, false).map_err(|message| FetchError::Parse {
                    url: source.to_string(),
                    message,
                })
            }
            None => Err(FetchError::Transport {
                url: source.to_string(),
                error: HttpError::Connection("connection refused".to_string()),
            }),
        }
    }
}
