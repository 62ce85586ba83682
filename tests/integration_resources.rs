//! 集成测试：资源与签名算法

mod common;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use common::clients;
use grantrs::config::EngineOptions;
use grantrs::engine::GrantEngine;
use grantrs::error::ConfigError;
use grantrs::issuer::{IdentityTokenRequest, TokenIssuer};
use grantrs::resources::{
    ApiResource, ApiScope, InMemoryResourceStore, find_matching_signing_algorithms,
};
use grantrs::secret::{ClientSecret, ParsedSecret};
use grantrs::token_request::TokenRequestParameters;
use grantrs::{CallContext, Client, Error, GrantType, InMemoryClientStore, InMemoryGrantStore, OAuthErrorCode, Token};

#[test]
fn test_signing_algorithm_intersection() {
    let a = ApiResource::new("a", ["a"]).with_signing_algorithms(&["A", "B"]);
    let b = ApiResource::new("b", ["b"]).with_signing_algorithms(&["A", "D"]);
    let unrestricted = ApiResource::new("c", ["c"]);

    assert_eq!(
        find_matching_signing_algorithms(&[a.clone(), b.clone(), unrestricted.clone()]).unwrap(),
        vec!["A"]
    );
    assert!(find_matching_signing_algorithms(&[unrestricted]).unwrap().is_empty());

    let c = ApiResource::new("c", ["c"]).with_signing_algorithms(&["B"]);
    let err = find_matching_signing_algorithms(&[b, c]).unwrap_err();
    assert!(matches!(
        err,
        Error::Config(ConfigError::NoMatchingSigningAlgorithm(_))
    ));
}

/// 记录收到的签名算法
#[derive(Default)]
struct RecordingIssuer {
    algorithms: Mutex<Vec<Vec<String>>>,
}

#[async_trait]
impl TokenIssuer for RecordingIssuer {
    async fn sign_access_token(
        &self,
        _ctx: &CallContext,
        token: &Token,
        signing_algorithms: &[String],
    ) -> grantrs::Result<String> {
        self.algorithms
            .lock()
            .unwrap()
            .push(signing_algorithms.to_vec());
        Ok(format!("jwt.{}", token.client_id))
    }

    async fn create_identity_token(
        &self,
        _ctx: &CallContext,
        request: &IdentityTokenRequest,
    ) -> grantrs::Result<String> {
        Ok(format!("id.{}", request.subject_id))
    }
}

fn engine(issuer: Arc<RecordingIssuer>) -> GrantEngine {
    let mut clients = clients();
    clients.push(
        Client::builder("multi")
            .secret(ClientSecret::shared("multi-secret"))
            .grant_type(GrantType::ClientCredentials)
            .scopes(["orders", "billing", "ledger"])
            .build()
            .unwrap(),
    );
    let resources = InMemoryResourceStore::new(
        [],
        [
            ApiScope::new("orders"),
            ApiScope::new("billing"),
            ApiScope::new("ledger"),
        ],
        [
            ApiResource::new("orders-api", ["orders"]).with_signing_algorithms(&["RS256", "ES256"]),
            ApiResource::new("billing-api", ["billing"]).with_signing_algorithms(&["RS256", "PS256"]),
            ApiResource::new("ledger-api", ["ledger"]).with_signing_algorithms(&["EdDSA"]),
        ],
    );

    GrantEngine::builder(
        Arc::new(InMemoryClientStore::new(clients)),
        Arc::new(resources),
        Arc::new(InMemoryGrantStore::new()),
        issuer,
    )
    .options(EngineOptions::new().with_issuer("https://auth.example.com"))
    .build()
    .unwrap()
}

/// 签发时使用各资源签名算法的交集，交集为空时失败
#[tokio::test]
async fn test_token_signed_with_common_algorithm() {
    let issuer = Arc::new(RecordingIssuer::default());
    let engine = engine(issuer.clone());
    let ctx = CallContext::new();
    let credentials = ParsedSecret::shared("multi", "multi-secret");

    let params = TokenRequestParameters::from_pairs([
        ("grant_type", "client_credentials"),
        ("scope", "orders billing"),
    ]);
    let response = engine.token(&ctx, &credentials, &params).await.unwrap();
    assert_eq!(response.access_token, "jwt.multi");
    assert_eq!(
        issuer.algorithms.lock().unwrap().last().cloned(),
        Some(vec!["RS256".to_string()])
    );

    let params = TokenRequestParameters::from_pairs([
        ("grant_type", "client_credentials"),
        ("scope", "orders ledger"),
    ]);
    let err = engine.token(&ctx, &credentials, &params).await.unwrap_err();
    assert_eq!(err.error, OAuthErrorCode::ServerError);
}

#[test]
fn test_engine_rejects_invalid_options() {
    let result = GrantEngine::builder(
        Arc::new(InMemoryClientStore::new(clients())),
        Arc::new(InMemoryResourceStore::new([], [], [])),
        Arc::new(InMemoryGrantStore::new()),
        Arc::new(RecordingIssuer::default()),
    )
    .options(EngineOptions::new().with_issuer("  "))
    .build();
    assert!(matches!(result, Err(Error::Config(_))));
}
