//! 授权请求验证

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use super::{
    AuthorizeError, AuthorizeRequest, Prompt, ResponseMode, ResponseType,
    ValidatedAuthorizeRequest,
};
use crate::client::{Client, ClientStore};
use crate::config::{EngineOptions, InputLengthRestrictions, PkceOptions};
use crate::context::CallContext;
use crate::error::Result;
use crate::pkce::{PkceCodeChallenge, PkceMethod};
use crate::protocol::constants::OPENID;
use crate::protocol::{OAuthError, OAuthErrorCode, parse_scopes};
use crate::resources::ResourceValidator;

/// 请求对象（`request` 参数）验证器
#[async_trait]
pub trait RequestObjectValidator: Send + Sync {
    /// 验证请求对象的签名并返回其中的参数
    ///
    /// 请求对象无效时返回 `Ok(None)`
    async fn validate(
        &self,
        ctx: &CallContext,
        client: &Client,
        request_object: &str,
    ) -> Result<Option<HashMap<String, String>>>;
}

/// redirect URI 验证通过之后，错误可以带着这些信息返回给客户端
#[derive(Default)]
struct ErrorTarget {
    client_id: Option<String>,
    redirect_uri: Option<String>,
    response_mode: Option<ResponseMode>,
    state: Option<String>,
}

impl ErrorTarget {
    fn fail(&self, error: OAuthError) -> AuthorizeError {
        warn!(
            client_id = self.client_id.as_deref().unwrap_or(""),
            error = %error.error,
            "authorize request rejected"
        );
        AuthorizeError {
            error,
            client_id: self.client_id.clone(),
            redirect_uri: self.redirect_uri.clone(),
            response_mode: self.response_mode,
            state: self.state.clone(),
            redirectable: self.redirect_uri.is_some(),
        }
    }
}

/// 授权请求验证器
#[derive(Clone)]
pub struct AuthorizeRequestValidator {
    clients: Arc<dyn ClientStore>,
    resources: ResourceValidator,
    request_objects: Option<Arc<dyn RequestObjectValidator>>,
    lengths: InputLengthRestrictions,
    pkce: PkceOptions,
}

impl AuthorizeRequestValidator {
    /// 创建验证器
    pub fn new(
        clients: Arc<dyn ClientStore>,
        resources: ResourceValidator,
        options: &EngineOptions,
    ) -> Self {
        Self {
            clients,
            resources,
            request_objects: None,
            lengths: options.input_lengths.clone(),
            pkce: options.pkce.clone(),
        }
    }

    /// 启用请求对象支持
    pub fn with_request_object_validator(
        mut self,
        validator: Arc<dyn RequestObjectValidator>,
    ) -> Self {
        self.request_objects = Some(validator);
        self
    }

    /// 验证授权请求，没有任何副作用
    #[instrument(skip_all, fields(client_id = request.client_id.as_deref().unwrap_or("")))]
    pub async fn validate(
        &self,
        ctx: &CallContext,
        mut request: AuthorizeRequest,
    ) -> std::result::Result<ValidatedAuthorizeRequest, AuthorizeError> {
        let mut target = ErrorTarget::default();

        let client_id = match request.client_id.as_deref() {
            Some(id) if !id.is_empty() && id.len() <= self.lengths.client_id => id.to_string(),
            _ => return Err(target.fail(OAuthError::invalid_request("Invalid client_id"))),
        };
        target.client_id = Some(client_id.clone());

        let client = match ctx
            .run(self.clients.find_enabled_client_by_id(ctx, &client_id))
            .await
        {
            Ok(Some(client)) => client,
            Ok(None) => {
                return Err(target.fail(OAuthError::unauthorized_client(
                    "Unknown or disabled client",
                )));
            }
            Err(err) => return Err(target.fail(err.into())),
        };

        if let Some(request_object) = request.request.clone() {
            self.apply_request_object(ctx, &client, &mut request, &request_object)
                .await
                .map_err(|e| target.fail(e))?;
        }

        let redirect_uri = match request.redirect_uri.as_deref() {
            None | Some("") => {
                return Err(target.fail(OAuthError::invalid_request("redirect_uri is missing")));
            }
            Some(uri) if uri.len() > self.lengths.redirect_uri => {
                return Err(target.fail(OAuthError::invalid_request("redirect_uri is too long")));
            }
            Some(uri) if !client.allows_redirect_uri(uri) => {
                return Err(target.fail(OAuthError::unauthorized_client("Invalid redirect_uri")));
            }
            Some(uri) => uri.to_string(),
        };
        target.redirect_uri = Some(redirect_uri.clone());

        let state = match request.state.clone() {
            Some(state) if state.len() > self.lengths.state => {
                return Err(target.fail(OAuthError::invalid_request("state is too long")));
            }
            state => state.filter(|s| !s.is_empty()),
        };
        target.state = state.clone();

        let response_type = match request.response_type.as_deref().and_then(ResponseType::parse) {
            Some(response_type) => response_type,
            None => {
                return Err(target.fail(
                    OAuthError::new(OAuthErrorCode::UnsupportedResponseType)
                        .with_description("Invalid response_type"),
                ));
            }
        };
        target.response_mode = Some(response_type.default_response_mode());

        if !client.allows_grant_type(&response_type.grant_type()) {
            return Err(target.fail(OAuthError::unauthorized_client(
                "Invalid grant type for client",
            )));
        }
        if response_type.includes_access_token() && !client.allow_access_tokens_via_browser {
            return Err(target.fail(OAuthError::unauthorized_client(
                "Client is not allowed to receive access tokens via browser",
            )));
        }

        let response_mode = match request.response_mode.as_deref() {
            None | Some("") => response_type.default_response_mode(),
            Some(mode) => ResponseMode::parse(mode).ok_or_else(|| {
                target.fail(OAuthError::invalid_request("Unsupported response_mode"))
            })?,
        };
        if response_mode == ResponseMode::Query && response_type.returns_tokens() {
            return Err(target.fail(OAuthError::invalid_request(
                "Invalid response_mode for response_type",
            )));
        }
        target.response_mode = Some(response_mode);

        let code_challenge = if response_type.includes_code() {
            self.validate_pkce(&client, &request)
                .map_err(|e| target.fail(e))?
        } else {
            None
        };

        let scope = match request.scope.as_deref().map(str::trim) {
            None | Some("") => {
                return Err(target.fail(OAuthError::invalid_request("scope is missing")));
            }
            Some(scope) if scope.len() > self.lengths.scope => {
                return Err(target.fail(OAuthError::invalid_request("scope is too long")));
            }
            Some(scope) => scope,
        };
        let requested_scopes = parse_scopes(scope);
        let is_openid = requested_scopes.iter().any(|s| s == OPENID);

        if response_type.includes_id_token() && !is_openid {
            return Err(target.fail(OAuthError::invalid_scope(
                "id_token response requires the openid scope",
            )));
        }

        let validation = self
            .resources
            .validate(ctx, &client, &requested_scopes)
            .await
            .map_err(|e| target.fail(e.into()))?;
        if !validation.succeeded() {
            return Err(target.fail(OAuthError::invalid_scope(format!(
                "Invalid scopes: {}",
                validation.invalid_scopes.join(" ")
            ))));
        }
        if validation.resources.is_empty() {
            return Err(target.fail(OAuthError::invalid_request("No valid scopes requested")));
        }
        if response_type == ResponseType::Token && validation.resources.has_identity_scopes() {
            return Err(target.fail(OAuthError::invalid_scope(
                "token response type only supports resource scopes",
            )));
        }

        let nonce = match request.nonce.clone() {
            Some(nonce) if nonce.len() > self.lengths.nonce => {
                return Err(target.fail(OAuthError::invalid_request("nonce is too long")));
            }
            nonce => nonce.filter(|n| !n.is_empty()),
        };
        if nonce.is_none() && is_openid && response_type != ResponseType::Code {
            return Err(target.fail(OAuthError::invalid_request("nonce is required")));
        }

        let prompt = parse_prompt(request.prompt.as_deref()).map_err(|e| target.fail(e))?;

        let max_age = match request.max_age.as_deref() {
            None | Some("") => None,
            Some(value) => match value.parse::<i64>() {
                Ok(age) if age >= 0 => Some(age),
                _ => return Err(target.fail(OAuthError::invalid_request("Invalid max_age"))),
            },
        };

        let login_hint = self
            .bounded(request.login_hint.clone(), self.lengths.login_hint, "login_hint")
            .map_err(|e| target.fail(e))?;
        let acr_values = self
            .bounded(request.acr_values.clone(), self.lengths.acr_values, "acr_values")
            .map_err(|e| target.fail(e))?
            .map(|v| v.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        let ui_locales = self
            .bounded(request.ui_locales.clone(), self.lengths.ui_locales, "ui_locales")
            .map_err(|e| target.fail(e))?;

        debug!(response_type = %response_type, "authorize request validated");

        Ok(ValidatedAuthorizeRequest {
            client,
            raw: request,
            response_type,
            response_mode,
            redirect_uri,
            requested_scopes,
            resources: validation.resources,
            state,
            nonce,
            code_challenge,
            prompt,
            max_age,
            login_hint,
            acr_values,
            ui_locales,
            is_openid,
        })
    }

    async fn apply_request_object(
        &self,
        ctx: &CallContext,
        client: &Client,
        request: &mut AuthorizeRequest,
        request_object: &str,
    ) -> std::result::Result<(), OAuthError> {
        let Some(validator) = &self.request_objects else {
            return Err(OAuthError::new(OAuthErrorCode::RequestNotSupported)
                .with_description("Request objects are not supported"));
        };
        if !client.allow_request_object {
            return Err(OAuthError::new(OAuthErrorCode::RequestNotSupported)
                .with_description("Client is not allowed to use request objects"));
        }
        if request_object.len() > self.lengths.jwt {
            return Err(OAuthError::invalid_request("Request object is too long"));
        }

        let claims = ctx
            .run(validator.validate(ctx, client, request_object))
            .await?
            .ok_or_else(|| {
                OAuthError::new(OAuthErrorCode::InvalidRequestObject)
                    .with_description("Invalid request object")
            })?;

        if claims
            .get("client_id")
            .is_some_and(|id| *id != client.client_id)
        {
            return Err(OAuthError::new(OAuthErrorCode::InvalidRequestObject)
                .with_description("client_id in request object does not match"));
        }

        request.merge(claims);
        Ok(())
    }

    fn validate_pkce(
        &self,
        client: &Client,
        request: &AuthorizeRequest,
    ) -> std::result::Result<Option<PkceCodeChallenge>, OAuthError> {
        let Some(challenge) = request.code_challenge.as_deref().filter(|c| !c.is_empty()) else {
            if client.require_pkce {
                return Err(OAuthError::invalid_request("code_challenge is required"));
            }
            return Ok(None);
        };

        if challenge.len() < self.lengths.code_challenge_min
            || challenge.len() > self.lengths.code_challenge_max
        {
            return Err(OAuthError::invalid_request("Invalid code_challenge length"));
        }

        let method = match request.code_challenge_method.as_deref() {
            None | Some("") => PkceMethod::Plain,
            Some(method) => method
                .parse::<PkceMethod>()
                .map_err(|_| OAuthError::invalid_request("Transform algorithm not supported"))?,
        };

        if method == PkceMethod::Plain
            && !(client.allow_plain_text_pkce && self.pkce.allow_plain_globally)
        {
            return Err(OAuthError::invalid_request(
                "code_challenge_method of plain is not allowed",
            ));
        }

        Ok(Some(PkceCodeChallenge::new(challenge, method)))
    }

    fn bounded(
        &self,
        value: Option<String>,
        limit: usize,
        name: &str,
    ) -> std::result::Result<Option<String>, OAuthError> {
        match value {
            Some(v) if v.len() > limit => {
                Err(OAuthError::invalid_request(format!("{} is too long", name)))
            }
            v => Ok(v.filter(|s| !s.is_empty())),
        }
    }
}

fn parse_prompt(value: Option<&str>) -> std::result::Result<Vec<Prompt>, OAuthError> {
    let mut prompts = Vec::new();
    for part in value.unwrap_or_default().split_whitespace() {
        match Prompt::parse(part) {
            Some(prompt) if !prompts.contains(&prompt) => prompts.push(prompt),
            Some(_) => {}
            None => debug!(prompt = part, "ignoring unsupported prompt value"),
        }
    }
    if prompts.contains(&Prompt::None) && prompts.len() > 1 {
        return Err(OAuthError::invalid_request(
            "prompt=none cannot be combined with other values",
        ));
    }
    Ok(prompts)
}

impl std::fmt::Debug for AuthorizeRequestValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizeRequestValidator")
            .field("request_objects", &self.request_objects.is_some())
            .field("lengths", &self.lengths)
            .finish_non_exhaustive()
    }
}
