use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use shared::{
    domain::{AuthChange, AuthEvent, Credentials, Metadata, Session},
    error::{ErrorBody, FaultCode, GatewayFault},
    protocol::{
        PasswordGrantRequest, RefreshGrantRequest, Row, SignUpRequest, SignUpResponse,
        TokenResponse, View,
    },
};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    gateway::{AuthGateway, ViewGateway},
    session_store::SessionStore,
};

const AUTH_EVENT_CAPACITY: usize = 64;
/// Sessions this close to expiry are refreshed before being handed out.
const EXPIRY_MARGIN_SECS: i64 = 10;

/// Gateway client for a Supabase-compatible REST service: `auth/v1` for
/// identities and `rest/v1` for view queries.
pub struct RestGateway {
    http: Client,
    base_url: Url,
    api_key: String,
    store: SessionStore,
    session: RwLock<Option<Session>>,
    restored: RwLock<bool>,
    events: broadcast::Sender<AuthChange>,
}

impl RestGateway {
    pub fn new(
        base_url: &str,
        api_key: impl Into<String>,
        store: SessionStore,
    ) -> Result<Self, GatewayFault> {
        Self::with_client(Client::new(), base_url, api_key, store)
    }

    pub fn with_client(
        http: Client,
        base_url: &str,
        api_key: impl Into<String>,
        store: SessionStore,
    ) -> Result<Self, GatewayFault> {
        let base_url = normalize_base_url(base_url)?;
        let (events, _) = broadcast::channel(AUTH_EVENT_CAPACITY);
        Ok(Self {
            http,
            base_url,
            api_key: api_key.into(),
            store,
            session: RwLock::new(None),
            restored: RwLock::new(false),
            events,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, GatewayFault> {
        self.base_url.join(path).map_err(|err| {
            GatewayFault::new(
                FaultCode::Internal,
                format!("invalid gateway endpoint '{path}': {err}"),
            )
        })
    }

    fn authorized(&self, request: RequestBuilder, bearer: &str) -> RequestBuilder {
        request.header("apikey", &self.api_key).bearer_auth(bearer)
    }

    async fn bearer(&self) -> String {
        self.session
            .read()
            .await
            .as_ref()
            .map(|session| session.access_token.clone())
            .unwrap_or_else(|| self.api_key.clone())
    }

    /// Replaces the held session, mirrors it to the store and notifies
    /// subscribers. Persistence failures are logged, never surfaced.
    async fn install_session(&self, event: AuthEvent, session: Option<Session>) {
        {
            let mut guard = self.session.write().await;
            *guard = session.clone();
        }

        let persisted = match &session {
            Some(session) => self.store.save(session).await,
            None => self.store.clear().await,
        };
        if let Err(err) = persisted {
            warn!("gateway: failed to persist session change event={event:?}: {err:#}");
        }

        let _ = self.events.send(AuthChange::new(event, session));
    }

    /// Loads the persisted session into memory on first use. Returns the held
    /// session and whether this call did the restore. Nothing is broadcast
    /// until the caller has checked expiry.
    async fn restore_persisted(&self) -> Result<(Option<Session>, bool), GatewayFault> {
        let mut restored = self.restored.write().await;
        if *restored {
            return Ok((self.session.read().await.clone(), false));
        }

        let persisted = self
            .store
            .load()
            .await
            .map_err(|err| GatewayFault::new(FaultCode::Internal, format!("{err:#}")))?;
        *restored = true;

        let mut held = self.session.write().await;
        if held.is_none() {
            if let Some(session) = &persisted {
                debug!("gateway: restored persisted session user={}", session.user.id);
            }
            *held = persisted;
        }
        Ok((held.clone(), true))
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Session, GatewayFault> {
        let url = self.token_endpoint("refresh_token")?;
        let response = self
            .authorized(self.http.post(url), &self.api_key)
            .json(&RefreshGrantRequest { refresh_token })
            .send()
            .await
            .map_err(transport_fault)?;
        let token: TokenResponse = decode_json(response).await?;
        Ok(token.into_session(Utc::now().timestamp()))
    }

    fn token_endpoint(&self, grant_type: &str) -> Result<Url, GatewayFault> {
        let mut url = self.endpoint("auth/v1/token")?;
        url.query_pairs_mut().append_pair("grant_type", grant_type);
        Ok(url)
    }
}

#[async_trait]
impl AuthGateway for RestGateway {
    async fn current_session(&self) -> Result<Option<Session>, GatewayFault> {
        let (session, freshly_restored) = self.restore_persisted().await?;
        let Some(session) = session else {
            return Ok(None);
        };

        let now = Utc::now().timestamp();
        if !session.is_expired_at(now + EXPIRY_MARGIN_SECS) {
            if freshly_restored {
                let _ = self.events.send(AuthChange::new(
                    AuthEvent::InitialSession,
                    Some(session.clone()),
                ));
            }
            return Ok(Some(session));
        }

        let Some(refresh_token) = session.refresh_token.clone() else {
            info!("gateway: persisted session expired without refresh token");
            self.install_session(AuthEvent::SignedOut, None).await;
            return Ok(None);
        };

        match self.refresh(&refresh_token).await {
            Ok(refreshed) => {
                self.install_session(AuthEvent::TokenRefreshed, Some(refreshed.clone()))
                    .await;
                Ok(Some(refreshed))
            }
            Err(fault) if matches!(fault.code, FaultCode::Unauthorized | FaultCode::Validation) => {
                info!("gateway: session refresh rejected: {fault}");
                self.install_session(AuthEvent::SignedOut, None).await;
                Ok(None)
            }
            Err(fault) => {
                // The file stays for the next start; this run goes anonymous
                // rather than sending an expired token.
                warn!("gateway: session refresh failed, keeping persisted session: {fault}");
                *self.session.write().await = None;
                Err(fault)
            }
        }
    }

    async fn sign_in(&self, credentials: &Credentials) -> Result<Session, GatewayFault> {
        let url = self.token_endpoint("password")?;
        let response = self
            .authorized(self.http.post(url), &self.api_key)
            .json(&PasswordGrantRequest {
                email: &credentials.email,
                password: &credentials.password,
            })
            .send()
            .await
            .map_err(transport_fault)?;
        let token: TokenResponse = decode_json(response).await?;
        let session = token.into_session(Utc::now().timestamp());

        self.install_session(AuthEvent::SignedIn, Some(session.clone()))
            .await;
        Ok(session)
    }

    async fn sign_up(
        &self,
        credentials: &Credentials,
        metadata: Metadata,
    ) -> Result<SignUpResponse, GatewayFault> {
        let url = self.endpoint("auth/v1/signup")?;
        let response = self
            .authorized(self.http.post(url), &self.api_key)
            .json(&SignUpRequest {
                email: &credentials.email,
                password: &credentials.password,
                data: &metadata,
            })
            .send()
            .await
            .map_err(transport_fault)?;
        let body: Value = decode_json(response).await?;
        let outcome = SignUpResponse::from_value(body, Utc::now().timestamp())
            .map_err(|err| GatewayFault::decode(format!("invalid sign-up response: {err}")))?;

        if let Some(session) = &outcome.session {
            self.install_session(AuthEvent::SignedIn, Some(session.clone()))
                .await;
        }
        Ok(outcome)
    }

    async fn sign_out(&self) -> Result<(), GatewayFault> {
        let access_token = self
            .session
            .read()
            .await
            .as_ref()
            .map(|session| session.access_token.clone());

        let remote = match access_token {
            Some(access_token) => {
                let url = self.endpoint("auth/v1/logout")?;
                match self
                    .authorized(self.http.post(url), &access_token)
                    .send()
                    .await
                {
                    Ok(response) => check_status(response).await.map(|_| ()),
                    Err(err) => Err(transport_fault(err)),
                }
            }
            None => Ok(()),
        };

        self.install_session(AuthEvent::SignedOut, None).await;
        remote
    }

    fn subscribe_auth_changes(&self) -> broadcast::Receiver<AuthChange> {
        self.events.subscribe()
    }
}

#[async_trait]
impl ViewGateway for RestGateway {
    async fn query(&self, view: View, row_limit: Option<usize>) -> Result<Vec<Row>, GatewayFault> {
        let mut url = self.endpoint(&format!("rest/v1/{}", view.name()))?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("select", "*");
            if let Some(limit) = row_limit {
                pairs.append_pair("limit", &limit.to_string());
            }
        }

        debug!("gateway: querying view={view} limit={row_limit:?}");
        let bearer = self.bearer().await;
        let response = self
            .authorized(self.http.get(url), &bearer)
            .send()
            .await
            .map_err(transport_fault)?;
        decode_json(response).await
    }
}

fn normalize_base_url(raw: &str) -> Result<Url, GatewayFault> {
    let trimmed = raw.trim();
    let with_slash = if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    };
    Url::parse(&with_slash).map_err(|err| {
        GatewayFault::new(
            FaultCode::Validation,
            format!("invalid gateway url '{trimmed}': {err}"),
        )
    })
}

fn transport_fault(err: reqwest::Error) -> GatewayFault {
    GatewayFault::transport(err.to_string())
}

async fn check_status(response: Response) -> Result<Response, GatewayFault> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body)
        .ok()
        .and_then(ErrorBody::into_message)
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .map(str::to_string)
                .unwrap_or_else(|| format!("gateway returned status {}", status.as_u16()))
        });
    Err(GatewayFault::new(
        FaultCode::from_status(status.as_u16()),
        message,
    ))
}

async fn decode_json<T: DeserializeOwned>(response: Response) -> Result<T, GatewayFault> {
    let response = check_status(response).await?;
    response
        .json()
        .await
        .map_err(|err| GatewayFault::decode(format!("invalid gateway response: {err}")))
}

#[cfg(test)]
#[path = "tests/rest_gateway_tests.rs"]
mod tests;
