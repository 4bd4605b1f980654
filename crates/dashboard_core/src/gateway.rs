use async_trait::async_trait;
use shared::{
    domain::{AuthChange, Credentials, Metadata, Session},
    error::GatewayFault,
    protocol::{Row, SignUpResponse, View},
};
use tokio::sync::broadcast;

/// Authentication side of the remote gateway.
#[async_trait]
pub trait AuthGateway: Send + Sync {
    /// Returns the persisted session, if any.
    async fn current_session(&self) -> Result<Option<Session>, GatewayFault>;
    async fn sign_in(&self, credentials: &Credentials) -> Result<Session, GatewayFault>;
    async fn sign_up(
        &self,
        credentials: &Credentials,
        metadata: Metadata,
    ) -> Result<SignUpResponse, GatewayFault>;
    async fn sign_out(&self) -> Result<(), GatewayFault>;
    /// Every session transition is pushed to all receivers. Dropping the
    /// receiver unregisters it.
    fn subscribe_auth_changes(&self) -> broadcast::Receiver<AuthChange>;
}

/// Read-only tabular queries against the named views.
#[async_trait]
pub trait ViewGateway: Send + Sync {
    async fn query(&self, view: View, row_limit: Option<usize>) -> Result<Vec<Row>, GatewayFault>;
}
