use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, PoisonError, Weak,
};

use serde_json::Value;
use shared::{
    domain::{AuthChange, AuthUser, Credentials, Metadata, Role, Session},
    error::GatewayFault,
    protocol::SignUpResponse,
};
use thiserror::Error;
use tokio::{
    sync::{
        broadcast::{self, error::RecvError},
        watch,
    },
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::gateway::AuthGateway;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    pub session: Option<Session>,
    /// Set once the persisted session has been looked up or the gateway has
    /// pushed its first change, whichever happens first.
    pub initialized: bool,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AuthFault {
    #[error("{0}")]
    Gateway(#[from] GatewayFault),
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Registration {
    Created(AuthUser),
    /// The gateway accepted the sign-up but handed back no identity.
    AcceptedWithoutIdentity,
}

/// Owns the current authentication identity. Consumers read it through the
/// predicates or observe transitions with [`SessionStateManager::subscribe`].
pub struct SessionStateManager {
    gateway: Arc<dyn AuthGateway>,
    state: watch::Sender<SessionState>,
    init_started: AtomicBool,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl SessionStateManager {
    pub fn new(gateway: Arc<dyn AuthGateway>) -> Arc<Self> {
        let (state, _) = watch::channel(SessionState::default());
        Arc::new(Self {
            gateway,
            state,
            init_started: AtomicBool::new(false),
            listener: Mutex::new(None),
        })
    }

    /// Registers for gateway changes, then restores the persisted session.
    pub async fn start(self: &Arc<Self>) {
        self.subscribe_to_changes();
        self.initialize().await;
    }

    /// Looks up the persisted session. Runs once; later calls return
    /// immediately. A gateway fault counts as "no session".
    pub async fn initialize(&self) {
        if self.init_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let session = match self.gateway.current_session().await {
            Ok(session) => session,
            Err(fault) => {
                warn!("session: could not restore persisted session: {fault}");
                None
            }
        };

        self.state.send_modify(|state| {
            // A change pushed while the lookup was in flight is newer.
            if !state.initialized {
                state.session = session;
            }
            state.initialized = true;
        });
        debug!(
            "session: initialized authenticated={}",
            self.is_authenticated()
        );
    }

    /// Starts applying gateway change notifications. Calling it again while
    /// the listener is alive does nothing.
    pub fn subscribe_to_changes(self: &Arc<Self>) {
        let mut listener = self.listener.lock().unwrap_or_else(PoisonError::into_inner);
        if listener.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let changes = self.gateway.subscribe_auth_changes();
        let manager = Arc::downgrade(self);
        *listener = Some(tokio::spawn(listen_for_changes(manager, changes)));
    }

    /// Unregisters the change listener.
    pub fn shutdown(&self) {
        let task = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }

    pub fn apply_change(&self, change: AuthChange) {
        debug!(
            "session: gateway change event={:?} authenticated={}",
            change.event,
            change.session.is_some()
        );
        self.state.send_modify(|state| {
            state.session = change.session;
            state.initialized = true;
        });
    }

    async fn resync(&self) {
        match self.gateway.current_session().await {
            Ok(session) => self.replace_session(session),
            Err(fault) => warn!("session: resync after missed changes failed: {fault}"),
        }
    }

    fn replace_session(&self, session: Option<Session>) {
        self.state.send_modify(|state| {
            state.session = session;
            state.initialized = true;
        });
    }

    /// Signs in and returns the identity right away, without waiting for the
    /// gateway's change notification.
    pub async fn login(&self, credentials: &Credentials) -> Result<AuthUser, AuthFault> {
        match self.gateway.sign_in(credentials).await {
            Ok(session) => {
                let user = session.user.clone();
                self.replace_session(Some(session));
                info!("session: signed in user={}", user.id);
                Ok(user)
            }
            Err(fault) => {
                warn!("session: sign-in rejected: {fault}");
                Err(fault.into())
            }
        }
    }

    /// Creates an identity. `email` and `password` are taken out of `fields`;
    /// everything else is attached to the identity as profile metadata.
    pub async fn register(&self, fields: Metadata) -> Result<Registration, AuthFault> {
        let (credentials, profile) = split_registration_fields(fields)?;

        match self.gateway.sign_up(&credentials, profile).await {
            Ok(SignUpResponse {
                session: Some(session),
                ..
            }) => {
                let user = session.user.clone();
                self.replace_session(Some(session));
                info!("session: registered and signed in user={}", user.id);
                Ok(Registration::Created(user))
            }
            Ok(SignUpResponse {
                user: Some(user),
                session: None,
            }) => {
                info!("session: registered user={} pending confirmation", user.id);
                Ok(Registration::Created(user))
            }
            Ok(SignUpResponse {
                user: None,
                session: None,
            }) => {
                warn!("session: sign-up accepted without an identity");
                Ok(Registration::AcceptedWithoutIdentity)
            }
            Err(fault) => {
                warn!("session: sign-up rejected: {fault}");
                Err(fault.into())
            }
        }
    }

    /// Clears the local session even when the remote sign-out fails.
    pub async fn logout(&self) {
        if let Err(fault) = self.gateway.sign_out().await {
            error!("session: remote sign-out failed, clearing local session: {fault}");
        }
        self.replace_session(None);
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.state.borrow().initialized
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.borrow().session.is_some()
    }

    pub fn current_session(&self) -> Option<Session> {
        self.state.borrow().session.clone()
    }

    pub fn current_user(&self) -> Option<AuthUser> {
        self.state
            .borrow()
            .session
            .as_ref()
            .map(|session| session.user.clone())
    }

    pub fn role(&self) -> Option<Role> {
        self.state
            .borrow()
            .session
            .as_ref()
            .and_then(|session| session.user.role())
    }

    /// Exact match only; roles imply nothing about each other.
    pub fn has_role(&self, role: Role) -> bool {
        self.role() == Some(role)
    }

    pub fn is_admin(&self) -> bool {
        self.has_role(Role::Admin)
    }

    pub fn is_client(&self) -> bool {
        self.has_role(Role::Client)
    }
}

impl Drop for SessionStateManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn listen_for_changes(
    manager: Weak<SessionStateManager>,
    mut changes: broadcast::Receiver<AuthChange>,
) {
    loop {
        match changes.recv().await {
            Ok(change) => {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.apply_change(change);
            }
            Err(RecvError::Lagged(skipped)) => {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                warn!("session: missed {skipped} gateway changes, resyncing");
                manager.resync().await;
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Splits registration input into credentials and profile metadata.
pub fn split_registration_fields(
    mut fields: Metadata,
) -> Result<(Credentials, Metadata), AuthFault> {
    let email = take_string(&mut fields, "email")?;
    let password = take_string(&mut fields, "password")?;
    Ok((Credentials { email, password }, fields))
}

fn take_string(fields: &mut Metadata, key: &'static str) -> Result<String, AuthFault> {
    match fields.remove(key) {
        Some(Value::String(value)) if !value.is_empty() => Ok(value),
        _ => Err(AuthFault::MissingField(key)),
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
