//! Host-side registration container and controlled clients.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use feedkit_net::Request;
use hashbrown::HashMap;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::ControllerConfig;
use crate::controller::{
    ActivateReport, CacheController, ControllerEnv, FetchOutcome, InstallReport,
};
use crate::lifecycle::{ControllerId, ServiceWorkerState};
use crate::ServiceWorkerError;

// ==================== Client ====================

/// A page or worker that a controller may control.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: String,
    pub url: Url,
    /// Controller handling this client's fetches.
    pub controller: Option<ControllerId>,
}

/// Open clients.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<String, Client>,
}

impl Clients {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&Client> {
        self.clients.get(id)
    }

    /// Track a new uncontrolled window.
    pub fn open_window(&mut self, url: &str) -> Result<Client, ServiceWorkerError> {
        let url = Url::parse(url)
            .map_err(|e| ServiceWorkerError::InvalidMessage(format!("client URL {}: {}", url, e)))?;
        let client = Client {
            id: next_client_id(),
            url,
            controller: None,
        };
        self.clients.insert(client.id.clone(), client.clone());
        Ok(client)
    }

    /// Take control of every in-scope client. Returns the ids that changed, sorted.
    pub fn claim(&mut self, controller: ControllerId, scope: &Url) -> Vec<String> {
        let mut claimed: Vec<String> = self
            .clients
            .values_mut()
            .filter(|c| c.url.as_str().starts_with(scope.as_str()))
            .filter(|c| c.controller != Some(controller))
            .map(|c| {
                c.controller = Some(controller);
                c.id.clone()
            })
            .collect();
        claimed.sort();
        claimed
    }

    /// Drop control by `controller` from every client.
    pub fn release(&mut self, controller: ControllerId) {
        for client in self.clients.values_mut() {
            if client.controller == Some(controller) {
                client.controller = None;
            }
        }
    }
}

fn next_client_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!("client-{}", COUNTER.fetch_add(1, Ordering::Relaxed))
}

// ==================== Registration ====================

/// Options for registration.
#[derive(Debug, Clone, Default)]
pub struct RegistrationOptions {
    /// Scope URL, relative to the script. Defaults to the script's directory.
    pub scope: Option<String>,
}

/// Controllers registered for one scope.
pub struct ServiceWorkerRegistration {
    pub scope: Url,
    pub installing: Option<Arc<CacheController>>,
    pub active: Option<Arc<CacheController>>,
}

impl ServiceWorkerRegistration {
    fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            active: None,
        }
    }

    fn controllers(&self) -> Vec<Arc<CacheController>> {
        self.installing
            .iter()
            .chain(self.active.iter())
            .cloned()
            .collect()
    }
}

/// Result of [`ServiceWorkerContainer::register`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// A new controller was installed and activated.
    Installed {
        controller: ControllerId,
        install: InstallReport,
        activate: ActivateReport,
    },
    /// Script unchanged; the active controller stays.
    Unchanged(ControllerId),
    /// A newer registration replaced this controller while it installed.
    Superseded(ControllerId),
}

/// Registration events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerEvent {
    StateChange {
        registration_scope: String,
        controller: ControllerId,
        new_state: ServiceWorkerState,
    },
    UpdateFound {
        registration_scope: String,
    },
    ControllerChange {
        client_id: String,
        controller: ControllerId,
    },
}

// ==================== Container ====================

/// Registrations by scope, plus the environment new controllers are built with.
pub struct ServiceWorkerContainer {
    registrations: Arc<RwLock<HashMap<String, ServiceWorkerRegistration>>>,
    /// Messages posted to a scope before it had a controller.
    pending_messages: RwLock<HashMap<String, Vec<String>>>,
    config: Arc<ControllerConfig>,
    env: ControllerEnv,
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl ServiceWorkerContainer {
    pub fn new(
        config: ControllerConfig,
        env: ControllerEnv,
    ) -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                registrations: Arc::new(RwLock::new(HashMap::new())),
                pending_messages: RwLock::new(HashMap::new()),
                config: Arc::new(config),
                env,
                event_tx,
            },
            event_rx,
        )
    }

    pub fn clients(&self) -> Arc<RwLock<Clients>> {
        Arc::clone(&self.env.clients)
    }

    fn emit(&self, event: ServiceWorkerEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Register a controller script.
    ///
    /// Byte-identical script content keeps the active controller. Otherwise a
    /// new controller installs, skips waiting, activates and claims clients;
    /// the previous one becomes redundant.
    pub async fn register(
        &self,
        script_url: &str,
        script: &str,
        options: RegistrationOptions,
    ) -> Result<RegisterOutcome, ServiceWorkerError> {
        let script_url = Url::parse(script_url)
            .map_err(|e| ServiceWorkerError::RegistrationFailed(e.to_string()))?;
        if !matches!(script_url.scheme(), "http" | "https") {
            return Err(ServiceWorkerError::RegistrationFailed(format!(
                "unsupported scheme '{}'",
                script_url.scheme()
            )));
        }

        let scope = match options.scope {
            Some(ref s) => script_url
                .join(s)
                .map_err(|e| ServiceWorkerError::RegistrationFailed(e.to_string()))?,
            None => default_scope(&script_url),
        };
        if scope.origin() != script_url.origin() {
            return Err(ServiceWorkerError::RegistrationFailed(
                "scope must share the script's origin".to_string(),
            ));
        }
        let scope_key = scope.to_string();

        let controller = {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .entry(scope_key.clone())
                .or_insert_with(|| ServiceWorkerRegistration::new(scope.clone()));

            if let Some(active) = &registration.active {
                if active.script_source() == Some(script) {
                    debug!(scope = %scope_key, controller = %active.id(), "Script unchanged");
                    return Ok(RegisterOutcome::Unchanged(active.id()));
                }
            }

            let controller = Arc::new(
                CacheController::new(scope.clone(), Arc::clone(&self.config), self.env.clone())
                    .with_script(script_url.clone(), script),
            );
            if let Some(previous) = registration.installing.replace(Arc::clone(&controller)) {
                previous.mark_redundant().await;
            }
            controller
        };

        info!(
            scope = %scope_key,
            controller = %controller.id(),
            script = %script_url,
            "Update found"
        );
        self.emit(ServiceWorkerEvent::UpdateFound {
            registration_scope: scope_key.clone(),
        });

        let pending = self
            .pending_messages
            .write()
            .await
            .remove(&scope_key)
            .unwrap_or_default();
        for message in pending {
            if let Err(err) = controller.post_message(&message).await {
                warn!(error = %err, "Dropping buffered message");
            }
        }

        let install = match controller.install().await {
            Ok(report) => report,
            Err(err) => {
                self.discard_installing(&scope_key, &controller).await;
                return Err(err);
            }
        };
        self.emit_state(&scope_key, &controller, ServiceWorkerState::Installed);

        {
            let mut registrations = self.registrations.write().await;
            let Some(registration) = registrations.get_mut(&scope_key) else {
                controller.mark_redundant().await;
                return Ok(RegisterOutcome::Superseded(controller.id()));
            };

            let still_ours = registration
                .installing
                .as_ref()
                .is_some_and(|c| Arc::ptr_eq(c, &controller));
            if !still_ours {
                controller.mark_redundant().await;
                return Ok(RegisterOutcome::Superseded(controller.id()));
            }

            registration.installing = None;
            if let Some(previous) = registration.active.replace(Arc::clone(&controller)) {
                previous.mark_redundant().await;
                self.env.clients.write().await.release(previous.id());
                self.emit_state(&scope_key, &previous, ServiceWorkerState::Redundant);
            }
        }

        let activate = controller.activate().await?;
        self.emit_state(&scope_key, &controller, ServiceWorkerState::Activated);
        for client_id in &activate.claimed {
            self.emit(ServiceWorkerEvent::ControllerChange {
                client_id: client_id.clone(),
                controller: controller.id(),
            });
        }

        Ok(RegisterOutcome::Installed {
            controller: controller.id(),
            install,
            activate,
        })
    }

    fn emit_state(&self, scope: &str, controller: &CacheController, new_state: ServiceWorkerState) {
        self.emit(ServiceWorkerEvent::StateChange {
            registration_scope: scope.to_string(),
            controller: controller.id(),
            new_state,
        });
    }

    async fn discard_installing(&self, scope: &str, controller: &Arc<CacheController>) {
        controller.mark_redundant().await;
        let mut registrations = self.registrations.write().await;
        if let Some(registration) = registrations.get_mut(scope) {
            if registration
                .installing
                .as_ref()
                .is_some_and(|c| Arc::ptr_eq(c, controller))
            {
                registration.installing = None;
            }
        }
    }

    /// Post a page message to every controller of a scope.
    ///
    /// The page may post before registration has created a controller; such
    /// messages are buffered and delivered to the next controller of the scope.
    pub async fn post_message(&self, scope: &str, data: &str) -> Result<(), ServiceWorkerError> {
        let controllers = self
            .registrations
            .read()
            .await
            .get(scope)
            .map(ServiceWorkerRegistration::controllers)
            .unwrap_or_default();

        if controllers.is_empty() {
            self.pending_messages
                .write()
                .await
                .entry(scope.to_string())
                .or_default()
                .push(data.to_string());
            debug!(scope, "Buffered message until a controller exists");
            return Ok(());
        }

        for controller in controllers {
            controller.post_message(data).await?;
        }
        Ok(())
    }

    /// Scope with the longest prefix match for `url`.
    pub async fn get_registration(&self, url: &str) -> Option<String> {
        let url = Url::parse(url).ok()?;
        let registrations = self.registrations.read().await;
        registrations
            .keys()
            .filter(|scope| url.as_str().starts_with(scope.as_str()))
            .max_by_key(|scope| scope.len())
            .cloned()
    }

    /// All registered scopes, sorted.
    pub async fn get_registrations(&self) -> Vec<String> {
        let mut scopes: Vec<String> = self.registrations.read().await.keys().cloned().collect();
        scopes.sort();
        scopes
    }

    pub async fn active_controller(&self, scope: &str) -> Option<Arc<CacheController>> {
        self.registrations
            .read()
            .await
            .get(scope)
            .and_then(|r| r.active.clone())
    }

    /// Dispatch a fetch to the controller responsible for it.
    ///
    /// Navigations go to the controller whose scope contains the URL; other
    /// requests go to the controller of the issuing client.
    pub async fn handle_fetch(&self, client_id: Option<&str>, request: Request) -> FetchOutcome {
        let controller = match client_id {
            Some(id) if !request.is_navigation() => self.controller_for_client(id).await,
            _ => match self.get_registration(request.url.as_str()).await {
                Some(scope) => self.active_controller(&scope).await,
                None => None,
            },
        };

        match controller {
            Some(controller) => controller.handle_fetch(request).await,
            None => FetchOutcome::PassThrough,
        }
    }

    async fn controller_for_client(&self, client_id: &str) -> Option<Arc<CacheController>> {
        let controller_id = self.env.clients.read().await.get(client_id)?.controller?;
        self.registrations
            .read()
            .await
            .values()
            .filter_map(|r| r.active.as_ref())
            .find(|c| c.id() == controller_id)
            .cloned()
    }

    /// Unregister a scope; its controllers become redundant.
    pub async fn unregister(&self, scope: &str) -> Result<bool, ServiceWorkerError> {
        let removed = self.registrations.write().await.remove(scope);
        let Some(registration) = removed else {
            return Ok(false);
        };

        let mut clients = self.env.clients.write().await;
        for controller in registration.controllers() {
            controller.mark_redundant().await;
            clients.release(controller.id());
            self.emit_state(scope, &controller, ServiceWorkerState::Redundant);
        }
        info!(scope, "Unregistered");
        Ok(true)
    }
}

/// Directory of the script, with a trailing slash.
fn default_scope(script_url: &Url) -> Url {
    let mut scope = script_url.clone();
    let dir = script_url
        .path()
        .rsplit_once('/')
        .map(|(dir, _)| dir)
        .unwrap_or("");
    scope.set_path(&format!("{}/", dir));
    scope.set_query(None);
    scope.set_fragment(None);
    scope
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_scope() {
        let root = Url::parse("https://app.example/sw.js").unwrap();
        assert_eq!(default_scope(&root).as_str(), "https://app.example/");

        let nested = Url::parse("https://app.example/app/sw.js?v=1").unwrap();
        assert_eq!(default_scope(&nested).as_str(), "https://app.example/app/");
    }

    #[test]
    fn test_open_window() {
        let mut clients = Clients::new();
        let client = clients.open_window("https://app.example/").unwrap();
        assert!(client.controller.is_none());
        assert!(clients.get(&client.id).is_some());
    }

    #[test]
    fn test_open_window_rejects_bad_url() {
        let mut clients = Clients::new();
        assert!(matches!(
            clients.open_window("not a url"),
            Err(ServiceWorkerError::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_claim_only_in_scope() {
        let mut clients = Clients::new();
        let inside = clients.open_window("https://app.example/app/feed").unwrap();
        let outside = clients.open_window("https://app.example/other").unwrap();
        let controller = ControllerId::new();
        let scope = Url::parse("https://app.example/app/").unwrap();

        assert_eq!(clients.claim(controller, &scope), vec![inside.id.clone()]);
        assert!(clients.claim(controller, &scope).is_empty());
        assert_eq!(clients.get(&outside.id).unwrap().controller, None);
        assert_eq!(clients.get(&inside.id).unwrap().controller, Some(controller));

        clients.release(controller);
        assert_eq!(clients.get(&inside.id).unwrap().controller, None);
    }
}
