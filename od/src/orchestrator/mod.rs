//! Task orchestration
//!
//! One orchestrator per process. It owns the device handle registry, the
//! reboot coordinator and, in manager deployments, the delegation poller.
//! Each submitted task runs as its own spawned workflow; workflows only
//! share the state actor.
//!
//! Status flow of a task:
//!
//! ```text
//! RUNNING -> OK
//!         -> REBOOTING -> OK | ERROR
//!         -> ROLLING_BACK -> ERROR
//!         -> REVOKING -> (restart) -> RUNNING ...
//!         -> ERROR
//! ```

mod flow;
mod recovery;
mod revoke;
mod workflow;

pub use recovery::Recovery;
pub use revoke::{RevokeEvent, RevokeSender};
pub use workflow::{Responder, Workflow};

use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{Config, DeploymentMode};
use crate::delegation::{DelegationPoller, RequestSender};
use crate::device::{DeviceProvider, DeviceRegistry, ShellRunner};
use crate::processor::{ConfigManager, DeclarationProcessor, Validator};
use crate::reboot::RebootCoordinator;
use crate::secrets::SecretVault;
use crate::state::StateManager;
use crate::webhook::Notifier;

const REVOKE_CHANNEL_SIZE: usize = 16;

/// External collaborators the orchestrator drives
#[derive(Clone)]
pub struct Collaborators {
    pub validator: Arc<dyn Validator>,
    pub processor: Arc<dyn DeclarationProcessor>,
    pub config_manager: Arc<dyn ConfigManager>,
    pub devices: Arc<dyn DeviceProvider>,
    pub shell: Arc<dyn ShellRunner>,
    pub vault: Arc<dyn SecretVault>,
    /// Peer processor transport, used in manager deployments
    pub peer: Option<Arc<dyn RequestSender>>,
    pub notifier: Arc<dyn Notifier>,
}

pub struct Orchestrator {
    config: Config,
    state: StateManager,
    collaborators: Collaborators,
    devices: DeviceRegistry,
    reboot: RebootCoordinator,
    delegation: Option<DelegationPoller>,
    revoke_tx: RevokeSender,
}

impl Orchestrator {
    /// Build the orchestrator and start its revoke listener
    pub fn start(config: Config, state: StateManager, collaborators: Collaborators) -> Arc<Self> {
        info!(deployment = %config.deployment, "Starting orchestrator");
        let (revoke_tx, revoke_rx) = revoke::channel(REVOKE_CHANNEL_SIZE);

        let delegation = match (config.deployment, &collaborators.peer) {
            (DeploymentMode::Manager, Some(sender)) => {
                Some(DelegationPoller::new(sender.clone(), config.delegation.clone()))
            }
            (DeploymentMode::Manager, None) => {
                warn!("Manager deployment without a peer transport, processing locally");
                None
            }
            _ => None,
        };

        let orchestrator = Arc::new(Self {
            devices: DeviceRegistry::new(config.devices.max_cached),
            reboot: RebootCoordinator::new(state.clone(), config.deployment, config.reboot.clone()),
            delegation,
            revoke_tx,
            state,
            collaborators,
            config,
        });

        tokio::spawn(revoke::listen(Arc::downgrade(&orchestrator), revoke_rx));
        orchestrator
    }

    /// Sender for license revocation events
    pub fn revoke_sender(&self) -> RevokeSender {
        self.revoke_tx.clone()
    }

    pub fn state(&self) -> &StateManager {
        &self.state
    }

    pub fn deployment(&self) -> DeploymentMode {
        self.config.deployment
    }

    /// Number of cached device handles
    pub fn cached_devices(&self) -> usize {
        self.devices.len()
    }

    async fn persist(&self) {
        if let Err(e) = self.state.persist().await {
            warn!(error = %e, "Failed to persist task state");
        }
    }
}
