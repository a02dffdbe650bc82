//! Platform VM providers

mod applevz;
mod development;
mod hyperv;
mod kvm;

pub use applevz::AppleVzProvider;
pub use development::DevelopmentProvider;
pub use hyperv::HyperVProvider;
pub use kvm::KvmProvider;

use std::path::Path;
use std::sync::Arc;

use super::dispatcher::Dispatcher;
use super::provider::{ProviderKind, VmProvider, VmResult};

/// Construct the provider for a selected kind
pub fn build_provider(kind: ProviderKind, state_root: &Path) -> Arc<dyn VmProvider> {
    match kind {
        ProviderKind::Development => Arc::new(DevelopmentProvider::new(state_root.to_path_buf())),
        ProviderKind::Kvm => Arc::new(KvmProvider::new(state_root.to_path_buf())),
        ProviderKind::AppleVirtualization => {
            Arc::new(AppleVzProvider::new(state_root.to_path_buf()))
        }
        ProviderKind::HyperV => Arc::new(HyperVProvider::new()),
    }
}

/// Lazily connected agent link shared by the hypervisor-backed providers.
///
/// The dispatcher reconnects on next use after a connection loss; callers
/// see `Unavailable` in between.
pub(super) struct AgentLink {
    port: parking_lot::Mutex<Option<u16>>,
    dispatcher: tokio::sync::Mutex<Option<Arc<Dispatcher>>>,
}

impl AgentLink {
    pub(super) fn new() -> Self {
        Self {
            port: parking_lot::Mutex::new(None),
            dispatcher: tokio::sync::Mutex::new(None),
        }
    }

    pub(super) fn set_port(&self, port: u16) {
        *self.port.lock() = Some(port);
    }

    pub(super) fn reset(&self) {
        if let Ok(mut guard) = self.dispatcher.try_lock() {
            *guard = None;
        }
    }

    pub(super) async fn get(&self) -> VmResult<Arc<Dispatcher>> {
        let port = (*self.port.lock())
            .ok_or_else(|| super::provider::VmError::Unavailable("vm not started".into()))?;

        let mut guard = self.dispatcher.lock().await;
        if let Some(dispatcher) = guard.as_ref() {
            if !dispatcher.is_lost() {
                return Ok(dispatcher.clone());
            }
        }

        let dispatcher = Arc::new(Dispatcher::connect(port).await?);
        *guard = Some(dispatcher.clone());
        Ok(dispatcher)
    }
}
