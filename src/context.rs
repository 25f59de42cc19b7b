//! Request context passed along publish and delivery paths

use tokio_util::sync::CancellationToken;

/// Cancellation plus the tenant the work is performed for
#[derive(Debug, Clone, Default)]
pub struct Context {
    cancel: CancellationToken,
    tenant_id: Option<String>,
}

impl Context {
    /// A context that is never cancelled unless [`Context::cancel`] is called
    pub fn background() -> Self {
        Self::default()
    }

    /// A context bound to an existing token (e.g. a delivery token)
    pub fn with_token(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            tenant_id: None,
        }
    }

    pub fn with_tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}
