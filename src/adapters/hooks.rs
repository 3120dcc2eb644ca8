use async_trait::async_trait;
use tracing::info;

use crate::domain::models::{Invoice, Sale};
use crate::domain::ports::LifecycleHooks;

/// Hooks that only trace the transition.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

#[async_trait]
impl LifecycleHooks for NoopHooks {
    async fn on_authorized(&self, sale: &Sale, invoice: &Invoice) {
        info!(sale_id = %sale.id, invoice_id = %invoice.id, "Invoice authorized");
    }

    async fn on_cancelled(&self, sale: &Sale, invoice: &Invoice) {
        info!(sale_id = %sale.id, invoice_id = %invoice.id, "Invoice cancelled");
    }
}
