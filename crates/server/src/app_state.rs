use std::sync::Arc;

use server_api::{ApiContext, Gatekeeper};
use storage::Storage;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) api: ApiContext,
    pub(crate) gatekeeper: Arc<dyn Gatekeeper>,
    /// Kept beside the coordinator for health probes and shutdown.
    pub(crate) storage: Storage,
}
