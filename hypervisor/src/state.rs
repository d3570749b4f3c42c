use std::sync::Arc;

use crate::orchestrator::Orchestrator;
use crate::outbox::ReplyOutbox;
use crate::session_registry::SessionRegistry;

pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub outbox: Arc<ReplyOutbox>,
    pub registry: SessionRegistry,
}
