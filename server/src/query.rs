use crate::error::Result;
use crate::store::PresenceStore;
use fleetcast_shared::PresenceView;
use std::sync::Arc;

/// Read-only access to the current presence set.
///
/// Used for initial page population and for observers reconciling after a
/// reconnect. `last_seen` is not part of the public view.
#[derive(Clone)]
pub struct QueryService {
    store: Arc<PresenceStore>,
}

impl QueryService {
    pub fn new(store: Arc<PresenceStore>) -> Self {
        Self { store }
    }

    pub fn list_all(&self) -> Vec<PresenceView> {
        let mut views: Vec<PresenceView> = self.store.list().iter().map(|r| r.to_view()).collect();
        views.sort_by(|a, b| a.id.cmp(&b.id));
        views
    }

    pub fn get(&self, id: &str) -> Result<PresenceView> {
        self.store.get(id).map(|r| r.to_view())
    }
}
