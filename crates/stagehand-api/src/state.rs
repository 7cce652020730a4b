use std::sync::Arc;

use serde_json::Value;

use stagehand_checkout::EventClient;
use stagehand_config::Config;
use stagehand_store::Store;

use crate::tasks::TaskTable;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub config: Config,
    pub events: Arc<dyn EventClient>,
    pub tasks: TaskTable,
    /// The test execution recipe collection handed to this process by the
    /// suite runner, if any. Checkout requests are built from it.
    pub tercc: Option<Value>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn Store>,
        config: Config,
        events: Arc<dyn EventClient>,
        tercc: Option<Value>,
    ) -> Self {
        AppState { store, config, events, tasks: TaskTable::default(), tercc }
    }
}
