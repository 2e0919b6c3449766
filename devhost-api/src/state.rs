use devhost_orchestrator::InstanceManager;

#[derive(Clone)]
pub struct AppState {
    pub manager: InstanceManager,
}

impl AppState {
    pub fn new(manager: InstanceManager) -> Self {
        Self { manager }
    }
}
