use std::sync::Arc;

use relay_gateway::Gateway;

use crate::auth::AuthConfig;

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub auth: AuthConfig,
}
