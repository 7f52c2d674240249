pub mod api_routes;
pub mod ws_routes;

use crate::service::branch_service::BranchService;
use crate::service::chat_service::ChatService;

#[derive(Clone)]
pub struct AppState {
    pub chat: ChatService,
    pub branches: BranchService,
}
