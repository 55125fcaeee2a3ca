pub mod confirm;
pub mod dispatch;
pub mod health;
pub mod mcp_http;
