mod app;
mod middleware;
mod state;

pub use app::create_app;
pub use middleware::{api_key_auth, ClientIp};
pub use state::AppState;
