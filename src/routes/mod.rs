mod auth;
mod health_check;

pub use auth::{get_current_user, logout, refresh, sign_in, sign_up};
pub use health_check::health_check;
