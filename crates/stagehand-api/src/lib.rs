pub mod app;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod state;
pub mod tasks;

pub use app::build_app;
pub use error::ApiError;
pub use state::AppState;
pub use tasks::{TaskStatus, TaskTable};
