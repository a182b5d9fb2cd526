pub mod analytics;
pub mod config;
pub mod context;
pub mod feedback;
pub mod pipeline;
pub mod prompt;
pub mod session;
pub mod stats;
pub mod validator;

pub use analytics::*;
pub use config::*;
pub use context::*;
pub use feedback::*;
pub use pipeline::*;
pub use prompt::*;
pub use session::*;
pub use stats::*;
pub use validator::*;
