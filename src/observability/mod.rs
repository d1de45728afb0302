//! Logging, ambient user context and degraded-mode tracking.

mod degraded;
mod logging;
mod user_context;

pub use degraded::{clear_degraded, degraded_components, enter_degraded_mode, is_degraded};
pub use logging::{LoggingOptions, init_logging};
pub use user_context::{
    UserContext, UserContextGuard, current_context, current_user_id, enter_user_context,
    scope_user_context,
};
