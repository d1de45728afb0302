//! Ambient user context propagation.
//!
//! Every user-scoped storage call reads the ambient [`UserContext`] instead
//! of taking a `user_id` parameter. Request handlers and background workers
//! must set the context before doing user-scoped work; an unset context is
//! an error, never a silent cross-user leak.

use std::cell::RefCell;
use std::future::Future;
use uuid::Uuid;

use crate::{Error, Result};

/// Per-request ambient context.
#[derive(Clone, Debug)]
pub struct UserContext {
    /// The acting user.
    pub user_id: Uuid,
    /// The continuum in play, when known.
    pub continuum_id: Option<Uuid>,
    /// IANA timezone name from user preferences, when known.
    pub timezone: Option<String>,
}

impl UserContext {
    /// Creates a context for a user with no continuum attached yet.
    #[must_use]
    pub const fn new(user_id: Uuid) -> Self {
        Self {
            user_id,
            continuum_id: None,
            timezone: None,
        }
    }

    /// Attaches a continuum id.
    #[must_use]
    pub const fn with_continuum(mut self, continuum_id: Uuid) -> Self {
        self.continuum_id = Some(continuum_id);
        self
    }

    /// Attaches a timezone preference.
    #[must_use]
    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = Some(timezone.into());
        self
    }
}

tokio::task_local! {
    static TASK_CONTEXT: UserContext;
}

thread_local! {
    static THREAD_CONTEXT: RefCell<Option<UserContext>> = const { RefCell::new(None) };
}

/// Guard that restores the previous thread-local context on drop.
pub struct UserContextGuard {
    previous: Option<UserContext>,
}

impl Drop for UserContextGuard {
    fn drop(&mut self) {
        THREAD_CONTEXT.with(|slot| {
            *slot.borrow_mut() = self.previous.take();
        });
    }
}

/// Enters a user context for synchronous flows (background workers).
#[must_use]
pub fn enter_user_context(context: UserContext) -> UserContextGuard {
    let previous = THREAD_CONTEXT.with(|slot| slot.borrow_mut().replace(context));
    UserContextGuard { previous }
}

/// Scopes a user context across an async future (request handlers).
pub async fn scope_user_context<F, T>(context: UserContext, fut: F) -> T
where
    F: Future<Output = T>,
{
    TASK_CONTEXT
        .scope(context.clone(), async move {
            let _guard = enter_user_context(context);
            fut.await
        })
        .await
}

/// Returns the current context, if set.
#[must_use]
pub fn current_context() -> Option<UserContext> {
    if let Ok(context) = TASK_CONTEXT.try_with(Clone::clone) {
        return Some(context);
    }
    THREAD_CONTEXT.with(|slot| slot.borrow().clone())
}

/// Returns the current user id, or an error when no context is set.
///
/// Storage layers call this before every user-scoped statement, making a
/// missing context a hard failure rather than a cross-user read.
pub fn current_user_id() -> Result<Uuid> {
    current_context().map(|ctx| ctx.user_id).ok_or_else(|| {
        Error::PermissionDenied(
            "no ambient user context set; user-scoped work requires one".to_string(),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_context_is_an_error() {
        assert!(current_user_id().is_err());
    }

    #[test]
    fn test_guard_restores_previous() {
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        let _outer = enter_user_context(UserContext::new(first));
        assert_eq!(current_user_id().unwrap(), first);
        {
            let _inner = enter_user_context(UserContext::new(second));
            assert_eq!(current_user_id().unwrap(), second);
        }
        assert_eq!(current_user_id().unwrap(), first);
    }

    #[tokio::test]
    async fn test_async_scope() {
        let user = Uuid::new_v4();
        let seen = scope_user_context(UserContext::new(user), async { current_user_id() }).await;
        assert_eq!(seen.unwrap(), user);
        assert!(current_user_id().is_err());
    }
}
