//! Application-level span guard.

use tracing::{Span, span::Entered};

use crate::init::build_sha;

/// Guard that keeps the application-level span entered for the lifetime of the process.
pub struct GlobalContextGuard {
    _guard: Entered<'static>,
}

impl GlobalContextGuard {
    /// Enter the `app` span tagged with the instance name and build identifier.
    #[must_use]
    pub fn new(instance: impl Into<String>) -> Self {
        let instance = instance.into();
        let span: &'static Span = Box::leak(Box::new(
            tracing::info_span!("app", instance = %instance, build_sha = %build_sha()),
        ));
        let guard = span.enter();
        Self { _guard: guard }
    }
}
