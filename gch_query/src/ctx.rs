use tokio_util::sync::CancellationToken;

/// Per-request identity and cancellation, threaded through the planner,
/// the limiters and the back-end calls.
#[derive(Debug, Clone)]
pub struct RequestContext {
    request_id: String,
    user: Option<String>,
    cancel: CancellationToken,
}

impl RequestContext {
    /// Start a request. `user` is the pre-populated identity from the
    /// `X-Forwarded-User` header, when present.
    pub fn new(user: Option<String>) -> Self {
        Self {
            request_id: gch_time::request_id(),
            user,
            cancel: CancellationToken::new(),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// Fires when the client went away or the request deadline passed.
    pub fn cancel(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// A fresh back-end query id, `<request-id>::<8-byte-hex>`.
    pub fn backend_query_id(&self) -> String {
        gch_time::backend_query_id(&self.request_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_query_ids_differ_per_call() {
        let ctx = RequestContext::new(Some("alice".to_string()));
        let a = ctx.backend_query_id();
        let b = ctx.backend_query_id();
        assert_ne!(a, b);
        assert!(a.starts_with(ctx.request_id()));
        assert_eq!(ctx.user(), Some("alice"));
    }
}
