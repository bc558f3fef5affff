use crate::error::ServerResult;
use crate::request::Request;
use crate::response::Response;
use std::fmt;
use std::sync::Arc;

/// Whatever answers requests: a routing tree, a single handler, ...
///
/// A resource must either write to the response (which sends its head) or
/// leave a non-200 status for the server to render. Returning
/// `Err(ServerError::Status(s))` asks for the canned page of `s`; any
/// other error, a panic, or returning with nothing sent and status 200
/// becomes a 500.
pub trait Resource: Send + Sync {
    fn execute(&self, request: &mut Request, response: &mut Response<'_>) -> ServerResult<()>;
}

impl<T: Resource + ?Sized> Resource for Arc<T> {
    fn execute(&self, request: &mut Request, response: &mut Response<'_>) -> ServerResult<()> {
        (**self).execute(request, response)
    }
}

/// A resource backed by a closure
pub struct FnResource<F> {
    handler: F,
}

impl<F> fmt::Debug for FnResource<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnResource")
            .field("handler", &"<function>")
            .finish()
    }
}

impl<F> Resource for FnResource<F>
where
    F: Fn(&mut Request, &mut Response<'_>) -> ServerResult<()> + Send + Sync,
{
    fn execute(&self, request: &mut Request, response: &mut Response<'_>) -> ServerResult<()> {
        (self.handler)(request, response)
    }
}

/// Wrap a closure as a [`Resource`]
pub fn resource_fn<F>(handler: F) -> FnResource<F>
where
    F: Fn(&mut Request, &mut Response<'_>) -> ServerResult<()> + Send + Sync,
{
    FnResource { handler }
}
