pub mod acceptor;
pub mod config;
pub mod connection;
pub mod error;
pub mod http;
pub mod multipart;
pub mod request;
pub mod resource;
pub mod response;
pub mod server;
pub mod session;
pub mod upload;

/// Re-exports of common components for easier access
pub use acceptor::ConnectionAcceptor;
pub use config::{ConfigSource, Properties, ServerConfig};
pub use connection::Connection;
pub use error::{RequestError, ServerError, ServerResult};
pub use http::{Method, ParamValue, Params, Status};
pub use request::Request;
pub use resource::{resource_fn, FnResource, Resource};
pub use response::{Cookie, Response};
pub use server::{Server, ShutdownHandle};
pub use session::{Session, SessionHandle, SessionStore};
pub use upload::{FileUpload, TempFile, UploadStatus};
