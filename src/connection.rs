use crate::config::ServerConfig;
use crate::error::{RequestError, ServerError, ServerResult};
use crate::http::{Method, Status};
use crate::request::Request;
use crate::resource::Resource;
use crate::response::Response;
use crate::session::SessionStore;
use log::{debug, error, trace, warn};
use std::io::{self, BufReader, BufWriter, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Where a connection is in its request cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    AwaitRequest,
    Parse,
    Route,
    Respond,
    Closed,
}

/// Whether the loop goes round again after a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    Continue,
    Close,
}

/// Drives one client socket through parse, route and respond until
/// keep-alive ends, the request cap is hit or the client goes quiet.
pub struct Connection {
    stream: TcpStream,
    peer_addr: SocketAddr,
    id: usize,
    state: ConnectionState,
    served: usize,
    config: Arc<ServerConfig>,
    resource: Arc<dyn Resource>,
    sessions: Arc<SessionStore>,
}

impl Connection {
    /// Create a new connection from a TcpStream
    pub fn new(
        stream: TcpStream,
        peer_addr: SocketAddr,
        id: usize,
        config: Arc<ServerConfig>,
        resource: Arc<dyn Resource>,
        sessions: Arc<SessionStore>,
    ) -> io::Result<Self> {
        stream.set_nodelay(true)?;

        Ok(Self {
            stream,
            peer_addr,
            id,
            state: ConnectionState::AwaitRequest,
            served: 0,
            config,
            resource,
            sessions,
        })
    }

    /// Serve the connection to completion. The socket is shut down however
    /// the loop ends.
    pub fn run(mut self) {
        if let Err(e) = self.serve() {
            debug!("Connection {} from {} aborted: {}", self.id, self.peer_addr, e);
        }
        self.close();
    }

    fn serve(&mut self) -> ServerResult<()> {
        // Idle keep-alive clients are dropped after this long
        let timeout = Some(self.config.keep_alive_timeout).filter(|t| !t.is_zero());
        self.stream.set_read_timeout(timeout)?;

        let stream = &self.stream;
        let mut reader = BufReader::new(stream);
        let mut writer = BufWriter::new(stream);

        while self.served < self.config.max_requests_per_connection {
            enter(&mut self.state, ConnectionState::AwaitRequest, self.peer_addr);
            self.served += 1;
            let last = self.served == self.config.max_requests_per_connection;

            let next = Self::serve_one(
                &mut self.state,
                last,
                &mut reader,
                &mut writer,
                self.peer_addr,
                &self.config,
                self.resource.as_ref(),
                &self.sessions,
            )?;
            if next == Next::Close {
                break;
            }
        }

        debug!(
            "Connection {} from {} done after {} requests",
            self.id, self.peer_addr, self.served
        );
        Ok(())
    }

    fn serve_one(
        state: &mut ConnectionState,
        last: bool,
        reader: &mut BufReader<&TcpStream>,
        writer: &mut BufWriter<&TcpStream>,
        peer_addr: SocketAddr,
        config: &ServerConfig,
        resource: &dyn Resource,
        sessions: &Arc<SessionStore>,
    ) -> ServerResult<Next> {
        enter(state, ConnectionState::Parse, peer_addr);
        let mut request = Request::new(Some(peer_addr));
        if let Err(e) = request.parse(reader, config) {
            return match e.status() {
                Some(status) => {
                    warn!("Rejecting request from {}: {} ({})", peer_addr, e, status);
                    enter(state, ConnectionState::Respond, peer_addr);
                    let mut response = Response::new(writer, config, false);
                    response.send_error(status)?;
                    response.flush()?;
                    Ok(Next::Close)
                }
                None => match e {
                    RequestError::NoRequest => Ok(Next::Close),
                    other => Err(other.into()),
                },
            };
        }

        enter(state, ConnectionState::Route, peer_addr);
        let mut response = Response::new(writer, config, request.keep_alive() && !last);
        if request.method() == Method::Head {
            response.set_discard_body(true);
        }
        if config.auto_sessions {
            sessions.resolve(&mut request, &mut response, &config.session_cookie_name)?;
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            resource.execute(&mut request, &mut response)
        }));

        enter(state, ConnectionState::Respond, peer_addr);
        let fallback = match outcome {
            Ok(Ok(())) if response.headers_sent() => None,
            Ok(Ok(())) if response.status() != Status::Ok => Some(response.status()),
            Ok(Ok(())) => {
                warn!(
                    "{} /{} produced no response",
                    request.method(),
                    request.location()
                );
                Some(Status::InternalServerError)
            }
            Ok(Err(ServerError::Status(status))) => Some(status),
            Ok(Err(ServerError::Io(e))) if response.headers_sent() => return Err(e.into()),
            Ok(Err(e)) => {
                error!("{} /{} failed: {}", request.method(), request.location(), e);
                Some(Status::InternalServerError)
            }
            Err(_) => {
                error!("{} /{} panicked", request.method(), request.location());
                Some(Status::InternalServerError)
            }
        };

        if let Some(status) = fallback {
            if response.headers_sent() {
                // Too late for an error page; the client sees a cut body
                warn!("Cannot report {} after headers were sent, closing", status);
                response.flush()?;
                return Ok(Next::Close);
            }
            response.send_error(status)?;
        }
        response.flush()?;

        Ok(if response.keep_alive() {
            Next::Continue
        } else {
            Next::Close
        })
    }

    /// Close the connection
    pub fn close(&mut self) {
        enter(&mut self.state, ConnectionState::Closed, self.peer_addr);
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            if e.kind() != io::ErrorKind::NotConnected {
                debug!("Shutdown of connection {} failed: {}", self.id, e);
            }
        }
    }

    /// Get the connection's peer address
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Get the connection's unique ID
    pub fn id(&self) -> usize {
        self.id
    }
}

fn enter(state: &mut ConnectionState, next: ConnectionState, peer_addr: SocketAddr) {
    trace!("{}: {:?} -> {:?}", peer_addr, *state, next);
    *state = next;
}
