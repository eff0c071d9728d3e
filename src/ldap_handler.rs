use crate::ber::Packet;
use crate::bind::{BindCheck, BindHandler};
use crate::catch_all::CatchAllHandler;
use crate::event::EventLog;
use crate::extended::ExtendedHandler;
use crate::search::{SearchFunc, SearchHandler};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

/// Authentication level of a connection. Starts anonymous; changes only on bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthState {
    #[default]
    Anonymous,
    User,
    Admin,
}

impl AuthState {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthState::Anonymous => "anonymous",
            AuthState::User => "user",
            AuthState::Admin => "admin",
        }
    }
}

/// Whether the connection may still be upgraded to TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsState {
    /// No TLS configuration loaded.
    Unavailable,
    Available,
    /// StartTLS accepted; upgrade happens once the response is flushed.
    Requested,
    Active,
}

/// Mutable per-connection state handed to every handler.
#[derive(Debug, Clone)]
pub struct Session {
    pub peer: SocketAddr,
    pub local: Option<SocketAddr>,
    pub auth: AuthState,
    pub login: Option<String>,
    pub tls: TlsState,
}

impl Session {
    pub fn new(peer: SocketAddr, local: Option<SocketAddr>, tls: TlsState) -> Self {
        Self {
            peer,
            local,
            auth: AuthState::Anonymous,
            login: None,
            tls,
        }
    }

    /// Record a successful bind as `name`.
    pub fn authenticate(&mut self, name: &str) {
        self.auth = match name {
            "" => AuthState::Anonymous,
            "admin" | "root" => AuthState::Admin,
            _ => AuthState::User,
        };
        self.login = if name.is_empty() {
            None
        } else {
            Some(name.to_string())
        };
    }

    /// Failed binds drop any earlier authentication.
    pub fn reset_auth(&mut self) {
        self.auth = AuthState::Anonymous;
        self.login = None;
    }

    /// Mark the connection for a StartTLS upgrade. Returns false when TLS is not
    /// configured or the stream is already encrypted (or an upgrade is pending).
    pub fn request_start_tls(&mut self) -> bool {
        if self.tls == TlsState::Available {
            self.tls = TlsState::Requested;
            true
        } else {
            false
        }
    }

    /// Consume a pending upgrade request.
    pub fn take_tls_request(&mut self) -> bool {
        if self.tls == TlsState::Requested {
            self.tls = TlsState::Active;
            true
        } else {
            false
        }
    }
}

/// Result of offering a request to one handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Claimed; the packets (possibly none) are the complete reply.
    Handled(Vec<Packet>),
    NotMine,
}

pub trait RequestHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn handle(&self, packet: &Packet, session: &mut Session, log: &mut EventLog) -> Outcome;
}

/// Ordered list of handlers; the first to claim a request wins.
pub struct HandlerChain {
    handlers: Vec<Box<dyn RequestHandler>>,
}

impl HandlerChain {
    pub fn new(handlers: Vec<Box<dyn RequestHandler>>) -> Self {
        Self { handlers }
    }

    /// Extended, Bind, Search, then the catch-all.
    pub fn standard(bind_check: Arc<dyn BindCheck>, search: Arc<dyn SearchFunc>) -> Self {
        Self::new(vec![
            Box::new(ExtendedHandler),
            Box::new(BindHandler::new(bind_check)),
            Box::new(SearchHandler::new(search)),
            Box::new(CatchAllHandler),
        ])
    }

    /// Returns None when no handler claimed the request.
    pub fn dispatch(&self, packet: &Packet, session: &mut Session, log: &mut EventLog) -> Option<Vec<Packet>> {
        for handler in &self.handlers {
            if let Outcome::Handled(packets) = handler.handle(packet, session, log) {
                debug!("Request claimed by {} handler ({} packets)", handler.name(), packets.len());
                return Some(packets);
            }
        }
        None
    }
}
