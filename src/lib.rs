pub mod ber;
pub mod bind;
pub mod catch_all;
pub mod config;
pub mod directory;
pub mod event;
pub mod extended;
pub mod ldap_handler;
pub mod ldap_protocol;
pub mod metrics;
pub mod response;
pub mod search;
pub mod server;
pub mod tls;

pub use config::Config;
pub use event::{Event, EventLog, EventSink};
pub use ldap_handler::{HandlerChain, Session};
pub use metrics::{Metrics, run_metrics_server};
pub use server::{HoneypotServer, ServerContext};
