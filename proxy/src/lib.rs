#![deny(clippy::print_stdout, clippy::print_stderr)]

mod admin;
mod certs;
mod config;
mod filter;
mod http_proxy;
mod logging;
mod mitm;
mod proxy;
mod responses;
mod schedule;
mod state;
mod upstream;
mod url_match;

pub use certs::CertAuthority;
pub use config::Config;
pub use config::LogsConfig;
pub use config::Policy;
pub use filter::Access;
pub use filter::EntryView;
pub use filter::Filter;
pub use filter::PolicyEntry;
pub use logging::AccessLog;
pub use logging::AccessLogger;
pub use logging::HttpLog;
pub use proxy::Args;
pub use proxy::Proxy;
pub use proxy::ProxyHandle;
pub use schedule::TimeOfDay;
pub use schedule::TimeRange;
pub use state::ProxyState;
pub use url_match::PathTrie;
pub use url_match::UrlMatch;
