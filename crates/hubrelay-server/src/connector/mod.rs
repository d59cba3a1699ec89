//! Hub connector: live sessions and correlated dispatch.

pub mod service;
pub mod session;

pub use service::ConnectorService;
