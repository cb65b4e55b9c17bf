use crate::config::ConfigError;
use link_transport::TransportError;

pub type Result<T> = std::result::Result<T, LinkError>;

#[derive(thiserror::Error, Debug)]
pub enum LinkError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("initial connect failed")]
    Connect(#[source] TransportError),
    #[error("connection lost: {cause}")]
    ConnectionLost { cause: String },
    #[error("transport inbound stream already taken")]
    InboundUnavailable,
    #[error("link task failed: {0}")]
    Task(String),
}
