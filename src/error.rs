use crate::scenario::ScenarioParseError;
use crate::transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum SipFlowError {
    #[error(transparent)]
    ScenarioParse(#[from] ScenarioParseError),
    #[error("Data source parse error: {0}")]
    DataParse(String),
    #[error("Data source exhausted before the call target was met")]
    SourceExhausted,
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Network error: {0}")]
    NetworkError(#[from] std::io::Error),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}
