#[derive(thiserror::Error, Debug)]
pub(crate) enum ServerError {
    #[error("domain {0} is already bound")]
    DomainTaken(String),
    #[error("missing Upgrade header")]
    MissingUpgradeHeader,
    #[error("invalid host key path")]
    InvalidKeyPath,
}
