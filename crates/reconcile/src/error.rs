use std::time::Duration;

use tether_core::StoreError;
use tether_resolve::ReferenceError;

use crate::external::ExternalError;

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("connect: {0}")]
    Connect(String),
    #[error(transparent)]
    Reference(#[from] ReferenceError),
    #[error("external: {0}")]
    External(#[from] ExternalError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("invalid spec: {0}")]
    InvalidSpec(String),
    #[error("reconcile pass exceeded {0:?}")]
    Timeout(Duration),
}

impl ReconcileError {
    /// Everything except a spec that cannot be decoded may heal on its own.
    pub fn is_transient(&self) -> bool { !matches!(self, ReconcileError::InvalidSpec(_)) }

    /// Condition reason for the Ready=False entry.
    pub fn reason(&self) -> &'static str {
        match self {
            ReconcileError::Connect(_) => "ConnectFailed",
            ReconcileError::Reference(e) => e.reason(),
            ReconcileError::External(_) => "ExternalError",
            ReconcileError::Store(_) => "StoreError",
            ReconcileError::InvalidSpec(_) => "InvalidSpec",
            ReconcileError::Timeout(_) => "Timeout",
        }
    }
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;
