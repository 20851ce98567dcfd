//! Error taxonomy shared by every guard component.
//!
//! Component errors (`LedgerError`, `ModeError`, `AuthError`, ...) live next to
//! the component that raises them. Each reports an [`ErrorKind`], which is what
//! crosses the API boundary as `errorKind`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::allocation::LedgerError;
use crate::gate::{AuthError, OnboardingError};
use crate::mode::ModeError;

/// Category of a failed call as reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed input.
    Validation,
    /// Request conflicts with current state (e.g. removing the primary account).
    Conflict,
    /// Referenced entity does not exist for this user.
    NotFound,
    /// Balance, credential or identity collaborator failed.
    ExternalProvider,
    /// Missing, invalid or expired session token.
    Auth,
    /// Authenticated, but onboarding is not complete for this route.
    OnboardingIncomplete,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Conflict => "conflict",
            ErrorKind::NotFound => "not_found",
            ErrorKind::ExternalProvider => "external_provider",
            ErrorKind::Auth => "auth",
            ErrorKind::OnboardingIncomplete => "onboarding_incomplete",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Any error a guard operation can return to a caller.
#[derive(Debug, Error)]
pub enum GuardError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Mode(#[from] ModeError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Onboarding(#[from] OnboardingError),

    /// Authenticated, but onboarding stops at `step`.
    #[error("onboarding incomplete (step {0})")]
    OnboardingIncomplete(u8),

    /// A precondition spanning several components failed.
    #[error("{0}")]
    Precondition(String),
}

impl GuardError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GuardError::Ledger(e) => e.kind(),
            GuardError::Mode(e) => e.kind(),
            GuardError::Auth(e) => e.kind(),
            GuardError::Onboarding(e) => e.kind(),
            GuardError::OnboardingIncomplete(_) => ErrorKind::OnboardingIncomplete,
            GuardError::Precondition(_) => ErrorKind::Conflict,
        }
    }
}
