/*
 * Copyright (c) The ticketd Authors.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Errors reported by credential stores and the identity machinery built on them.

use std::error::Error as StdError;
use std::fmt;

type BoxError = Box<dyn StdError + Send + Sync>;

/// Step of the renewal flow an error occurred at.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum RenewalPhase {
    /// Looking up the cache's principal.
    LookupPrincipal,
    /// Obtaining renewed credentials from the issuing service.
    ObtainCredentials,
    /// Reinitializing the cache for the renewed contents.
    ReinitializeCache,
    /// Storing the renewed credentials back into the cache.
    StoreCredentials,
}

impl RenewalPhase {
    fn describe(self) -> &'static str {
        match self {
            RenewalPhase::LookupPrincipal => "looking up the cache principal",
            RenewalPhase::ObtainCredentials => "obtaining renewed credentials",
            RenewalPhase::ReinitializeCache => "reinitializing the credentials cache",
            RenewalPhase::StoreCredentials => "storing the renewed credentials",
        }
    }
}

/// Error produced by credential store operations and identity bookkeeping.
#[derive(Debug)]
#[non_exhaustive]
pub enum CredentialsError {
    /// The store context could not be built.
    Initializing {
        /// Underlying cause.
        source: BoxError,
    },
    /// The cache collection could not be watched for changes.
    Monitoring {
        /// What could not be watched and why.
        message: String,
        /// Underlying cause, when one exists.
        source: Option<BoxError>,
    },
    /// Cache inspection failed.
    Verifying {
        /// What failed.
        message: String,
        /// Underlying cause, when one exists.
        source: Option<BoxError>,
    },
    /// The renewal flow failed at a specific step.
    Renewing {
        /// The step that failed.
        phase: RenewalPhase,
        /// Display name of the identity being renewed, when known.
        principal: Option<String>,
        /// What failed.
        message: String,
        /// Underlying cause, when one exists.
        source: Option<BoxError>,
    },
    /// The cache could not be erased.
    Erasing {
        /// What failed.
        message: String,
        /// Underlying cause, when one exists.
        source: Option<BoxError>,
    },
    /// The operation was cancelled before producing a result.
    Cancelled,
}

impl CredentialsError {
    /// Creates an [`CredentialsError::Initializing`] error.
    pub fn initializing(source: impl Into<BoxError>) -> Self {
        Self::Initializing {
            source: source.into(),
        }
    }

    /// Creates a [`CredentialsError::Monitoring`] error.
    pub fn monitoring(message: impl Into<String>) -> Self {
        Self::Monitoring {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a [`CredentialsError::Monitoring`] error with an underlying cause.
    pub fn monitoring_with_source(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Monitoring {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Creates a [`CredentialsError::Verifying`] error.
    pub fn verifying(message: impl Into<String>) -> Self {
        Self::Verifying {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a [`CredentialsError::Verifying`] error with an underlying cause.
    pub fn verifying_with_source(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Verifying {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Creates a [`CredentialsError::Renewing`] error.
    pub fn renewing(phase: RenewalPhase, message: impl Into<String>) -> Self {
        Self::Renewing {
            phase,
            principal: None,
            message: message.into(),
            source: None,
        }
    }

    /// Creates an [`CredentialsError::Erasing`] error.
    pub fn erasing(message: impl Into<String>) -> Self {
        Self::Erasing {
            message: message.into(),
            source: None,
        }
    }

    /// Attaches the display name of the identity a renewal error belongs to.
    pub fn with_principal(self, name: impl Into<String>) -> Self {
        match self {
            Self::Renewing {
                phase,
                message,
                source,
                ..
            } => Self::Renewing {
                phase,
                principal: Some(name.into()),
                message,
                source,
            },
            other => other,
        }
    }

    /// True if this error reports a cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl fmt::Display for CredentialsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initializing { .. } => {
                write!(f, "could not initialize the credential store")
            }
            Self::Monitoring { message, .. } => {
                write!(f, "could not monitor the credential cache collection: {message}")
            }
            Self::Verifying { message, .. } => {
                write!(f, "could not verify identity credentials: {message}")
            }
            Self::Renewing {
                phase,
                principal,
                message,
                ..
            } => {
                write!(f, "could not renew identity")?;
                if let Some(principal) = principal {
                    write!(f, " {principal}")?;
                }
                write!(f, " while {}: {message}", phase.describe())
            }
            Self::Erasing { message, .. } => {
                write!(f, "could not erase identity: {message}")
            }
            Self::Cancelled => write!(f, "the operation was cancelled"),
        }
    }
}

impl StdError for CredentialsError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Initializing { source } => Some(source.as_ref()),
            Self::Monitoring { source, .. }
            | Self::Verifying { source, .. }
            | Self::Renewing { source, .. }
            | Self::Erasing { source, .. } => source.as_deref().map(|err| err as _),
            Self::Cancelled => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renewing_error_carries_phase_and_principal() {
        let err = CredentialsError::renewing(RenewalPhase::ObtainCredentials, "KDC unreachable")
            .with_principal("alice@EXAMPLE.COM");
        assert_eq!(
            err.to_string(),
            "could not renew identity alice@EXAMPLE.COM while obtaining renewed credentials: \
             KDC unreachable"
        );
    }

    #[test]
    fn cancellation_is_distinguishable() {
        assert!(CredentialsError::Cancelled.is_cancelled());
        assert!(!CredentialsError::verifying("oops").is_cancelled());
    }
}
