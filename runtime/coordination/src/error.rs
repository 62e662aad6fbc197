use thiserror::Error;

use crate::config::ConfigError;
use crate::{file_system, payment_streams, proofs_dealer, providers};

/// Error returned by every operation of the runtime.
///
/// An operation that returns an error leaves no trace: state, balances and events are rolled
/// back to what they were before the call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("bad origin")]
    BadOrigin,
    #[error("providers: {0}")]
    Providers(#[from] providers::Error),
    #[error("file system: {0}")]
    FileSystem(#[from] file_system::Error),
    #[error("proofs dealer: {0}")]
    ProofsDealer(#[from] proofs_dealer::Error),
    #[error("payment streams: {0}")]
    PaymentStreams(#[from] payment_streams::Error),
    #[error("arithmetic error: {0:?}")]
    Arithmetic(sp_runtime::ArithmeticError),
    #[error("ledger error: {0:?}")]
    Ledger(sp_runtime::DispatchError),
    #[error("invalid runtime parameter: {0}")]
    InvalidParameter(String),
}

impl From<sp_runtime::ArithmeticError> for DispatchError {
    fn from(error: sp_runtime::ArithmeticError) -> Self {
        DispatchError::Arithmetic(error)
    }
}

impl From<sp_runtime::DispatchError> for DispatchError {
    fn from(error: sp_runtime::DispatchError) -> Self {
        match error {
            sp_runtime::DispatchError::Arithmetic(error) => DispatchError::Arithmetic(error),
            other => DispatchError::Ledger(other),
        }
    }
}

impl From<ConfigError> for DispatchError {
    fn from(error: ConfigError) -> Self {
        DispatchError::InvalidParameter(error.to_string())
    }
}

pub type DispatchResult = Result<(), DispatchError>;

/// Unwraps an `Option` (or checks a condition with the `bool` form) that can only be `None`
/// (or false) if an invariant of the runtime is broken.
///
/// Tests panic so that the broken invariant surfaces, everything else gets `$error_type`.
macro_rules! expect_or_err {
    // Handle Option type
    ($optional:expr, $error_msg:expr, $error_type:expr) => {{
        match $optional {
            Some(value) => value,
            None => {
                #[cfg(test)]
                unreachable!($error_msg);

                #[allow(unreachable_code)]
                {
                    log::error!(target: LOG_TARGET, $error_msg);
                    Err($error_type)?
                }
            }
        }
    }};
    // Handle boolean type
    ($condition:expr, $error_msg:expr, $error_type:expr, bool) => {{
        if !$condition {
            #[cfg(test)]
            unreachable!($error_msg);

            #[allow(unreachable_code)]
            {
                log::error!(target: LOG_TARGET, $error_msg);
                Err($error_type)?
            }
        }
    }};
}

pub(crate) use expect_or_err;

/// Returns `$error` from the enclosing function unless `$condition` holds.
macro_rules! ensure {
    ($condition:expr, $error:expr $(,)?) => {{
        if !$condition {
            return Err($error.into());
        }
    }};
}

pub(crate) use ensure;
