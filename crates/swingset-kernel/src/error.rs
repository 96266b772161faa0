use thiserror::Error;

use crate::refs::{KernelRef, VatId, VatRef};
use crate::vat::VatManagerError;

pub type KernelResult<T> = Result<T, KernelError>;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("store error: {0}")]
    Store(#[from] swingset_store::StoreError),
    #[error("failed to encode or decode '{key}': {source}")]
    Codec {
        key: String,
        #[source]
        source: serde_cbor::Error,
    },
    /// Kernel tables disagree with themselves. Always fatal.
    #[error("kernel consistency violation: {0}")]
    Consistency(String),
    #[error("kernel halted after an earlier failure: {0}")]
    Panicked(String),
    #[error("vat manager error: {0}")]
    VatManager(#[from] VatManagerError),
    #[error("unknown vat {0}")]
    UnknownVat(VatId),
    #[error("vat name '{0}' is already taken")]
    DuplicateVatName(String),
    #[error("unknown kernel reference {0}")]
    UnknownRef(KernelRef),
    #[error("promise {kpid} is decided by {decider}, not the kernel")]
    NotKernelDecided { kpid: KernelRef, decider: VatId },
    #[error("promise {0} is already settled")]
    AlreadySettled(KernelRef),
    #[error("promise {0} cannot be resolved to itself")]
    ResolvedToItself(KernelRef),
}

impl KernelError {
    pub(crate) fn consistency(msg: impl Into<String>) -> Self {
        KernelError::Consistency(msg.into())
    }

    /// Errors that leave kernel state in doubt. After one of these the kernel refuses
    /// to run further cranks.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            KernelError::Store(_)
                | KernelError::Codec { .. }
                | KernelError::Consistency(_)
                | KernelError::Panicked(_)
                | KernelError::VatManager(_)
        )
    }
}

/// Vat misuse detected while translating or applying a syscall. Reported back to the vat
/// as a [`crate::vat::VatSyscallResult::Error`]; never fatal to the kernel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyscallError {
    #[error("{0} is not in the c-list")]
    UnknownVref(VatRef),
    #[error("{vref} must be {expected}")]
    WrongKind { vref: VatRef, expected: &'static str },
    #[error("promise {0} is not decided by this vat")]
    NotDecider(VatRef),
    #[error("promise {0} is already resolved")]
    AlreadyResolved(VatRef),
    #[error("{0} is still reachable")]
    StillReachable(VatRef),
    #[error("{0} was already retired and cannot be exported again")]
    RetiredVref(VatRef),
    #[error("promise {0} cannot be resolved to itself")]
    ResolvedToItself(VatRef),
    #[error("{0} appears twice in one batch")]
    Duplicate(VatRef),
    #[error("invalid vatstore key '{0}'")]
    BadVatstoreKey(String),
    #[error("vat already asked to exit")]
    AlreadyExiting,
}

/// Either the vat did something wrong, or the kernel failed while serving it.
#[derive(Debug, Error)]
pub enum SyscallFailure {
    #[error(transparent)]
    Vat(#[from] SyscallError),
    #[error(transparent)]
    Kernel(#[from] KernelError),
}

impl From<swingset_store::StoreError> for SyscallFailure {
    fn from(err: swingset_store::StoreError) -> Self {
        SyscallFailure::Kernel(err.into())
    }
}
