//! Result codes and the engine's error type.
//!
//! The console reports failures as packed 32-bit result codes. Every
//! [`KhaxError`] maps to one so that the C-style entry point can hand a plain
//! number back to its caller, and to a [`FailureClass`] describing how much
//! kernel state a failure may have left behind.

use crate::exploit::TechniqueKind;
use crate::memory::{KernelAddr, VirtAddr};
use crate::version::SystemVersion;
use serde::Serialize;
use thiserror::Error;

/// Module id used for every result code this crate generates.
pub const KHAX_MODULE: u32 = 254;

/// A packed console result code (`level | summary | module | description`).
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ResultCode(u32);

impl ResultCode {
    /// The success code.
    pub const SUCCESS: ResultCode = ResultCode(0);
    /// Address arbitration on an unmapped address.
    pub const INVALID_ADDRESS: ResultCode = ResultCode(0xD900_1814);
    /// A wait with a timeout expired.
    pub const TIMEOUT: ResultCode = ResultCode(0x0940_1BFE);
    /// A parameter was out of range (e.g. an invalid processor id).
    pub const OUT_OF_RANGE: ResultCode = ResultCode(0xD8E0_07FD);
    /// The handle does not name an object of the expected type.
    pub const INVALID_HANDLE: ResultCode = ResultCode(0xD8E0_07F7);
    /// The service manager refused access to a service.
    pub const NOT_AUTHORIZED: ResultCode = ResultCode(0xD8E0_6406);

    /// Wraps a raw code.
    pub const fn new(raw: u32) -> Self {
        ResultCode(raw)
    }

    /// Packs the four fields of a result code.
    pub const fn make(level: u32, summary: u32, module: u32, description: u32) -> Self {
        ResultCode((level << 27) + (summary << 21) + (module << 10) + description)
    }

    /// The raw 32-bit value.
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Returns `true` for `0`.
    pub const fn is_success(self) -> bool {
        self.0 == 0
    }

    /// Severity field.
    pub const fn level(self) -> u32 {
        self.0 >> 27
    }

    /// Summary field.
    pub const fn summary(self) -> u32 {
        (self.0 >> 21) & 0x3F
    }

    /// Originating module.
    pub const fn module(self) -> u32 {
        (self.0 >> 10) & 0xFF
    }

    /// Description field.
    pub const fn description(self) -> u32 {
        self.0 & 0x3FF
    }
}

impl std::fmt::Debug for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ResultCode(0x{:08x})", self.0)
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// How much damage a failure may have done.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum FailureClass {
    /// The running kernel is not in the version table. Nothing was touched.
    VersionUnrecognized,
    /// A step was invoked out of order. Nothing was touched.
    Sequencing,
    /// The host ran out of memory or returned unusable memory.
    Allocation,
    /// The kernel's free-list metadata did not match the prediction. Always
    /// detected before any corrupting write.
    LayoutMismatch,
    /// A failure between a corrupting write and its repair.
    Corrupting,
    /// Any other host call failure.
    Host,
}

/// Errors produced by the exploitation engine.
#[derive(Debug, Error)]
pub enum KhaxError {
    /// The running kernel is not in the version table.
    #[error("unknown kernel version {kernel} (new 3DS: {new_3ds})")]
    UnknownVersion {
        /// Reported kernel version
        kernel: SystemVersion,
        /// Reported hardware variant
        new_3ds: bool,
    },
    /// A step was invoked out of order.
    #[error("{session}: step {requested} invoked but the next step is {expected}")]
    Sequence {
        /// Session name
        session: &'static str,
        /// Step that was called
        requested: u32,
        /// Step that was expected
        expected: u32,
    },
    /// A host call failed.
    #[error("{op} failed: {code}")]
    Host {
        /// Host operation name
        op: &'static str,
        /// Code the host returned
        code: ResultCode,
    },
    /// Linear memory came back without page alignment.
    #[error("linear allocation returned misaligned address {0}")]
    Misaligned(VirtAddr),
    /// A user-space allocation failed.
    #[error("failed to allocate {0} bytes of linear memory")]
    OutOfMemory(usize),
    /// A user address does not translate into the kernel's FCRAM window.
    #[error("address {0} does not translate to a kernel address")]
    Translation(VirtAddr),
    /// Freed-page metadata did not match the expected layout.
    #[error("free block layout mismatch on page {page}: {field} is {actual}, expected {expected}")]
    LayoutMismatch {
        /// Page index inside the session's page set
        page: usize,
        /// Field that mismatched
        field: &'static str,
        /// Predicted value
        expected: KernelAddr,
        /// Observed value
        actual: KernelAddr,
    },
    /// The corrupted syscall did not hand back the payload's sentinel.
    #[error("corrupted syscall returned 0x{0:08x} instead of the payload sentinel")]
    Trigger(u32),
    /// The kernel-mode payload never ran.
    #[error("kernel payload did not run")]
    PayloadNotRun,
    /// The process id did not read back as expected.
    #[error("process id mismatch: expected {expected}, read {actual}")]
    ProcessId {
        /// Expected id
        expected: u32,
        /// Observed id
        actual: u32,
    },
    /// A bounded busy-wait ran out of time.
    #[error("timed out waiting for {0}")]
    RaceTimeout(&'static str),
    /// The race produced a mapping other than the predicted one.
    #[error("race lost: {0}")]
    RaceLost(&'static str),
    /// A kernel object address fell outside the object pool.
    #[error("kernel object {0} is outside the object pool")]
    ObjectOutsidePool(KernelAddr),
    /// A helper thread panicked or vanished.
    #[error("helper thread did not return a result")]
    HelperThread,
    /// Another session already owns the process-wide slot.
    #[error("another exploit session is already active")]
    SessionActive,
    /// The descriptor does not carry what the technique needs.
    #[error("{kernel} does not support {technique:?}")]
    Unsupported {
        /// Kernel version of the descriptor
        kernel: SystemVersion,
        /// Requested technique
        technique: TechniqueKind,
    },
}

impl KhaxError {
    /// Failure class of this error.
    pub fn class(&self) -> FailureClass {
        match self {
            KhaxError::UnknownVersion { .. } | KhaxError::Unsupported { .. } => {
                FailureClass::VersionUnrecognized
            }
            KhaxError::Sequence { .. } | KhaxError::SessionActive => FailureClass::Sequencing,
            KhaxError::Misaligned(_) | KhaxError::OutOfMemory(_) | KhaxError::Translation(_) => {
                FailureClass::Allocation
            }
            KhaxError::LayoutMismatch { .. } => FailureClass::LayoutMismatch,
            KhaxError::Trigger(_)
            | KhaxError::PayloadNotRun
            | KhaxError::RaceTimeout(_)
            | KhaxError::RaceLost(_)
            | KhaxError::ObjectOutsidePool(_)
            | KhaxError::HelperThread => FailureClass::Corrupting,
            KhaxError::Host { .. } | KhaxError::ProcessId { .. } => FailureClass::Host,
        }
    }

    /// Encoded result code for this error.
    pub fn code(&self) -> ResultCode {
        match self {
            KhaxError::UnknownVersion { .. } => ResultCode::make(27, 6, KHAX_MODULE, 39),
            KhaxError::Unsupported { .. } => ResultCode::make(27, 6, KHAX_MODULE, 40),
            KhaxError::Sequence { .. } => ResultCode::make(28, 5, KHAX_MODULE, 1016),
            KhaxError::SessionActive => ResultCode::make(28, 5, KHAX_MODULE, 1017),
            KhaxError::Host { code, .. } => *code,
            KhaxError::Misaligned(_) => ResultCode::make(26, 7, KHAX_MODULE, 1009),
            KhaxError::OutOfMemory(_) => ResultCode::make(26, 3, KHAX_MODULE, 1011),
            KhaxError::Translation(_) => ResultCode::make(26, 7, KHAX_MODULE, 1010),
            KhaxError::LayoutMismatch { .. } => ResultCode::make(26, 5, KHAX_MODULE, 1014),
            KhaxError::Trigger(_) => ResultCode::make(27, 11, KHAX_MODULE, 1023),
            KhaxError::PayloadNotRun => ResultCode::make(27, 11, KHAX_MODULE, 1022),
            KhaxError::ProcessId { .. } => ResultCode::make(27, 11, KHAX_MODULE, 1021),
            KhaxError::RaceTimeout(_) => ResultCode::make(27, 9, KHAX_MODULE, 1020),
            KhaxError::RaceLost(_) => ResultCode::make(27, 9, KHAX_MODULE, 1019),
            KhaxError::ObjectOutsidePool(_) => ResultCode::make(27, 7, KHAX_MODULE, 1018),
            KhaxError::HelperThread => ResultCode::make(27, 9, KHAX_MODULE, 1015),
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, KhaxError>;

/// Attaches the host operation name to a raw result code.
pub trait HostOp<T> {
    /// Converts the host result into a [`KhaxError::Host`] tagged with `op`.
    fn op(self, op: &'static str) -> Result<T>;
}

impl<T> HostOp<T> for std::result::Result<T, ResultCode> {
    fn op(self, op: &'static str) -> Result<T> {
        self.map_err(|code| KhaxError::Host { op, code })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_code_fields_round_trip() {
        let code = ResultCode::make(26, 5, KHAX_MODULE, 1014);
        assert_eq!(code.level(), 26);
        assert_eq!(code.summary(), 5);
        assert_eq!(code.module(), KHAX_MODULE);
        assert_eq!(code.description(), 1014);
    }

    #[test]
    fn unknown_version_code_matches_console_format() {
        let err = KhaxError::UnknownVersion {
            kernel: SystemVersion::new(2, 33, 0),
            new_3ds: false,
        };
        assert_eq!(err.code().raw(), (27 << 27) + (6 << 21) + (254 << 10) + 39);
        assert_eq!(err.class(), FailureClass::VersionUnrecognized);
    }

    #[test]
    fn host_errors_keep_their_code() {
        let err: Result<()> = Err(ResultCode::OUT_OF_RANGE).op("svcCreateThread");
        let err = err.unwrap_err();
        assert_eq!(err.code(), ResultCode::OUT_OF_RANGE);
        assert_eq!(err.to_string(), "svcCreateThread failed: 0xd8e007fd");
    }

    #[test]
    fn failure_codes_are_never_success() {
        let errors = [
            KhaxError::PayloadNotRun,
            KhaxError::SessionActive,
            KhaxError::OutOfMemory(64),
            KhaxError::Trigger(0),
        ];
        for err in errors {
            assert!(!err.code().is_success(), "{}", err);
        }
    }
}
