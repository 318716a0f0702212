use log::error;
use std::fmt;

/// Result of a call into a backend's native API.
pub type NativeResult<T> = Result<T, NativeError>;

/// Native failure codes, grouped by how the device layer reacts to them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeError {
    /// System memory ran out while allocating.
    OutOfMemory,
    /// The adapter ran out of memory for a resource.
    OutOfVideoMemory,
    /// The device was lost (driver reset, exclusive fullscreen taken, ...).
    DeviceLost,
    /// The device was lost and is now ready to be reset.
    DeviceNotReset,
    /// Anything else. Carries the raw native code.
    Fault(u32),
}

impl NativeError {
    /// HRESULT-style code used in diagnostics.
    pub const fn code(self) -> u32 {
        match self {
            Self::OutOfMemory => 0x8007_000E,
            Self::OutOfVideoMemory => 0x8876_017C,
            Self::DeviceLost => 0x8876_0868,
            Self::DeviceNotReset => 0x8876_0869,
            Self::Fault(code) => code,
        }
    }

    /// Resource exhaustion: recoverable by dropping into the lost state.
    pub const fn is_exhaustion(self) -> bool {
        matches!(self, Self::OutOfMemory | Self::OutOfVideoMemory)
    }

    /// Anything the device layer turns into a context loss instead of an abort.
    pub const fn is_recoverable(self) -> bool {
        matches!(
            self,
            Self::OutOfMemory | Self::OutOfVideoMemory | Self::DeviceLost | Self::DeviceNotReset
        )
    }
}

impl fmt::Display for NativeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::OutOfMemory => "out of memory",
            Self::OutOfVideoMemory => "out of video memory",
            Self::DeviceLost => "device lost",
            Self::DeviceNotReset => "device not reset",
            Self::Fault(_) => "native fault",
        };
        write!(f, "{name} (0x{:08X})", self.code())
    }
}

impl std::error::Error for NativeError {}

/// Logs and aborts on an unrecoverable native failure.
///
/// Continuing after one of these would leave GPU state nobody can reason
/// about, so there is no way back. Release builds abort on panic.
#[cold]
#[track_caller]
pub fn fatal(err: NativeError, context: &str) -> ! {
    error!("{context} failed: {err}");
    panic!("{context} failed: {err}");
}

/// Aborts on a broken usage contract that has no native code attached.
#[cold]
#[track_caller]
pub fn fatal_msg(msg: &str) -> ! {
    error!("{msg}");
    panic!("{msg}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhaustion_is_recoverable() {
        for err in [NativeError::OutOfMemory, NativeError::OutOfVideoMemory] {
            assert!(err.is_exhaustion());
            assert!(err.is_recoverable());
        }
        assert!(!NativeError::DeviceLost.is_exhaustion());
        assert!(!NativeError::Fault(0x8000_4005).is_recoverable());
    }

    #[test]
    fn display_embeds_code() {
        let text = NativeError::Fault(0x8876_086C).to_string();
        assert!(text.contains("0x8876086C"), "got {text}");
    }

    #[test]
    #[should_panic(expected = "0x80004005")]
    fn fatal_panics_with_code() {
        fatal(NativeError::Fault(0x8000_4005), "Binding render target");
    }
}
