//! Device state

/// The device's USB state
///
/// Enumeration moves the device forward: `Powered` on initialization,
/// `Default` after a bus reset, `Addressed` after `SET_ADDRESS`, and
/// `Configured` after `SET_CONFIGURATION`. A suspend enters `Suspended`
/// from any state, and the following wakeup returns to the state that was
/// suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Powered,
    Default,
    Addressed,
    Configured,
    Suspended,
}

impl DeviceState {
    /// Indicates if the device may accept a standard request that changes
    /// its address or configuration.
    pub(crate) fn is_enumerated(self) -> bool {
        matches!(self, DeviceState::Addressed | DeviceState::Configured)
    }

    /// A state number for logging.
    pub(crate) fn code(self) -> u8 {
        self as u8
    }
}

#[cfg(test)]
mod test {
    use super::DeviceState;

    #[test]
    fn enumerated_states() {
        assert!(!DeviceState::Powered.is_enumerated());
        assert!(!DeviceState::Default.is_enumerated());
        assert!(DeviceState::Addressed.is_enumerated());
        assert!(DeviceState::Configured.is_enumerated());
        assert!(!DeviceState::Suspended.is_enumerated());
    }
}
