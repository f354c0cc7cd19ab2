//! Logging interface, contingent on the hidden `__log` feature or the
//! `defmt-03` feature
//!
//! Only enable `__log` when debugging, and when you're certain that your
//! logger isn't using USB! Keep arguments to primitives so that both
//! backends can format them. Format a `UsbDirection` with `{:?}`.

macro_rules! trace {
    ($($args:tt)*) => {{
        #[cfg(feature = "__log")]
        ::__log::trace!($($args)*);
        #[cfg(feature = "defmt-03")]
        ::defmt::trace!($($args)*);
        #[cfg(not(any(feature = "__log", feature = "defmt-03")))]
        let _ = ::core::format_args!($($args)*);
    }};
}

macro_rules! debug {
    ($($args:tt)*) => {{
        #[cfg(feature = "__log")]
        ::__log::debug!($($args)*);
        #[cfg(feature = "defmt-03")]
        ::defmt::debug!($($args)*);
        #[cfg(not(any(feature = "__log", feature = "defmt-03")))]
        let _ = ::core::format_args!($($args)*);
    }};
}

macro_rules! warn {
    ($($args:tt)*) => {{
        #[cfg(feature = "__log")]
        ::__log::warn!($($args)*);
        #[cfg(feature = "defmt-03")]
        ::defmt::warn!($($args)*);
        #[cfg(not(any(feature = "__log", feature = "defmt-03")))]
        let _ = ::core::format_args!($($args)*);
    }};
}
