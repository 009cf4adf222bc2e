//! Logging shims: defmt when the feature is enabled, no-ops otherwise.
//! Same approach as trouble-host's internal fmt module, trimmed to the
//! macros this crate uses.

#![allow(unused_macros)]

macro_rules! trace {
    ($s:literal $(, $x:expr)* $(,)?) => {{
        #[cfg(all(feature = "defmt", not(test)))]
        ::defmt::trace!($s $(, $x)*);
        #[cfg(not(all(feature = "defmt", not(test))))]
        let _ = ($( & $x ),*);
    }};
}

macro_rules! debug {
    ($s:literal $(, $x:expr)* $(,)?) => {{
        #[cfg(all(feature = "defmt", not(test)))]
        ::defmt::debug!($s $(, $x)*);
        #[cfg(not(all(feature = "defmt", not(test))))]
        let _ = ($( & $x ),*);
    }};
}

macro_rules! info {
    ($s:literal $(, $x:expr)* $(,)?) => {{
        #[cfg(all(feature = "defmt", not(test)))]
        ::defmt::info!($s $(, $x)*);
        #[cfg(not(all(feature = "defmt", not(test))))]
        let _ = ($( & $x ),*);
    }};
}

macro_rules! warn {
    ($s:literal $(, $x:expr)* $(,)?) => {{
        #[cfg(all(feature = "defmt", not(test)))]
        ::defmt::warn!($s $(, $x)*);
        #[cfg(not(all(feature = "defmt", not(test))))]
        let _ = ($( & $x ),*);
    }};
}

macro_rules! error {
    ($s:literal $(, $x:expr)* $(,)?) => {{
        #[cfg(all(feature = "defmt", not(test)))]
        ::defmt::error!($s $(, $x)*);
        #[cfg(not(all(feature = "defmt", not(test))))]
        let _ = ($( & $x ),*);
    }};
}
