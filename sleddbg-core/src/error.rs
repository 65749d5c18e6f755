//! Error taxonomy for the debugger core.
//!
//! Every public entry point returns one of these variants. The numeric
//! codes returned by [`Error::code`] are part of the wire-adjacent ABI
//! shared with IDE-side tooling and must never change.

use thiserror::Error;

/// Errors produced by the debugger core.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid network protocol")]
    InvalidProtocol,

    #[error("debugger not initialized")]
    NotInitialized,

    #[error("networking already started")]
    AlreadyNetworking,

    #[error("plugin with the same id already added")]
    PluginAlreadyAdded,

    #[error("invalid plugin")]
    InvalidPlugin,

    #[error("maximum number of plugins reached")]
    MaxPluginsReached,

    #[error("recursive call to update")]
    RecursiveUpdate,

    #[error("network subsystem failure")]
    NetSubsystemFail,

    #[error("failed to change socket blocking mode")]
    TcpNonBlockingFail,

    #[error("tcp listen failed")]
    TcpListenFail,

    #[error("tcp bind failed")]
    TcpBindFail,

    #[error("tcp socket initialization failed")]
    TcpSocketInitFail,

    #[error("tcp socket invalid")]
    TcpSocketInvalid,

    #[error("tcp socket not connected")]
    TcpNotConnected,

    #[error("tcp select-for-write failed")]
    TcpFailSelectWrite,

    #[error("networking not started")]
    NotNetworking,

    #[error("protocol negotiation with the client failed")]
    Negotiation,

    #[error("invalid value in configuration")]
    InvalidConfiguration,

    #[error("null parameter")]
    NullParameter,

    #[error("invalid parameter")]
    InvalidParameter,

    #[error("no client connected")]
    NoClientConnected,

    #[error("alignment is not a power of two")]
    NotAligned,

    #[error("invalid state")]
    InvalidState,

    #[error("no such entry")]
    NoSearch,

    #[error("buffer capacity exceeded")]
    BufferOverflow,
}

impl Error {
    /// Stable numeric code for this error.
    ///
    /// The values mirror the historical `0x8083xxxx` code space and are
    /// frozen; new variants extend the space, existing values never move.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub const fn code(self) -> i32 {
        let raw: u32 = match self {
            Self::InvalidProtocol => 0x8083_0001,
            Self::NotInitialized => 0x8083_0002,
            Self::AlreadyNetworking => 0x8083_0003,
            Self::PluginAlreadyAdded => 0x8083_0004,
            Self::InvalidPlugin => 0x8083_0005,
            Self::MaxPluginsReached => 0x8083_0006,
            Self::RecursiveUpdate => 0x8083_0007,
            Self::NetSubsystemFail => 0x8083_0008,
            Self::TcpNonBlockingFail => 0x8083_0009,
            Self::TcpListenFail => 0x8083_0010,
            Self::TcpBindFail => 0x8083_0011,
            Self::TcpSocketInitFail => 0x8083_0012,
            Self::TcpSocketInvalid => 0x8083_0013,
            Self::TcpNotConnected => 0x8083_0014,
            Self::TcpFailSelectWrite => 0x8083_0015,
            Self::NotNetworking => 0x8083_0016,
            Self::Negotiation => 0x8083_0017,
            Self::InvalidConfiguration => 0x8083_0036,
            Self::NullParameter => 0x8083_0037,
            Self::InvalidParameter => 0x8083_0038,
            Self::NoClientConnected => 0x8083_0039,
            Self::NotAligned => 0x8083_0040,
            Self::InvalidState => 0x8083_0041,
            Self::NoSearch => 0x8083_0042,
            Self::BufferOverflow => 0x8083_0043,
        };
        raw as i32
    }
}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::InvalidProtocol.code() as u32, 0x8083_0001);
        assert_eq!(Error::RecursiveUpdate.code() as u32, 0x8083_0007);
        assert_eq!(Error::NoClientConnected.code() as u32, 0x8083_0039);
        assert_eq!(Error::NoSearch.code() as u32, 0x8083_0042);
    }

    #[test]
    fn codes_are_negative_as_i32() {
        assert!(Error::Negotiation.code() < 0);
        assert!(Error::NotNetworking.code() < 0);
    }
}
