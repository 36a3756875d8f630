//! Client connection lifecycle.
//!
//! The happy path runs linearly from [`ConnectionState::Initial`] to
//! [`ConnectionState::InGame`]; [`ConnectionState::Disconnected`] is reachable
//! from every state and is the starting point of a fresh connect cycle.

use std::fmt;

/// Phases of the client lifecycle, in happy-path order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectionState {
    Initial,
    ConnectingToConnectServer,
    ConnectedToConnectServer,
    RequestingServerList,
    ReceivedServerList,
    RequestingConnectionInfo,
    ReceivedConnectionInfo,
    ConnectingToGameServer,
    ConnectedToGameServer,
    Authenticating,
    SelectingCharacter,
    InGame,
    Disconnected,
}

impl ConnectionState {
    /// True while a transport to either server is expected to be alive.
    pub fn is_connected(self) -> bool {
        !matches!(
            self,
            ConnectionState::Initial
                | ConnectionState::ConnectingToConnectServer
                | ConnectionState::ConnectingToGameServer
                | ConnectionState::Disconnected
        )
    }

    /// True for the phases spent talking to the relay (connect) server.
    pub fn is_relay_phase(self) -> bool {
        matches!(
            self,
            ConnectionState::ConnectingToConnectServer
                | ConnectionState::ConnectedToConnectServer
                | ConnectionState::RequestingServerList
                | ConnectionState::ReceivedServerList
                | ConnectionState::RequestingConnectionInfo
                | ConnectionState::ReceivedConnectionInfo
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Initial => "Initial",
            ConnectionState::ConnectingToConnectServer => "ConnectingToConnectServer",
            ConnectionState::ConnectedToConnectServer => "ConnectedToConnectServer",
            ConnectionState::RequestingServerList => "RequestingServerList",
            ConnectionState::ReceivedServerList => "ReceivedServerList",
            ConnectionState::RequestingConnectionInfo => "RequestingConnectionInfo",
            ConnectionState::ReceivedConnectionInfo => "ReceivedConnectionInfo",
            ConnectionState::ConnectingToGameServer => "ConnectingToGameServer",
            ConnectionState::ConnectedToGameServer => "ConnectedToGameServer",
            ConnectionState::Authenticating => "Authenticating",
            ConnectionState::SelectingCharacter => "SelectingCharacter",
            ConnectionState::InGame => "InGame",
            ConnectionState::Disconnected => "Disconnected",
        }
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Initial
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
