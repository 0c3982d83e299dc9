/// The current state of a request.
/// This roughly matches net/base/load_states.h
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadState {
    /// The request is idle.
    #[default]
    Idle,

    /// Consulting the HTTP cache.
    WaitingForCache,

    /// Waiting for an available socket.
    WaitingForAvailableSocket,

    /// Connecting to the host.
    Connecting,

    /// Sending the HTTP request.
    SendingRequest,

    /// Waiting for the server response (TTFB).
    WaitingForResponse,

    /// Reading the response body.
    ReadingResponse,
}
