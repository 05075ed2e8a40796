#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ConnState {

    NotConnected,

    // Outbound transport connect in progress.
    AwaitConnection,

    // Our handshake is written, waiting for theirs.
    AwaitHandshake,

    Connected,

    Closed,

    ClosedWithError,

    // Transport connect never succeeded.
    Failed,

    // Removed from the client, nothing may reference it anymore.
    Deinitialized,

}

impl ConnState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnState::Closed | ConnState::ClosedWithError | ConnState::Failed | ConnState::Deinitialized
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionState {

    // Whether we are refusing the peer's requests.
    pub am_choking: bool,

    // Whether we want pieces the peer has.
    pub am_interested: bool,

    // Whether the peer is refusing our requests.
    pub peer_choking: bool,

    // Whether the peer wants pieces we have.
    pub peer_interested: bool,

    // Pieces the peer has announced.
    pub num_pieces: usize,

}

impl Default for SessionState {
    fn default() -> SessionState {
        SessionState {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            num_pieces: 0,
        }
    }
}
