use crate::ROLE_LEN;

/// Connection role, announced by the client right after connect and never re-sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    Receiver,
    /// Server-side acknowledgement. Defined on the wire but not sent by the relay.
    Accept,
    /// Server-side refusal. Defined on the wire but not sent by the relay.
    Reject,
}

impl Role {
    pub const fn tag(self) -> [u8; ROLE_LEN] {
        match self {
            Role::Sender => [0xAA, 0x00],
            Role::Receiver => [0xBB, 0x00],
            Role::Accept => [0x01, 0x01],
            Role::Reject => [0x99, 0x99],
        }
    }

    pub fn from_tag(tag: [u8; ROLE_LEN]) -> Option<Self> {
        [Role::Sender, Role::Receiver, Role::Accept, Role::Reject]
            .into_iter()
            .find(|r| r.tag() == tag)
    }

    /// Only senders and receivers may open a connection.
    pub fn client_role(tag: [u8; ROLE_LEN]) -> Option<Self> {
        Self::from_tag(tag).filter(|r| matches!(r, Role::Sender | Role::Receiver))
    }
}
