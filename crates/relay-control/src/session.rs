//! Session tickets issued to registered backends
//!
//! A ticket is an opaque blob handed to the agent in every `Registered`
//! reply. Presenting it in a `Reconnect` proves the agent is the same one
//! that held the registration, so the relay can restore the entry held during
//! the grace period. Tickets are single-use: every successful resume rotates
//! the ticket.

use rand::RngCore;

pub const TICKET_LEN: usize = 32;

#[derive(Clone, PartialEq, Eq)]
pub struct SessionTicket([u8; TICKET_LEN]);

impl SessionTicket {
    pub fn generate() -> Self {
        let mut bytes = [0u8; TICKET_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// Constant-time comparison against a presented ticket
    pub fn matches(&self, presented: &[u8]) -> bool {
        if presented.len() != TICKET_LEN {
            return false;
        }
        self.0
            .iter()
            .zip(presented)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl std::fmt::Debug for SessionTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionTicket({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}
