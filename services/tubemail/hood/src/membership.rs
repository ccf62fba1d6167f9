//! Membership bookkeeping of the hood actor.
//!
//! An identity is reserved when a session asks for admission and stays
//! reserved until that session ends. At most one session holds a given id.

use std::collections::HashMap;
use std::net::IpAddr;
use tubemail_session::{NeighError, SessionKey};
use tubemail_wire::{Iam, PeerId};

#[derive(Debug, Clone, Copy)]
struct Claim {
    host: IpAddr,
    iam: Iam,
}

/// Reserved identities and where their owners listen
#[derive(Debug, Default)]
pub(crate) struct Membership {
    owners: HashMap<PeerId, SessionKey>,
    claims: HashMap<SessionKey, Claim>,
}

impl Membership {
    /// Reserve `iam.id` for `key`, refusing ids another session owns
    pub(crate) fn reserve(&mut self, key: SessionKey, host: IpAddr, iam: Iam) -> Result<(), NeighError> {
        match self.owners.get(&iam.id) {
            Some(owner) if *owner != key => Err(NeighError::AlreadyConnected),
            _ => {
                self.owners.insert(iam.id, key);
                self.claims.insert(key, Claim { host, iam });
                Ok(())
            }
        }
    }

    /// Drop whatever `key` reserved
    pub(crate) fn release(&mut self, key: SessionKey) -> Option<PeerId> {
        let claim = self.claims.remove(&key)?;
        if self.owners.get(&claim.iam.id) == Some(&key) {
            self.owners.remove(&claim.iam.id);
        }
        Some(claim.iam.id)
    }

    /// Whether a session owns `id`, or a peer listening on `host:port`
    pub(crate) fn covers(&self, host: IpAddr, port: u16, id: Option<PeerId>) -> bool {
        if id.is_some_and(|id| self.owners.contains_key(&id)) {
            return true;
        }
        self.claims
            .values()
            .any(|claim| claim.host == host && claim.iam.port == port)
    }

    /// Whether `key` holds a reservation
    pub(crate) fn admitted(&self, key: SessionKey) -> bool {
        self.claims.contains_key(&key)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.owners.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tubemail_wire::ID_SIZE;

    fn iam(first: u8, port: u16) -> Iam {
        let mut bytes = [0x11; ID_SIZE];
        bytes[0] = first;
        Iam {
            id: PeerId::from_bytes(bytes),
            port,
        }
    }

    fn host(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    #[test]
    fn test_duplicate_id_is_refused() {
        let mut m = Membership::default();
        m.reserve(1, host(1), iam(1, 4816)).unwrap();
        let err = m.reserve(2, host(2), iam(1, 4817)).unwrap_err();
        assert!(matches!(err, NeighError::AlreadyConnected));
        assert_eq!(m.len(), 1);

        // The refused session releasing must not free the owner's id
        assert_eq!(m.release(2), None);
        assert!(m.covers(host(9), 9, Some(iam(1, 0).id)));
    }

    #[test]
    fn test_release_frees_id() {
        let mut m = Membership::default();
        m.reserve(1, host(1), iam(1, 4816)).unwrap();
        assert!(m.admitted(1));
        assert_eq!(m.release(1), Some(iam(1, 0).id));
        assert_eq!(m.len(), 0);
        assert!(!m.admitted(1));
        m.reserve(2, host(1), iam(1, 4816)).unwrap();
    }

    #[test]
    fn test_covers_by_id_or_address() {
        let mut m = Membership::default();
        m.reserve(1, host(1), iam(1, 4816)).unwrap();

        assert!(m.covers(host(1), 4816, None));
        assert!(m.covers(host(7), 1, Some(iam(1, 0).id)));
        assert!(!m.covers(host(1), 4817, None));
        assert!(!m.covers(host(2), 4816, Some(iam(2, 0).id)));
    }
}
