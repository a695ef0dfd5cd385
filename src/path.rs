use std::collections::HashMap;

use tracing::debug;

use crate::{error::TunnelError, tunnel::TransportKind};

/// Remembers which tunnel each proxy session was put on. A session stays on its tunnel for its
/// whole life, even if a better one becomes ready later, so its bytes are never split across paths.
#[derive(Debug, Default)]
pub struct PathSelector {
    assignments: HashMap<u32, TransportKind>,
}

impl PathSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the tunnel for `session_id` and whether the assignment was just created. New
    /// sessions go to the first ready tunnel in [`TransportKind::PRIORITY`] order.
    pub fn resolve(
        &mut self,
        session_id: u32,
        is_ready: impl Fn(TransportKind) -> bool,
    ) -> Result<(TransportKind, bool), TunnelError> {
        if session_id == 0 {
            return Err(TunnelError::InvalidInput("session id must not be zero"));
        }

        if let Some(kind) = self.assignments.get(&session_id) {
            return Ok((*kind, false));
        }

        let kind = TransportKind::PRIORITY
            .into_iter()
            .find(|kind| is_ready(*kind))
            .ok_or(TunnelError::PathUnavailable)?;

        debug!(session_id, %kind, "session assigned");
        self.assignments.insert(session_id, kind);
        Ok((kind, true))
    }

    pub fn get(&self, session_id: u32) -> Option<TransportKind> {
        self.assignments.get(&session_id).copied()
    }

    pub fn release(&mut self, session_id: u32) -> Option<TransportKind> {
        self.assignments.remove(&session_id)
    }

    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn only(ready: &'static [TransportKind]) -> impl Fn(TransportKind) -> bool {
        move |kind| ready.contains(&kind)
    }

    #[test]
    fn test_priority() {
        let mut selector = PathSelector::new();
        assert_eq!(selector.resolve(1, only(&[TransportKind::Relay, TransportKind::Udp])).unwrap(), (TransportKind::Udp, true));
        assert_eq!(selector.resolve(2, only(&[TransportKind::Relay])).unwrap(), (TransportKind::Relay, true));
        assert_eq!(selector.resolve(3, |_| true).unwrap(), (TransportKind::Direct, true));
    }

    #[test]
    fn test_resolve_is_idempotent_and_sticky() {
        let mut selector = PathSelector::new();
        assert_eq!(selector.resolve(7, only(&[TransportKind::Relay])).unwrap(), (TransportKind::Relay, true));
        assert_eq!(selector.resolve(7, only(&[TransportKind::Relay])).unwrap(), (TransportKind::Relay, false));

        // Direct coming up later doesn't move the session, and Relay going down doesn't either.
        assert_eq!(selector.resolve(7, only(&[TransportKind::Direct])).unwrap(), (TransportKind::Relay, false));
        assert_eq!(selector.resolve(7, only(&[])).unwrap(), (TransportKind::Relay, false));
        assert_eq!(selector.len(), 1);
    }

    #[test]
    fn test_nothing_ready() {
        let mut selector = PathSelector::new();
        assert!(matches!(selector.resolve(5, only(&[])), Err(TunnelError::PathUnavailable)));
        assert_eq!(selector.get(5), None);
        assert!(selector.is_empty());
    }

    #[test]
    fn test_session_zero() {
        let mut selector = PathSelector::new();
        assert!(matches!(selector.resolve(0, |_| true), Err(TunnelError::InvalidInput(_))));
        assert!(selector.is_empty());
    }

    #[test]
    fn test_release() {
        let mut selector = PathSelector::new();
        selector.resolve(4, only(&[TransportKind::Udp])).unwrap();
        assert_eq!(selector.release(4), Some(TransportKind::Udp));
        assert_eq!(selector.release(4), None);

        // Released ids are assigned from scratch.
        assert_eq!(selector.resolve(4, only(&[TransportKind::Direct])).unwrap(), (TransportKind::Direct, true));
    }
}
