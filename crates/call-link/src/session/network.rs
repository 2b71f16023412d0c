//! Network classification from gathered candidates

use super::NetworkType;
use crate::peer::CandidateType;

/// Watches one link's local candidates and classifies the network
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkClassifier {
    host: usize,
    reflexive: usize,
    relay: usize,
    finished: bool,
}

impl NetworkClassifier {
    /// Create an empty classifier
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a candidate
    ///
    /// Returns `Some(Open)` on the first reflexive candidate: one is enough
    /// to know direct paths work, no need to wait for gathering to end.
    pub fn observe(&mut self, kind: CandidateType) -> Option<NetworkType> {
        if self.finished {
            return None;
        }

        match kind {
            CandidateType::Host => self.host += 1,
            CandidateType::ServerReflexive | CandidateType::PeerReflexive => {
                self.reflexive += 1;
                if self.reflexive == 1 {
                    return Some(NetworkType::Open);
                }
            }
            CandidateType::Relay => self.relay += 1,
        }
        None
    }

    /// Gathering ended (or timed out); classify from what was seen
    ///
    /// Returns `None` if classification had already finished.
    pub fn finish(&mut self) -> Option<NetworkType> {
        if self.finished {
            return None;
        }
        self.finished = true;
        Some(self.classify())
    }

    /// Classification from the candidates seen so far
    pub fn classify(&self) -> NetworkType {
        if self.reflexive > 0 {
            NetworkType::Open
        } else if self.relay > 0 {
            NetworkType::Moderate
        } else {
            NetworkType::Restrictive
        }
    }

    /// Whether gathering has been declared complete
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Candidates seen so far
    pub fn candidate_count(&self) -> usize {
        self.host + self.reflexive + self.relay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reflexive_classifies_open_immediately() {
        let mut classifier = NetworkClassifier::new();
        assert_eq!(classifier.observe(CandidateType::Host), None);
        assert_eq!(
            classifier.observe(CandidateType::ServerReflexive),
            Some(NetworkType::Open)
        );
        assert_eq!(classifier.observe(CandidateType::ServerReflexive), None);
        assert_eq!(classifier.finish(), Some(NetworkType::Open));
    }

    #[test]
    fn test_relay_without_reflexive_is_moderate() {
        let mut classifier = NetworkClassifier::new();
        classifier.observe(CandidateType::Host);
        classifier.observe(CandidateType::Relay);
        assert_eq!(classifier.finish(), Some(NetworkType::Moderate));
    }

    #[test]
    fn test_host_only_is_restrictive() {
        let mut classifier = NetworkClassifier::new();
        classifier.observe(CandidateType::Host);
        assert_eq!(classifier.finish(), Some(NetworkType::Restrictive));
        assert_eq!(classifier.candidate_count(), 1);
    }

    #[test]
    fn test_finish_is_once() {
        let mut classifier = NetworkClassifier::new();
        assert!(classifier.finish().is_some());
        assert!(classifier.is_finished());
        assert!(classifier.finish().is_none());
        assert_eq!(classifier.observe(CandidateType::ServerReflexive), None);
    }
}
