use dashmap::DashSet;
use thingwire_core::CorrelationId;

/// Correlation ids currently owned by a pending request or an
/// acknowledgement set. An id is claimed by at most one of them.
#[derive(Debug, Default)]
pub struct ClaimSet {
    claimed: DashSet<CorrelationId>,
}

impl ClaimSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the id is already taken.
    pub fn claim(&self, id: &CorrelationId) -> bool {
        self.claimed.insert(id.clone())
    }

    pub fn release(&self, id: &CorrelationId) {
        let _ = self.claimed.remove(id);
    }

    pub fn is_claimed(&self, id: &CorrelationId) -> bool {
        self.claimed.contains(id)
    }

    pub fn len(&self) -> usize {
        self.claimed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claimed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_is_exclusive_until_released() {
        let claims = ClaimSet::new();
        let id = CorrelationId::from_raw("c-1");
        assert!(claims.claim(&id));
        assert!(!claims.claim(&id));
        claims.release(&id);
        assert!(!claims.is_claimed(&id));
        assert!(claims.claim(&id));
    }
}
