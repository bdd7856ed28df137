use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard},
};

/// Watches currently owned by a running capture. Shared by every
/// `LiveCapture` so two captures never drive the same watch.
#[derive(Clone, Default)]
pub struct CaptureClaims {
    claimed: Arc<Mutex<HashSet<String>>>,
}

impl CaptureClaims {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim every uid or none. On conflict returns the first uid that is
    /// already taken.
    pub fn claim(&self, uids: &[String]) -> Result<ClaimGuard, String> {
        let mut claimed = self.lock();
        if let Some(taken) = uids.iter().find(|uid| claimed.contains(*uid)) {
            return Err(taken.clone());
        }
        claimed.extend(uids.iter().cloned());
        Ok(ClaimGuard {
            claims: self.clone(),
            uids: uids.to_vec(),
        })
    }

    pub fn is_claimed(&self, uid: &str) -> bool {
        self.lock().contains(uid)
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        match self.claimed.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Releases its uids when dropped.
pub struct ClaimGuard {
    claims: CaptureClaims,
    uids: Vec<String>,
}

impl ClaimGuard {
    /// Give `uid` back early. Returns false if this guard did not hold it.
    pub fn release(&mut self, uid: &str) -> bool {
        let Some(index) = self.uids.iter().position(|held| held == uid) else {
            return false;
        };
        self.uids.swap_remove(index);
        self.claims.lock().remove(uid);
        true
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        let mut claimed = self.claims.lock();
        for uid in &self.uids {
            claimed.remove(uid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uids(list: &[&str]) -> Vec<String> {
        list.iter().map(|uid| uid.to_string()).collect()
    }

    #[test]
    fn overlapping_claims_are_refused_whole() {
        let claims = CaptureClaims::new();
        let first = claims.claim(&uids(&["a", "b"])).unwrap();

        assert_eq!(claims.claim(&uids(&["c", "b"])).err(), Some("b".to_string()));
        // Nothing from the refused claim sticks.
        assert!(!claims.is_claimed("c"));

        drop(first);
        assert!(!claims.is_claimed("a"));
        assert!(claims.claim(&uids(&["b", "c"])).is_ok());
    }

    #[test]
    fn released_uid_can_be_claimed_again() {
        let claims = CaptureClaims::new();
        let mut guard = claims.claim(&uids(&["a", "b"])).unwrap();

        assert!(guard.release("b"));
        assert!(!guard.release("b"));
        assert!(!claims.is_claimed("b"));
        let other = claims.claim(&uids(&["b"])).unwrap();

        // Dropping the first guard leaves the re-claimed uid alone.
        drop(guard);
        assert!(!claims.is_claimed("a"));
        assert!(claims.is_claimed("b"));
        drop(other);
    }
}
