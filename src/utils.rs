//! Small standalone helpers that don't warrant their own module.

use rand::Rng;

/// Generates a fresh random local peer id for this run's tracker announce
/// and peer handshakes.
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    let mut rng = rand::thread_rng();
    rng.fill(&mut peer_id);
    peer_id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_distinct_ids() {
        assert_ne!(generate_peer_id(), generate_peer_id());
    }
}
