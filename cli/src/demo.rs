// Synthetic announce traffic for watching the loop without a live mesh.

use meshrelay_core::{AnnounceStore, CandidateRelay};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

/// A small stable pool of relay identities plus occasional strangers,
/// re-announcing with drifting hop counts. Enough churn to exercise the
/// debouncer and, now and then, the loop detector.
pub async fn feed_announces(announces: Arc<AnnounceStore>) {
    let pool: Vec<String> = (0..6u8)
        .map(|i| {
            let mut bytes = [0u8; 16];
            bytes[0] = 0xd0 + i;
            bytes[15] = i;
            hex::encode(bytes)
        })
        .collect();

    loop {
        let (relay_id, name) = {
            let mut rng = rand::thread_rng();
            if rng.gen_bool(0.9) {
                let i = rng.gen_range(0..pool.len());
                (pool[i].clone(), format!("demo-relay-{}", i))
            } else {
                let random: [u8; 16] = rng.gen();
                (hex::encode(random), "stranger".to_string())
            }
        };

        let mut relay = CandidateRelay::new(relay_id.clone(), 0);
        {
            let mut rng = rand::thread_rng();
            relay.hops = rng.gen_range(1..=5);
            relay.transfer_limit = rng.gen_range(64..=2048);
            relay.display_name = Some(name);
            relay.receiving_interface = Some("demo0".to_string());
        }

        if let Err(e) = announces.record_announce(relay) {
            tracing::warn!(relay = %relay_id, error = %e, "demo announce rejected");
        }

        let pause_ms = rand::thread_rng().gen_range(2_000..=8_000);
        tokio::time::sleep(Duration::from_millis(pause_ms)).await;
    }
}
