//! Chronologically ordered push keys.
//!
//! A key is 20 characters: 8 encode the millisecond timestamp, 12 are
//! random. Keys generated in the same millisecond reuse the previous random
//! part incremented by one, so lexicographic order matches creation order.

use parking_lot::Mutex;
use rand::Rng;

const PUSH_CHARS: &[u8; 64] = b"-0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz";
const TIME_CHARS: usize = 8;
const RANDOM_CHARS: usize = 12;

#[derive(Default)]
struct PushIdState {
    last_timestamp: i64,
    last_random: [u8; RANDOM_CHARS],
}

/// Generates push keys for chat messages and other appended children.
#[derive(Default)]
pub struct PushIdGenerator {
    state: Mutex<PushIdState>,
}

impl PushIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next key using the local clock.
    pub fn generate(&self) -> String {
        self.generate_at(chrono::Utc::now().timestamp_millis())
    }

    /// Next key for the given epoch-millisecond timestamp.
    pub fn generate_at(&self, timestamp_ms: i64) -> String {
        let mut state = self.state.lock();

        if timestamp_ms == state.last_timestamp {
            // Same millisecond: increment the random part, carrying left.
            for slot in state.last_random.iter_mut().rev() {
                if *slot == 63 {
                    *slot = 0;
                } else {
                    *slot += 1;
                    break;
                }
            }
        } else {
            let mut rng = rand::thread_rng();
            for slot in state.last_random.iter_mut() {
                *slot = rng.gen_range(0..64);
            }
        }
        state.last_timestamp = timestamp_ms;

        let mut time_chars = [0u8; TIME_CHARS];
        let mut now = timestamp_ms.max(0);
        for slot in time_chars.iter_mut().rev() {
            *slot = PUSH_CHARS[(now % 64) as usize];
            now /= 64;
        }

        let mut key = String::with_capacity(TIME_CHARS + RANDOM_CHARS);
        key.extend(time_chars.iter().map(|&b| b as char));
        key.extend(
            state
                .last_random
                .iter()
                .map(|&i| PUSH_CHARS[i as usize] as char),
        );
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_have_fixed_length_and_safe_chars() {
        let generator = PushIdGenerator::new();
        let key = generator.generate();
        assert_eq!(key.len(), 20);
        assert!(key.bytes().all(|b| PUSH_CHARS.contains(&b)));
        assert!(crate::DbPath::root().child(key).validate().is_ok());
    }

    #[test]
    fn same_millisecond_keys_are_strictly_increasing() {
        let generator = PushIdGenerator::new();
        let keys: Vec<String> = (0..200).map(|_| generator.generate_at(1_717_200_000_000)).collect();
        for pair in keys.windows(2) {
            assert!(pair[0] < pair[1], "{} !< {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn later_timestamps_sort_after_earlier() {
        let generator = PushIdGenerator::new();
        let early = generator.generate_at(1_717_200_000_000);
        let late = generator.generate_at(1_717_200_000_001);
        assert!(early < late);
        assert_ne!(early[..8], late[..8]);
    }
}
