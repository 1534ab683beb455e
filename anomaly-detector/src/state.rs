use std::collections::HashMap;

use pipeline_common::metrics_consts::DETECTOR_STATE_KEYS;

/// Last heart rate seen per customer, for the partitions one worker owns.
///
/// Single writer: only the partition worker holding it reads or updates it, in
/// delivery order. Memory only, so a restart forgets it and the next reading for
/// each customer cannot be a spike.
#[derive(Debug, Default)]
pub struct DetectionState {
    last_heart_rate: HashMap<String, i32>,
}

impl DetectionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, customer_id: &str) -> Option<i32> {
        self.last_heart_rate.get(customer_id).copied()
    }

    pub fn update(&mut self, customer_id: &str, heart_rate: i32) {
        match self.last_heart_rate.get_mut(customer_id) {
            Some(last) => *last = heart_rate,
            None => {
                self.last_heart_rate
                    .insert(customer_id.to_owned(), heart_rate);
                metrics::gauge!(DETECTOR_STATE_KEYS).increment(1.0);
            }
        }
    }

    /// Seed customers that have no state yet. Returns how many were added.
    pub fn seed(&mut self, latest: impl IntoIterator<Item = (String, i32)>) -> usize {
        let mut added = 0;
        for (customer_id, heart_rate) in latest {
            if self.last_heart_rate.contains_key(&customer_id) {
                continue;
            }
            self.last_heart_rate.insert(customer_id, heart_rate);
            added += 1;
        }
        metrics::gauge!(DETECTOR_STATE_KEYS).increment(added as f64);
        added
    }

    pub fn len(&self) -> usize {
        self.last_heart_rate.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_heart_rate.is_empty()
    }
}

impl Drop for DetectionState {
    // The gauge covers every live shard, a revoked partition takes its keys with it
    fn drop(&mut self) {
        metrics::gauge!(DETECTOR_STATE_KEYS).decrement(self.len() as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_replaces_the_previous_reading() {
        let mut state = DetectionState::new();
        assert_eq!(state.get("cust_00001"), None);

        state.update("cust_00001", 70);
        state.update("cust_00001", 120);
        state.update("cust_00002", 65);

        assert_eq!(state.get("cust_00001"), Some(120));
        assert_eq!(state.get("cust_00002"), Some(65));
        assert_eq!(state.len(), 2);
    }

    #[test]
    fn seeding_never_overwrites_live_state() {
        let mut state = DetectionState::new();
        state.update("cust_00001", 90);

        let added = state.seed([
            ("cust_00001".to_string(), 60),
            ("cust_00002".to_string(), 75),
        ]);

        assert_eq!(added, 1);
        assert_eq!(state.get("cust_00001"), Some(90));
        assert_eq!(state.get("cust_00002"), Some(75));
    }
}
