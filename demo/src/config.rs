//! CLI configuration for the demo binary.

use std::time::Duration;

use clap::Parser;
use fbas::NodeId;

/// CLI arguments for the demo.
#[derive(Debug, Parser)]
#[command(name = "fbas-demo")]
#[command(about = "Federated lunch ordering with TUI visualization")]
pub struct DemoConfig {
    /// Number of participants in the demo.
    #[arg(short, long, default_value = "5")]
    pub participants: usize,

    /// How many of the other participants each one waits for. Defaults to
    /// two thirds of them, rounded up.
    #[arg(short, long)]
    pub threshold: Option<usize>,

    /// Interval between driver ticks in milliseconds.
    #[arg(short, long, default_value = "200")]
    pub interval_ms: u64,

    /// Nomination round duration in milliseconds.
    #[arg(long, default_value = "100")]
    pub round_ms: u64,

    /// Deferred ballot update interval in milliseconds.
    #[arg(long, default_value = "250")]
    pub deferred_update_ms: u64,

    /// Explicit slices for each participant in order, such as `"2 3 / 3 4"`
    /// for slices {P2, P3} and {P3, P4}. Participants without an entry get
    /// threshold slices.
    #[arg(short, long)]
    pub slices: Vec<String>,
}

impl DemoConfig {
    /// Returns the driver tick interval as a Duration.
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// The threshold, clamped to the number of other participants.
    pub fn threshold(&self) -> usize {
        let others = self.participants.saturating_sub(1);
        self.threshold.unwrap_or_else(|| (2 * others).div_ceil(3)).clamp(1, others.max(1))
    }

    /// Quorum slices of participant `index`: the explicit ones if given,
    /// otherwise every `threshold`-sized subset of the others.
    pub fn slices(&self, index: usize) -> Vec<Vec<NodeId>> {
        if let Some(spec) = self.slices.get(index) {
            return parse_slices(spec);
        }
        let others: Vec<NodeId> =
            (0..self.participants).filter(|&i| i != index).map(participant_id).collect();
        let mut slices = Vec::new();
        subsets(&others, self.threshold(), &mut Vec::new(), &mut slices);
        slices
    }
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            participants: 5,
            threshold: None,
            interval_ms: 200,
            round_ms: 100,
            deferred_update_ms: 250,
            slices: Vec::new(),
        }
    }
}

/// Node id of participant `index` (0-indexed, displayed 1-indexed).
pub fn participant_id(index: usize) -> NodeId {
    NodeId::new(format!("p{}", index + 1))
}

/// Parses `"2 3 / 3 4"` into slices of participant ids. Tokens that are not
/// participant numbers are skipped.
fn parse_slices(spec: &str) -> Vec<Vec<NodeId>> {
    spec.split('/')
        .map(|slice| {
            slice
                .split_whitespace()
                .filter_map(|n| n.parse::<usize>().ok())
                .filter(|&n| n > 0)
                .map(|n| participant_id(n - 1))
                .collect()
        })
        .collect()
}

fn subsets(from: &[NodeId], k: usize, current: &mut Vec<NodeId>, out: &mut Vec<Vec<NodeId>>) {
    if current.len() == k {
        out.push(current.clone());
        return;
    }
    for (i, id) in from.iter().enumerate() {
        current.push(id.clone());
        subsets(&from[i + 1..], k, current, out);
        current.pop();
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::five(5, None, 3, 4)]
    #[case::four(4, None, 2, 3)]
    #[case::explicit(5, Some(4), 4, 1)]
    #[case::clamped(3, Some(9), 2, 1)]
    fn test_slices(
        #[case] participants: usize,
        #[case] threshold: Option<usize>,
        #[case] size: usize,
        #[case] count: usize,
    ) {
        let config = DemoConfig { participants, threshold, ..DemoConfig::default() };
        let slices = config.slices(0);
        assert_eq!(slices.len(), count);
        assert!(slices.iter().all(|slice| slice.len() == size));
        assert!(slices.iter().flatten().all(|id| *id != participant_id(0)));
    }

    #[test]
    fn test_explicit_slices() {
        let config = DemoConfig {
            participants: 4,
            slices: vec!["2 3 / 3 4".to_string()],
            ..DemoConfig::default()
        };
        assert_eq!(
            config.slices(0),
            vec![
                vec![participant_id(1), participant_id(2)],
                vec![participant_id(2), participant_id(3)],
            ]
        );
        // Participants past the explicit list fall back to thresholds.
        assert_eq!(config.slices(1).len(), 3);
    }
}
