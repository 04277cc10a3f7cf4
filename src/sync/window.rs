//! Block window selection for the log synchronizer
//!
//! Only blocks at least `confirmation_depth` behind the head are read, so a
//! reorg can never rewrite a block that was already applied. Windows are
//! bounded by `max_window_size` to stay within provider limits.

use serde::Serialize;

/// What the next cycle should read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WindowPlan {
    /// First run on a chain: ask the provider for its default range and
    /// start tracking from the safe height, without backfilling history
    ColdStart { safe_height: u64 },
    /// No newly confirmed block since the checkpoint
    UpToDate { checkpoint: u64 },
    /// Inclusive block range
    Range { from_block: u64, to_block: u64 },
}

impl WindowPlan {
    /// Checkpoint to store once every log of the window is applied
    pub fn new_checkpoint(&self) -> u64 {
        match self {
            WindowPlan::ColdStart { safe_height } => *safe_height,
            WindowPlan::UpToDate { checkpoint } => *checkpoint,
            WindowPlan::Range { to_block, .. } => *to_block,
        }
    }

    /// Range passed to the chain reader, `None` when no fetch is needed
    pub fn fetch_range(&self) -> Option<(Option<u64>, Option<u64>)> {
        match self {
            WindowPlan::ColdStart { .. } => Some((None, None)),
            WindowPlan::UpToDate { .. } => None,
            WindowPlan::Range { from_block, to_block } => Some((Some(*from_block), Some(*to_block))),
        }
    }
}

pub fn safe_height(current_height: u64, confirmation_depth: u64) -> u64 {
    current_height.saturating_sub(confirmation_depth)
}

pub fn plan_window(
    checkpoint: Option<u64>,
    current_height: u64,
    confirmation_depth: u64,
    max_window_size: u64,
) -> WindowPlan {
    let safe_height = safe_height(current_height, confirmation_depth);

    let Some(checkpoint) = checkpoint else {
        return WindowPlan::ColdStart { safe_height };
    };

    let from_block = checkpoint.saturating_add(1);
    if from_block > safe_height {
        return WindowPlan::UpToDate { checkpoint };
    }

    let to_block = checkpoint
        .saturating_add(max_window_size.max(1))
        .min(safe_height);

    WindowPlan::Range { from_block, to_block }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cold_start_uses_safe_height() {
        let plan = plan_window(None, 30_000_128, 128, 2_000);
        assert_eq!(plan, WindowPlan::ColdStart { safe_height: 30_000_000 });
        assert_eq!(plan.new_checkpoint(), 30_000_000);
        assert_eq!(plan.fetch_range(), Some((None, None)));
    }

    #[test]
    fn test_nothing_confirmed_skips_fetch() {
        // safe height 950, checkpoint already there
        let plan = plan_window(Some(950), 1_000, 50, 2_000);
        assert_eq!(plan, WindowPlan::UpToDate { checkpoint: 950 });
        assert_eq!(plan.fetch_range(), None);
        assert_eq!(plan.new_checkpoint(), 950);

        // checkpoint ahead of a lagging provider stays put
        let plan = plan_window(Some(990), 1_000, 50, 2_000);
        assert_eq!(plan.new_checkpoint(), 990);
    }

    #[test]
    fn test_window_is_bounded_by_size_and_safe_height() {
        let plan = plan_window(Some(1_000), 10_000, 50, 2_000);
        assert_eq!(plan, WindowPlan::Range { from_block: 1_001, to_block: 3_000 });

        let plan = plan_window(Some(9_000), 10_000, 50, 2_000);
        assert_eq!(plan, WindowPlan::Range { from_block: 9_001, to_block: 9_950 });
        assert_eq!(plan.new_checkpoint(), 9_950);
    }

    #[test]
    fn test_window_properties_hold_over_a_grid() {
        for checkpoint in [0u64, 10, 500, 999, 1_000, 5_000] {
            for height in [0u64, 20, 600, 1_050, 1_100, 9_000] {
                let depth = 50;
                let plan = plan_window(Some(checkpoint), height, depth, 2_000);
                let safe = height.saturating_sub(depth);
                if checkpoint + 1 > safe {
                    assert_eq!(plan.fetch_range(), None);
                    assert_eq!(plan.new_checkpoint(), checkpoint);
                } else {
                    let upper = (checkpoint + 2_000).min(safe);
                    assert_eq!(plan.fetch_range(), Some((Some(checkpoint + 1), Some(upper))));
                    assert_eq!(plan.new_checkpoint(), upper);
                }
            }
        }
    }

    #[test]
    fn test_height_below_depth_saturates() {
        assert_eq!(safe_height(10, 50), 0);
        assert_eq!(plan_window(None, 10, 50, 2_000).new_checkpoint(), 0);
    }
}
