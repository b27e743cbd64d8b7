//! Visibility decisions over vector clocks.
//!
//! A record stamped (creat, del) is visible to a viewer clock V iff the
//! creation happened before or at V and the deletion did not. This is the
//! sole admissibility test applied to nodes, edges and properties during
//! traversal, and to handle tombstones at admission.

use crate::vclock::VectorClock;

/// Pure, stateless visibility oracle. Workers each carry their own handle;
/// sharing one is equally safe.
#[derive(Clone, Copy, Debug, Default)]
pub struct OrderOracle;

impl OrderOracle {
    pub fn new() -> Self {
        OrderOracle
    }

    /// True iff the record (creat, del) exists from the viewer's vantage:
    /// creat ≤ viewer componentwise and not del ≤ viewer componentwise.
    pub fn visible(&self, viewer: &VectorClock, creat: &VectorClock, del: &VectorClock) -> bool {
        creat.happens_before_eq(viewer) && !del.happens_before_eq(viewer)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::vclock::VectorClock;

    fn clk(counters: Vec<u64>) -> VectorClock {
        VectorClock::from_counters(0, counters)
    }

    #[test]
    fn created_before_viewer_is_visible() {
        let oracle = OrderOracle::new();
        let viewer = clk(vec![5, 5]);
        assert!(oracle.visible(&viewer, &clk(vec![1, 2]), &VectorClock::never(2)));
    }

    #[test]
    fn created_after_viewer_is_invisible() {
        let oracle = OrderOracle::new();
        let viewer = clk(vec![5, 5]);
        assert!(!oracle.visible(&viewer, &clk(vec![6, 0]), &VectorClock::never(2)));
    }

    #[test]
    fn deleted_before_viewer_is_invisible() {
        let oracle = OrderOracle::new();
        let viewer = clk(vec![5, 5]);
        assert!(!oracle.visible(&viewer, &clk(vec![1, 1]), &clk(vec![2, 2])));
    }

    #[test]
    fn concurrent_delete_stays_visible() {
        // the delete is not ordered before the viewer, so the record lives
        let oracle = OrderOracle::new();
        let viewer = clk(vec![5, 0]);
        assert!(oracle.visible(&viewer, &clk(vec![1, 0]), &clk(vec![0, 3])));
    }
}
