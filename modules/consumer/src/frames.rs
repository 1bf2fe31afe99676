//! Wire format of chain-sync frames as they arrive from the partitioned log
//! or a direct upstream session.

use serde::Deserialize;
use sundae_sync_common::{Point, SyncBlock};

/// One frame of the chain-sync stream. Exactly one of the two fields is
/// populated on well-formed frames; anything else is ignored by the consumer.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainSyncFrame {
    #[serde(default)]
    pub find_intersection: Option<FindIntersection>,

    #[serde(default)]
    pub next_block: Option<NextBlock>,
}

/// Upstream rewound to (and acknowledged) this point
#[derive(Debug, Clone, Deserialize)]
pub struct FindIntersection {
    #[serde(default)]
    pub intersection: Option<PointOrOrigin>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextBlock {
    pub direction: Direction,

    /// Present on forward frames
    #[serde(default)]
    pub block: Option<SyncBlock>,

    /// Present on backward frames
    #[serde(default)]
    pub point: Option<PointOrOrigin>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Forward,
    Backward,
}

/// A point, or the literal string `"origin"`
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PointOrOrigin {
    Point(Point),
    Origin(String),
}

impl PointOrOrigin {
    pub fn point(&self) -> Option<&Point> {
        match self {
            PointOrOrigin::Point(p) => Some(p),
            PointOrOrigin::Origin(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_forward_frames() {
        let frame: ChainSyncFrame = serde_json::from_str(
            r#"{"nextBlock":{"direction":"forward","block":{"slot":7,"id":"ab","height":3,"transactions":[{"id":"t1"}]}}}"#,
        )
        .unwrap();
        let next = frame.next_block.unwrap();
        assert_eq!(next.direction, Direction::Forward);
        let block = next.block.unwrap();
        assert_eq!(block.height, Some(3));
        assert_eq!(block.transactions.len(), 1);
    }

    #[test]
    fn decodes_backward_frames() {
        let frame: ChainSyncFrame = serde_json::from_str(
            r#"{"nextBlock":{"direction":"backward","point":{"slot":5,"id":"cd"}}}"#,
        )
        .unwrap();
        let next = frame.next_block.unwrap();
        assert_eq!(next.direction, Direction::Backward);
        assert_eq!(next.point.unwrap().point().unwrap().slot, 5);
    }

    #[test]
    fn decodes_intersection_frames() {
        let frame: ChainSyncFrame = serde_json::from_str(
            r#"{"findIntersection":{"intersection":{"slot":9,"id":"ef","height":2}}}"#,
        )
        .unwrap();
        let intersection = frame.find_intersection.unwrap().intersection.unwrap();
        assert_eq!(intersection.point().unwrap().height, Some(2));
    }

    #[test]
    fn origin_is_not_a_point() {
        let frame: ChainSyncFrame =
            serde_json::from_str(r#"{"findIntersection":{"intersection":"origin"}}"#).unwrap();
        let intersection = frame.find_intersection.unwrap().intersection.unwrap();
        assert!(intersection.point().is_none());
    }
}
