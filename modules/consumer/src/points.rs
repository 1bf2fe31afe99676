//! Intersection points for (re)starting an upstream chain-sync session:
//! operator-supplied fallback points, and a point source backed by the
//! cursor store's tip.

use anyhow::{anyhow, Result};
use sundae_sync_common::Point;
use sundae_sync_cursor_store::{CursorError, CursorStore};
use tracing::info;

/// Parse comma-separated `{slot}/{blockHash}` point specs
pub fn parse_points(spec: &str) -> Result<Vec<Point>> {
    let mut points = Vec::new();
    for part in spec.split(',') {
        let (slot, id) = part
            .split_once('/')
            .ok_or_else(|| anyhow!("failed to parse point, {part}: expected {{slot}}/{{blockHash}}"))?;
        let slot: u64 = slot
            .parse()
            .map_err(|_| anyhow!("failed to parse point, {part}: expected {{slot}}/{{blockHash}}"))?;
        if id.is_empty() || id.contains('/') {
            return Err(anyhow!(
                "failed to parse point, {part}: expected {{slot}}/{{blockHash}}"
            ));
        }
        points.push(Point {
            slot,
            id: id.to_string(),
            height: None,
        });
    }
    Ok(points)
}

/// Where an upstream session should try to intersect: the saved cursor tip
/// when one exists, the configured fallback points otherwise.
pub struct IntersectionStore {
    cursor: CursorStore,
    usage: String,
    fallback: Vec<Point>,
}

impl IntersectionStore {
    pub fn new(cursor: CursorStore, usage: &str) -> Self {
        Self {
            cursor,
            usage: usage.to_string(),
            fallback: Vec::new(),
        }
    }

    pub fn with_fallback(mut self, points: Vec<Point>) -> Self {
        self.fallback = points;
        self
    }

    /// Candidate intersection points, most preferred first
    pub async fn load(&self) -> Result<Vec<Point>> {
        match self.cursor.tip(&self.usage).await {
            Ok(tip) => Ok(vec![tip]),
            Err(CursorError::NotFound { .. }) => {
                info!(usage = %self.usage, "no cursor saved, using fallback points");
                Ok(self.fallback.clone())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Intersection acknowledgements never advance the cursor; only applied
    /// forward frames do.
    pub async fn save(&self, _point: &Point) -> Result<()> {
        Ok(())
    }
}
