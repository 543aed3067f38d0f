//! The fragmentation score.
//!
//! For each zone, the external fragmentation index for a target order `k` is
//! the percentage of free pages that sit in blocks too small to satisfy an
//! order-`k` request. A zone's weighted score scales that percentage by the
//! zone's share of its node's memory, and a node's score is the sum of its
//! zones' weighted scores. A node whose memory is entirely free but entirely
//! in order-0 blocks scores 99, not 100, because of the `+ 1` in the weight's
//! denominator.

use crate::{ContigPageInfo, HistogramError, HistogramSource, OrderBound, ZoneHistogram};
use alloc::{string::String, vec::Vec};

/// The order of a 2 MiB huge page built from 4 KiB base pages.
pub const DEFAULT_HUGE_PAGE_ORDER: u32 = 9;

/// One zone's contribution to its node's score.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ZoneScore {
    /// The zone's index within its node.
    pub zone_id: u32,
    /// Human-readable zone name.
    pub zone_name: String,
    /// Pages physically present in the zone.
    pub present_pages: u64,
    /// Percentage, in `0..=100`, of free pages unusable for the target order.
    pub extfrag_percent: u32,
    /// `present_pages * extfrag_percent / (node_present_pages + 1)`.
    pub weighted_score: u64,
}

/// One node's fragmentation score.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeScore {
    /// The node.
    pub node_id: u32,
    /// Pages physically present across the node's zones.
    pub present_pages_total: u64,
    /// Sum of the node's zones' weighted scores.
    pub score: u64,
    /// The populated zones that were scored.
    pub zones: Vec<ZoneScore>,
}

/// Scores for every node, from a single histogram read.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SystemScore {
    nodes: Vec<NodeScore>,
}

impl SystemScore {
    /// Score `zones`, grouping them by node in ascending node order.
    ///
    /// Zones with no present pages are skipped. A node whose zones are all
    /// empty is still reported, with a zero score.
    pub fn from_zones(zones: &[ZoneHistogram], target_order: u32, bound: OrderBound) -> Self {
        let mut node_ids: Vec<u32> = zones.iter().map(|z| z.node_id).collect();
        node_ids.sort_unstable();
        node_ids.dedup();

        let nodes = node_ids
            .into_iter()
            .map(|node_id| {
                let node_zones = zones.iter().filter(|z| z.node_id == node_id);
                score_node(node_id, node_zones, target_order, bound)
            })
            .collect();

        SystemScore { nodes }
    }

    /// Iterate over node scores in ascending node order.
    pub fn iter(&self) -> impl Iterator<Item = &NodeScore> + '_ {
        self.nodes.iter()
    }

    /// The number of nodes scored.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Were there no nodes at all?
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The highest node score, if there are any nodes.
    pub fn max_score(&self) -> Option<u64> {
        self.nodes.iter().map(|n| n.score).max()
    }

    /// The lowest-numbered node whose score is at least `threshold`.
    pub fn first_at_or_above(&self, threshold: u64) -> Option<&NodeScore> {
        self.nodes.iter().find(|n| n.score >= threshold)
    }
}

fn zone_extfrag(zone: &ZoneHistogram, target_order: u32, bound: OrderBound) -> u32 {
    ContigPageInfo::fill(&zone.histogram, target_order, bound).extfrag_for_order(target_order)
}

fn zone_weight(zone: &ZoneHistogram, extfrag_percent: u32) -> u64 {
    let numerator = u128::from(zone.present_pages) * u128::from(extfrag_percent);
    let denominator = u128::from(zone.node_present_pages) + 1;
    u64::try_from(numerator / denominator).unwrap_or(u64::MAX)
}

fn score_node<'a>(
    node_id: u32,
    zones: impl Iterator<Item = &'a ZoneHistogram>,
    target_order: u32,
    bound: OrderBound,
) -> NodeScore {
    let mut node = NodeScore {
        node_id,
        present_pages_total: 0,
        score: 0,
        zones: Vec::new(),
    };

    for zone in zones.filter(|z| z.is_populated()) {
        let extfrag_percent = zone_extfrag(zone, target_order, bound);
        let weighted_score = zone_weight(zone, extfrag_percent);
        node.present_pages_total = node.present_pages_total.saturating_add(zone.present_pages);
        node.score = node.score.saturating_add(weighted_score);
        node.zones.push(ZoneScore {
            zone_id: zone.zone_id,
            zone_name: zone.zone_name.clone(),
            present_pages: zone.present_pages,
            extfrag_percent,
            weighted_score,
        });
    }

    node
}

/// Scores fragmentation for a fixed target order over a [`HistogramSource`].
#[derive(Clone, Debug)]
pub struct FragmentationScorer<S> {
    source: S,
    target_order: u32,
    bound: OrderBound,
}

impl<S> FragmentationScorer<S>
where
    S: HistogramSource,
{
    /// Create a scorer for requests of `target_order`, with the default
    /// histogram order bound.
    pub fn new(source: S, target_order: u32) -> Self {
        FragmentationScorer {
            source,
            target_order,
            bound: OrderBound::default(),
        }
    }

    /// Use `bound` to decide which histogram orders count.
    pub fn with_order_bound(mut self, bound: OrderBound) -> Self {
        self.bound = bound;
        self
    }

    /// The target order.
    #[inline]
    pub fn target_order(&self) -> u32 {
        self.target_order
    }

    /// The histogram order bound.
    #[inline]
    pub fn order_bound(&self) -> OrderBound {
        self.bound
    }

    /// The underlying histogram source.
    #[inline]
    pub fn source(&self) -> &S {
        &self.source
    }

    /// The percentage of `zone`'s free pages unusable for the target order.
    pub fn zone_external_fragmentation(&self, zone: &ZoneHistogram) -> u32 {
        zone_extfrag(zone, self.target_order, self.bound)
    }

    /// `zone`'s fragmentation weighted by its share of its node's memory.
    pub fn zone_weighted_score(&self, zone: &ZoneHistogram) -> u64 {
        zone_weight(zone, self.zone_external_fragmentation(zone))
    }

    /// Score one node's zones. Zones with no present pages are skipped.
    pub fn node_score(&self, node_id: u32, zones: &[ZoneHistogram]) -> NodeScore {
        score_node(node_id, zones.iter(), self.target_order, self.bound)
    }

    /// Read the histograms once and score every node.
    pub fn system_snapshot(&self) -> Result<SystemScore, HistogramError> {
        let zones = self.source.read_histograms()?;
        Ok(SystemScore::from_zones(&zones, self.target_order, self.bound))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{zone, StaticSource};
    use alloc::vec;

    #[test]
    fn oversized_zone_weight_saturates() {
        let z = zone(0, 0, u64::MAX, 0, &[500]);
        let scorer = FragmentationScorer::new(StaticSource::new(vec![z.clone()]), 2);
        assert_eq!(scorer.zone_external_fragmentation(&z), 100);
        assert_eq!(scorer.zone_weighted_score(&z), u64::MAX);

        let snapshot = scorer.system_snapshot().unwrap();
        assert_eq!(snapshot.iter().next().unwrap().score, u64::MAX);
    }

    #[test]
    fn all_free_in_order_zero_scores_ninety_nine() {
        let z = zone(0, 0, 1000, 1000, &[500]);
        let scorer = FragmentationScorer::new(StaticSource::new(vec![z.clone()]), 2);

        let info = ContigPageInfo::fill(&z.histogram, 2, scorer.order_bound());
        assert_eq!(info.free_pages, 500);
        assert_eq!(info.free_blocks_suitable, 0);
        assert_eq!(scorer.zone_external_fragmentation(&z), 100);
        assert_eq!(scorer.zone_weighted_score(&z), 99);

        let snapshot = scorer.system_snapshot().unwrap();
        assert_eq!(snapshot.len(), 1);
        let node = snapshot.iter().next().unwrap();
        assert_eq!(node.node_id, 0);
        assert_eq!(node.present_pages_total, 1000);
        assert_eq!(node.score, 99);
    }

    #[test]
    fn node_score_sums_zone_weights() {
        let zones = vec![
            zone(0, 0, 4000, 10_000, &[100, 0, 0, 10]),
            zone(0, 1, 6000, 10_000, &[0, 0, 50]),
            zone(0, 2, 0, 10_000, &[1000]),
        ];
        let scorer = FragmentationScorer::new(StaticSource::new(zones.clone()), 2);

        let node = scorer.node_score(0, &zones);
        let expected: u64 = zones[..2].iter().map(|z| scorer.zone_weighted_score(z)).sum();
        assert_eq!(node.score, expected);
        assert_eq!(node.zones.len(), 2);
        assert_eq!(node.present_pages_total, 10_000);

        // 100 of 180 free pages are order 0: 55%.
        assert_eq!(node.zones[0].extfrag_percent, 55);
        assert_eq!(node.zones[0].weighted_score, 4000 * 55 / 10_001);
        assert_eq!(node.zones[1].extfrag_percent, 0);
    }

    #[test]
    fn nodes_are_ascending_and_include_empty_ones() {
        let zones = vec![
            zone(2, 0, 100, 100, &[10]),
            zone(0, 0, 100, 100, &[0, 0, 5]),
            zone(1, 0, 0, 0, &[]),
        ];
        let snapshot = SystemScore::from_zones(&zones, 2, OrderBound::default());
        let ids: Vec<u32> = snapshot.iter().map(|n| n.node_id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(snapshot.iter().nth(1).unwrap().score, 0);
        assert_eq!(snapshot.max_score(), Some(99));
        assert_eq!(snapshot.first_at_or_above(50).unwrap().node_id, 2);
        assert!(snapshot.first_at_or_above(100).is_none());
    }

    #[test]
    fn snapshot_reads_the_source_once() {
        let source = StaticSource::new(vec![zone(0, 0, 10, 10, &[1]), zone(1, 0, 10, 10, &[1])]);
        let scorer = FragmentationScorer::new(&source, 1);
        scorer.system_snapshot().unwrap();
        assert_eq!(source.reads(), 1);
    }

    #[test]
    fn snapshot_propagates_read_errors() {
        let source = StaticSource::scripted(vec![Err(HistogramError::Unavailable("gone".into()))]);
        let scorer = FragmentationScorer::new(source, 9);
        assert_eq!(
            scorer.system_snapshot(),
            Err(HistogramError::Unavailable("gone".into()))
        );
    }

    #[test]
    fn order_bound_changes_the_score() {
        let mut counts = vec![0; 11];
        counts[0] = 24;
        counts[10] = 1;
        let z = zone(0, 0, 2048, 2048, &counts);

        let inclusive = FragmentationScorer::new(StaticSource::new(vec![]), 9);
        assert_eq!(inclusive.zone_external_fragmentation(&z), 2);

        let exclusive = FragmentationScorer::new(StaticSource::new(vec![]), 9)
            .with_order_bound(OrderBound::Exclusive(10));
        assert_eq!(exclusive.zone_external_fragmentation(&z), 100);
    }
}
