//! Free-area histograms from `/proc/buddyinfo` and `/proc/zoneinfo`.

use crate::{HistogramError, HistogramSource, OrderBound, OrderHistogram, ZoneHistogram};
use std::{
    collections::BTreeMap,
    format, fs,
    path::{Path, PathBuf},
    string::{String, ToString},
    vec::Vec,
};

/// Where the kernel reports free blocks per order.
pub const BUDDYINFO: &str = "/proc/buddyinfo";

/// Where the kernel reports per-zone page counts.
pub const ZONEINFO: &str = "/proc/zoneinfo";

/// One line of `/proc/buddyinfo`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuddyInfoLine {
    /// One-based line number.
    pub line: usize,
    /// The node.
    pub node_id: u32,
    /// The zone's name.
    pub zone_name: String,
    /// Free blocks by order, from order 0.
    pub counts: Vec<u64>,
}

/// A zone's present pages, from `/proc/zoneinfo`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ZonePresence {
    /// The node.
    pub node_id: u32,
    /// The zone's name.
    pub zone_name: String,
    /// Pages physically present in the zone.
    pub present_pages: u64,
}

/// Parse a `Node <n>, zone <name>` header, returning the node, the zone name
/// and the remaining tokens.
fn parse_header<'a>(
    line: &'a str,
    number: usize,
) -> Result<Option<(u32, &'a str, std::str::SplitWhitespace<'a>)>, HistogramError> {
    let mut tokens = line.split_whitespace();
    if tokens.next() != Some("Node") {
        return Ok(None);
    }
    let malformed = |reason| HistogramError::Malformed {
        line: number,
        reason,
    };

    let node_id = tokens
        .next()
        .and_then(|t| t.strip_suffix(','))
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| malformed("bad node number"))?;
    if tokens.next() != Some("zone") {
        return Err(malformed("missing zone keyword"));
    }
    let zone_name = tokens.next().ok_or_else(|| malformed("missing zone name"))?;
    Ok(Some((node_id, zone_name, tokens)))
}

/// Parse the text of `/proc/buddyinfo`.
pub fn parse_buddyinfo(text: &str) -> Result<Vec<BuddyInfoLine>, HistogramError> {
    let mut lines = Vec::new();
    for (i, line) in text.lines().enumerate() {
        let number = i + 1;
        if line.trim().is_empty() {
            continue;
        }
        let (node_id, zone_name, tokens) =
            parse_header(line, number)?.ok_or(HistogramError::Malformed {
                line: number,
                reason: "expected a `Node` line",
            })?;
        let counts = tokens
            .map(|t| t.parse::<u64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| HistogramError::Malformed {
                line: number,
                reason: "bad free block count",
            })?;
        lines.push(BuddyInfoLine {
            line: number,
            node_id,
            zone_name: zone_name.to_string(),
            counts,
        });
    }
    Ok(lines)
}

/// Parse the text of `/proc/zoneinfo`, keeping each zone's present pages.
///
/// Zones are returned in the order they appear, which is their order within
/// their node.
pub fn parse_zoneinfo(text: &str) -> Result<Vec<ZonePresence>, HistogramError> {
    let mut zones: Vec<ZonePresence> = Vec::new();
    let mut present_seen = true;

    for (i, line) in text.lines().enumerate() {
        let number = i + 1;
        if let Some((node_id, zone_name, _)) = parse_header(line, number)? {
            if !present_seen {
                return Err(HistogramError::Malformed {
                    line: number,
                    reason: "previous zone has no present pages",
                });
            }
            zones.push(ZonePresence {
                node_id,
                zone_name: zone_name.to_string(),
                present_pages: 0,
            });
            present_seen = false;
            continue;
        }

        let mut tokens = line.split_whitespace();
        if present_seen || tokens.next() != Some("present") {
            continue;
        }
        let present = tokens
            .next()
            .and_then(|t| t.parse().ok())
            .ok_or(HistogramError::Malformed {
                line: number,
                reason: "bad present page count",
            })?;
        if let Some(zone) = zones.last_mut() {
            zone.present_pages = present;
        }
        present_seen = true;
    }

    if !present_seen {
        return Err(HistogramError::Malformed {
            line: text.lines().count(),
            reason: "last zone has no present pages",
        });
    }
    Ok(zones)
}

/// Join free-block counts with present page counts.
pub fn join(
    buddyinfo: &[BuddyInfoLine],
    zoneinfo: &[ZonePresence],
) -> Result<Vec<ZoneHistogram>, HistogramError> {
    let mut node_present: BTreeMap<u32, u64> = BTreeMap::new();
    let mut zone_ids: BTreeMap<(u32, &str), (u32, u64)> = BTreeMap::new();
    let mut next_zone_id: BTreeMap<u32, u32> = BTreeMap::new();
    for zone in zoneinfo {
        *node_present.entry(zone.node_id).or_default() += zone.present_pages;
        let id = next_zone_id.entry(zone.node_id).or_default();
        zone_ids.insert((zone.node_id, zone.zone_name.as_str()), (*id, zone.present_pages));
        *id += 1;
    }

    buddyinfo
        .iter()
        .map(|line| {
            let (zone_id, present_pages) = zone_ids
                .get(&(line.node_id, line.zone_name.as_str()))
                .copied()
                .ok_or(HistogramError::Malformed {
                    line: line.line,
                    reason: "zone missing from zoneinfo",
                })?;
            Ok(ZoneHistogram {
                node_id: line.node_id,
                zone_id,
                zone_name: line.zone_name.clone(),
                present_pages,
                node_present_pages: node_present[&line.node_id],
                histogram: OrderHistogram::from_counts(line.counts.iter().copied()),
            })
        })
        .collect()
}

/// The orders a kernel reports, from the widest `/proc/buddyinfo` line.
///
/// With no lines the default bound is used.
pub fn order_bound(lines: &[BuddyInfoLine]) -> OrderBound {
    lines
        .iter()
        .map(|l| l.counts.len())
        .max()
        .and_then(|columns| u32::try_from(columns).ok())
        .map_or_else(OrderBound::default, OrderBound::Exclusive)
}

/// Reads the host kernel's free-area histograms.
#[derive(Clone, Debug)]
pub struct ProcHistogramSource {
    buddyinfo: PathBuf,
    zoneinfo: PathBuf,
}

impl Default for ProcHistogramSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcHistogramSource {
    /// Read from the standard `/proc` paths.
    pub fn new() -> Self {
        Self::with_paths(BUDDYINFO, ZONEINFO)
    }

    /// Read from other paths, e.g. captured copies.
    pub fn with_paths(buddyinfo: impl Into<PathBuf>, zoneinfo: impl Into<PathBuf>) -> Self {
        ProcHistogramSource {
            buddyinfo: buddyinfo.into(),
            zoneinfo: zoneinfo.into(),
        }
    }

    /// The order bound matching this kernel's `/proc/buddyinfo` columns.
    pub fn order_bound(&self) -> Result<OrderBound, HistogramError> {
        Ok(order_bound(&parse_buddyinfo(&read(&self.buddyinfo)?)?))
    }
}

fn read(path: &Path) -> Result<String, HistogramError> {
    fs::read_to_string(path)
        .map_err(|e| HistogramError::Unavailable(format!("{}: {e}", path.display())))
}

impl HistogramSource for ProcHistogramSource {
    fn read_histograms(&self) -> Result<Vec<ZoneHistogram>, HistogramError> {
        let buddyinfo = parse_buddyinfo(&read(&self.buddyinfo)?)?;
        let zoneinfo = parse_zoneinfo(&read(&self.zoneinfo)?)?;
        join(&buddyinfo, &zoneinfo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{env, process, vec};

    const BUDDYINFO_TEXT: &str = "\
Node 0, zone      DMA      1      1      0      0      2      1      1      0      1      1      3
Node 0, zone    DMA32    780    637    501    386    275    160     81     29     10      3    302
Node 0, zone   Normal  13406  10017   4745   1703    657    310    133     54     13      4   1002
";

    const ZONEINFO_TEXT: &str = "\
Node 0, zone      DMA
  per-node stats
      nr_inactive_anon 4
  pages free     3840
        min      20
        present  3998
        managed  3840
Node 0, zone    DMA32
  pages free     349000
        present  782288
        managed  351106
Node 0, zone   Normal
  pages free     1118370
        present  3407872
        managed  3336498
        protection: (0, 0, 0, 0, 0)
";

    #[test]
    fn buddyinfo_lines() {
        let lines = parse_buddyinfo(BUDDYINFO_TEXT).unwrap();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1].node_id, 0);
        assert_eq!(lines[1].zone_name, "DMA32");
        assert_eq!(lines[1].counts.len(), 11);
        assert_eq!(lines[1].counts[0], 780);
        assert_eq!(lines[2].counts[10], 1002);
        assert_eq!(lines[2].line, 3);
    }

    #[test]
    fn buddyinfo_errors_name_the_line() {
        assert_eq!(
            parse_buddyinfo("Node 0, zone DMA 1 2\nNode x, zone DMA 1\n"),
            Err(HistogramError::Malformed {
                line: 2,
                reason: "bad node number"
            })
        );
        assert_eq!(
            parse_buddyinfo("Node 0, zone DMA 1 two\n"),
            Err(HistogramError::Malformed {
                line: 1,
                reason: "bad free block count"
            })
        );
        assert!(parse_buddyinfo("garbage\n").is_err());
    }

    #[test]
    fn zoneinfo_present_pages() {
        let zones = parse_zoneinfo(ZONEINFO_TEXT).unwrap();
        let present: Vec<_> = zones
            .iter()
            .map(|z| (z.zone_name.as_str(), z.present_pages))
            .collect();
        assert_eq!(
            present,
            vec![("DMA", 3998), ("DMA32", 782288), ("Normal", 3407872)]
        );
        assert!(parse_zoneinfo("Node 0, zone DMA\n  pages free 3\n").is_err());
    }

    #[test]
    fn joined_histograms() {
        let zones = join(
            &parse_buddyinfo(BUDDYINFO_TEXT).unwrap(),
            &parse_zoneinfo(ZONEINFO_TEXT).unwrap(),
        )
        .unwrap();
        assert_eq!(zones.len(), 3);
        assert_eq!(zones[2].zone_id, 2);
        assert_eq!(zones[2].present_pages, 3407872);
        assert_eq!(zones[2].node_present_pages, 3998 + 782288 + 3407872);
        assert_eq!(zones[0].histogram.free_blocks(10), 3);

        let missing = join(
            &parse_buddyinfo("Node 1, zone Normal 1\n").unwrap(),
            &parse_zoneinfo(ZONEINFO_TEXT).unwrap(),
        );
        assert!(matches!(missing, Err(HistogramError::Malformed { line: 1, .. })));
    }

    #[test]
    fn source_reads_files() {
        let dir = env::temp_dir().join(format!("page-fragmenter-procfs-{}", process::id()));
        fs::create_dir_all(&dir).unwrap();
        let buddyinfo = dir.join("buddyinfo");
        let zoneinfo = dir.join("zoneinfo");
        fs::write(&buddyinfo, BUDDYINFO_TEXT).unwrap();
        fs::write(&zoneinfo, ZONEINFO_TEXT).unwrap();

        let source = ProcHistogramSource::with_paths(&buddyinfo, &zoneinfo);
        assert_eq!(source.read_histograms().unwrap().len(), 3);

        let missing = ProcHistogramSource::with_paths(dir.join("nope"), &zoneinfo);
        assert!(matches!(
            missing.read_histograms(),
            Err(HistogramError::Unavailable(_))
        ));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn order_bound_follows_buddyinfo_columns() {
        assert_eq!(order_bound(&[]), OrderBound::default());
        assert_eq!(
            order_bound(&parse_buddyinfo(BUDDYINFO_TEXT).unwrap()),
            OrderBound::Exclusive(11)
        );

        let dir = env::temp_dir().join(format!("page-fragmenter-bound-{}", process::id()));
        fs::create_dir_all(&dir).unwrap();
        let buddyinfo = dir.join("buddyinfo");
        let zoneinfo = dir.join("zoneinfo");
        fs::write(
            &buddyinfo,
            "Node 0, zone Normal 50 0 0 0 0 0 0 0 0 0 0 0 0 100\n",
        )
        .unwrap();
        fs::write(
            &zoneinfo,
            "Node 0, zone Normal\n  pages free 819250\n        present 1000000\n",
        )
        .unwrap();

        let source = ProcHistogramSource::with_paths(&buddyinfo, &zoneinfo);
        let bound = source.order_bound().unwrap();
        assert_eq!(bound, OrderBound::Exclusive(14));

        let zones = source.read_histograms().unwrap();
        let scorer = crate::FragmentationScorer::new(source.clone(), 9);
        assert_eq!(scorer.zone_external_fragmentation(&zones[0]), 100);
        let scorer = scorer.with_order_bound(bound);
        assert_eq!(scorer.zone_external_fragmentation(&zones[0]), 0);
        assert_eq!(scorer.system_snapshot().unwrap().iter().next().unwrap().score, 0);

        fs::remove_dir_all(&dir).unwrap();
    }
}
