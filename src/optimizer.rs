//! Tier-based aggregation optimizer (§4.8): proposes at most one
//! aggregation operation per scan, chosen to promote its merged result
//! into a strictly higher size tier than any of its sources.

use crate::db::Datarange;

const TIER_0_MAX: u64 = 10 * 1024 * 1024;
const TIER_1_MAX: u64 = 1024 * 1024 * 1024;
const TIER_2_MAX: u64 = 100 * 1024 * 1024 * 1024;
/// Single-object ceiling; the scan never proposes a run whose merged size
/// would exceed this (§4.7/§4.8).
const MERGE_CEILING: u64 = 2 * 1024 * 1024 * 1024;

/// Special-case threshold for fragmentation cleanup: a run this large
/// with a low average size per source is emitted regardless of whether
/// it crosses a tier boundary.
const FRAGMENTATION_RUN_LEN: usize = 1000;
const FRAGMENTATION_AVG_DATAPOINTS: i64 = 10;

fn tier(size_bytes: u64) -> u8 {
    if size_bytes < TIER_0_MAX {
        0
    } else if size_bytes < TIER_1_MAX {
        1
    } else if size_bytes < TIER_2_MAX {
        2
    } else {
        3
    }
}

#[derive(Debug, Clone)]
pub struct Proposal {
    pub dataset: String,
    pub lo: i64,
    pub hi: i64,
    pub source_ids: Vec<uuid::Uuid>,
}

/// `dataranges` must already belong to one dataset; the caller fetches
/// them via `MetaStore::list_dataranges`.
pub fn propose(dataset: &str, dataranges: &[Datarange]) -> Option<Proposal> {
    if dataranges.len() < 2 {
        return None;
    }
    let mut sorted: Vec<&Datarange> = dataranges.iter().collect();
    sorted.sort_by_key(|d| d.min_key);

    let mut run_start = 0usize;
    while run_start < sorted.len() - 1 {
        let mut run_end = run_start; // inclusive
        let mut run_bytes = sorted[run_start].size_bytes as u64;
        let mut max_source_tier = tier(run_bytes);

        loop {
            let Some(next) = sorted.get(run_end + 1) else { break };
            let contiguous = next.min_key == sorted[run_end].max_key + 1;
            if !contiguous {
                break;
            }
            let candidate_bytes = run_bytes + next.size_bytes as u64;
            if candidate_bytes > MERGE_CEILING {
                break;
            }
            let next_tier = tier(next.size_bytes as u64);
            max_source_tier = max_source_tier.max(next_tier);
            let promoted = tier(candidate_bytes) > max_source_tier;
            run_end += 1;
            run_bytes = candidate_bytes;
            if promoted {
                break;
            }
        }

        let run_len = run_end - run_start + 1;
        if run_len >= 2 {
            let run = &sorted[run_start..=run_end];
            let promotes = tier(run_bytes) > run.iter().map(|d| tier(d.size_bytes as u64)).max().unwrap_or(0);
            let total_datapoints: i64 = run.iter().map(|d| d.max_key - d.min_key + 1).sum();
            let avg_datapoints = total_datapoints / run_len as i64;
            let is_fragmentation_cleanup = run_len >= FRAGMENTATION_RUN_LEN && avg_datapoints < FRAGMENTATION_AVG_DATAPOINTS;

            if promotes || is_fragmentation_cleanup {
                return Some(Proposal {
                    dataset: dataset.to_owned(),
                    lo: run[0].min_key,
                    hi: run[run.len() - 1].max_key,
                    source_ids: run.iter().map(|d| d.id).collect(),
                });
            }
        }

        run_start = run_end.max(run_start + 1);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn d(min_key: i64, max_key: i64, size_bytes: i64) -> Datarange {
        Datarange {
            id: Uuid::new_v4(),
            dataset_name: "ds".to_owned(),
            data_key: String::new(),
            index_key: String::new(),
            min_key,
            max_key,
            size_bytes,
            upload_counter: 1,
        }
    }

    #[test]
    fn proposes_nothing_below_two_sources() {
        assert!(propose("ds", &[d(0, 9, 1024)]).is_none());
    }

    #[test]
    fn merges_contiguous_small_ranges_into_a_higher_tier() {
        let sources = vec![d(0, 9, 9 * 1024 * 1024), d(10, 19, 9 * 1024 * 1024)];
        let proposal = propose("ds", &sources).unwrap();
        assert_eq!((proposal.lo, proposal.hi), (0, 19));
        assert_eq!(proposal.source_ids.len(), 2);
    }

    #[test]
    fn skips_non_contiguous_ranges() {
        let sources = vec![d(0, 9, 9 * 1024 * 1024), d(20, 29, 9 * 1024 * 1024)];
        assert!(propose("ds", &sources).is_none());
    }

    #[test]
    fn does_not_propose_when_no_tier_promotion_occurs() {
        // Both already tier 1 (>=10MiB); merging them stays tier 1.
        let sources = vec![d(0, 9, 500 * 1024 * 1024), d(10, 19, 500 * 1024 * 1024)];
        assert!(propose("ds", &sources).is_none());
    }

    #[test]
    fn emits_fragmentation_cleanup_regardless_of_tier() {
        let sources: Vec<Datarange> = (0..1000i64).map(|i| d(i * 2, i * 2 + 1, 1024)).collect();
        let proposal = propose("ds", &sources).unwrap();
        assert_eq!(proposal.source_ids.len(), 1000);
    }
}
