//! Parallel split planner
//!
//! Mid-transfer, the scheduler asks whether fanning the tail of the current
//! response out across sibling sessions reduces total completion time. The
//! planner is a pure function over a snapshot of the session pool: it prices
//! every party by its projected time to finish the splittable tail, hands out
//! shares inversely proportional to that time, and emits contiguous
//! byte-range sub-requests for everything the main session gives up.
//!
//! Blocks expected to arrive on the main session within the next RTT are
//! excluded up front: those bytes cannot be fetched anywhere else sooner.
//! Sessions that are not open yet enter the estimate with the main session's
//! channel parameters, which lets a cold pool still fan out.

use super::timing::time_to_finish;

/// Channel snapshot of one sibling session at plan time.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub id: u64,
    /// Bytes still queued on the session across its assigned requests.
    pub remaining: u64,
    /// Latest measured throughput, bytes per second. `None` before the first
    /// sample; the main session's value is substituted.
    pub bandwidth: Option<f64>,
    pub rtt_secs: f64,
}

/// Everything the planner needs for one decision.
#[derive(Debug, Clone)]
pub struct SplitContext {
    /// Bytes of the response already read on the main session.
    pub received: u64,
    /// Bytes the main session still has to read.
    pub remaining: u64,
    /// Declared total body length.
    pub content_length: u64,
    /// Unified block size for this decision.
    pub block_size: u64,
    /// Main session throughput, bytes per second.
    pub bandwidth: f64,
    /// Main session RTT in seconds.
    pub rtt_secs: f64,
    /// Cap on concurrent sessions to this origin.
    pub max_sessions: usize,
    /// Dispatchable siblings, excluding the main session.
    pub siblings: Vec<SessionSnapshot>,
    /// Session slots not opened yet; each is priced as a hypothetical
    /// sibling.
    pub unopened: usize,
}

/// One planned byte-range sub-request. `session: None` means the executor
/// must acquire (possibly dial) a session itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubRange {
    pub session: Option<u64>,
    /// Absolute inclusive bounds within the response body.
    pub start: u64,
    pub end: u64,
}

/// Outcome of a positive split decision.
#[derive(Debug, Clone)]
pub struct SplitPlan {
    /// New exclusive end of the main session's segment: the main request
    /// stops after delivering bytes `[0, main_new_end)`.
    pub main_new_end: u64,
    /// Contiguous ranges covering `[main_new_end, content_length - 1]`.
    pub ranges: Vec<SubRange>,
}

struct Party {
    session: Option<u64>,
    share: f64,
}

/// Decide whether to split, and how.
#[must_use]
pub fn plan_split(ctx: &SplitContext) -> Option<SplitPlan> {
    let block = ctx.block_size;
    if block == 0 || ctx.bandwidth <= 0.0 || ctx.max_sessions < 2 {
        return None;
    }
    if ctx.remaining < block {
        // small tails ride out on the main session
        return None;
    }
    debug_assert_eq!(ctx.received + ctx.remaining, ctx.content_length);

    let remaining_blocks = ctx.remaining.div_ceil(block);
    let inflight_next_rtt = ((ctx.bandwidth * ctx.rtt_secs) / block as f64).ceil() as u64;
    let splittable = remaining_blocks.saturating_sub(inflight_next_rtt);
    if splittable <= 1 {
        return None;
    }
    let split_bytes = splittable * block;

    // Price every party: the main session finishing the tail alone, each
    // dispatchable sibling, and hypothetical sessions for the unopened slots.
    let main_time = split_bytes as f64 / ctx.bandwidth;

    let mut parties: Vec<Party> = Vec::with_capacity(ctx.max_sessions - 1);
    let mut total_share = 1.0 / main_time;
    let main_share = 1.0 / main_time;

    for sibling in ctx.siblings.iter().take(ctx.max_sessions - 1) {
        let bandwidth = sibling
            .bandwidth
            .filter(|b| *b > 0.0)
            .unwrap_or(ctx.bandwidth);
        let rtt = if sibling.rtt_secs > 0.0 {
            sibling.rtt_secs
        } else {
            ctx.rtt_secs
        };
        let time = time_to_finish(sibling.remaining, bandwidth, rtt, split_bytes);
        let share = 1.0 / time;
        total_share += share;
        parties.push(Party {
            session: Some(sibling.id),
            share,
        });
    }
    for _ in 0..ctx.unopened {
        if parties.len() >= ctx.max_sessions - 1 {
            break;
        }
        let time = time_to_finish(0, ctx.bandwidth, ctx.rtt_secs, split_bytes);
        let share = 1.0 / time;
        total_share += share;
        parties.push(Party {
            session: None,
            share,
        });
    }
    if parties.is_empty() {
        return None;
    }

    // The main session's cut of the splittable tail, floored into blocks.
    let mut main_blocks = ((main_share / total_share) * splittable as f64).floor() as u64;
    main_blocks = main_blocks.clamp(1, splittable);
    if main_blocks >= splittable {
        return None;
    }
    let main_new_end = ctx.received + main_blocks * block;
    let last_byte = ctx.content_length - 1;
    debug_assert!(main_new_end <= last_byte);

    // Hand the rest out proportionally, rounded up, in snapshot order. The
    // final sub-range absorbs the tail bytes that rounding and the inflight
    // exclusion would otherwise orphan.
    let sub_blocks = splittable - main_blocks;
    let sibling_share: f64 = parties.iter().map(|p| p.share).sum();

    let mut ranges = Vec::new();
    let mut cursor = main_new_end;
    let mut left = sub_blocks;
    for party in &parties {
        if left == 0 || cursor > last_byte {
            break;
        }
        let mut blocks = ((party.share / sibling_share) * sub_blocks as f64).ceil() as u64;
        blocks = blocks.min(left);
        if blocks < 1 {
            continue;
        }
        let end = (cursor + blocks * block - 1).min(last_byte);
        ranges.push(SubRange {
            session: party.session,
            start: cursor,
            end,
        });
        cursor = end + 1;
        left -= blocks;
    }

    let last = ranges.last_mut()?;
    last.end = last_byte;

    Some(SplitPlan {
        main_new_end,
        ranges,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;
    const BLOCK: u64 = 32 * 1024;

    fn ctx_after_first_block(content_length: u64, bandwidth: f64, rtt_secs: f64) -> SplitContext {
        SplitContext {
            received: BLOCK,
            remaining: content_length - BLOCK,
            content_length,
            block_size: BLOCK,
            bandwidth,
            rtt_secs,
            max_sessions: 4,
            siblings: Vec::new(),
            unopened: 0,
        }
    }

    fn assert_contiguous(plan: &SplitPlan, content_length: u64) {
        let mut cursor = plan.main_new_end;
        for range in &plan.ranges {
            assert_eq!(range.start, cursor, "gap before {range:?}");
            assert!(range.start <= range.end, "inverted {range:?}");
            cursor = range.end + 1;
        }
        assert_eq!(cursor, content_length, "cover stops short of the body end");
    }

    #[test]
    fn tail_below_one_block_is_not_split() {
        let mut ctx = ctx_after_first_block(4 * MIB, 10.0 * MIB as f64, 0.02);
        ctx.remaining = BLOCK - 1;
        ctx.received = ctx.content_length - ctx.remaining;
        assert!(plan_split(&ctx).is_none());
    }

    #[test]
    fn inflight_subtraction_blocks_small_splits() {
        // 96 KiB body on one fast session: everything left is either in
        // flight within the next RTT or a single block.
        let mut ctx = ctx_after_first_block(96 * 1024, 10.0 * MIB as f64, 0.02);
        ctx.max_sessions = 4;
        ctx.unopened = 3;
        assert!(plan_split(&ctx).is_none());
    }

    #[test]
    fn no_parties_means_no_split() {
        let mut ctx = ctx_after_first_block(4 * MIB, 10.0 * MIB as f64, 0.02);
        ctx.max_sessions = 1;
        assert!(plan_split(&ctx).is_none());
    }

    #[test]
    fn even_four_way_split() {
        // Four sessions with identical channels: 10 MiB/s, 20 ms RTT.
        let bandwidth = 10.0 * MIB as f64;
        let mut ctx = ctx_after_first_block(4 * MIB, bandwidth, 0.02);
        ctx.siblings = (1..=3)
            .map(|id| SessionSnapshot {
                id,
                remaining: 0,
                bandwidth: Some(bandwidth),
                rtt_secs: 0.02,
            })
            .collect();

        let plan = plan_split(&ctx).expect("split expected");
        assert_contiguous(&plan, ctx.content_length);
        assert_eq!(plan.ranges.len(), 3);

        // main keeps 31 of the 120 splittable blocks: its new end lands on
        // the 1 MiB boundary
        assert_eq!(plan.main_new_end, MIB);

        // near-even shares: 30 blocks each, the final range absorbing the
        // inflight residue
        let blocks =
            |r: &SubRange| (r.end - r.start + 1).div_ceil(BLOCK);
        assert_eq!(blocks(&plan.ranges[0]), 30);
        assert_eq!(blocks(&plan.ranges[1]), 30);
        assert_eq!(plan.ranges[2].end, ctx.content_length - 1);
        assert!(blocks(&plan.ranges[2]) >= 29);
    }

    #[test]
    fn asymmetric_split_favors_the_fast_main() {
        let bandwidth = 10.0 * MIB as f64;
        let mut ctx = ctx_after_first_block(4 * MIB, bandwidth, 0.02);
        ctx.siblings = vec![
            // B: measured at half the main session's throughput
            SessionSnapshot {
                id: 1,
                remaining: 0,
                bandwidth: Some(bandwidth / 2.0),
                rtt_secs: 0.02,
            },
            // C: cold, no samples yet; inherits the main parameters
            SessionSnapshot {
                id: 2,
                remaining: 0,
                bandwidth: None,
                rtt_secs: 0.02,
            },
        ];
        ctx.unopened = 1;

        let plan = plan_split(&ctx).expect("split expected");
        assert_contiguous(&plan, ctx.content_length);

        let main_bytes = plan.main_new_end - ctx.received;
        let slow_sibling = plan
            .ranges
            .iter()
            .find(|r| r.session == Some(1))
            .expect("slow sibling allocated");
        // the main session, paying no readiness RTT, keeps the largest share
        assert!(main_bytes > slow_sibling.end - slow_sibling.start + 1);
        for range in &plan.ranges {
            if range.end != ctx.content_length - 1 {
                assert!(main_bytes > range.end - range.start + 1);
            }
        }
    }

    #[test]
    fn cold_pool_pads_with_hypothetical_sessions() {
        let mut ctx = ctx_after_first_block(4 * MIB, 10.0 * MIB as f64, 0.02);
        ctx.unopened = 3;

        let plan = plan_split(&ctx).expect("split expected");
        assert_contiguous(&plan, ctx.content_length);
        assert!(!plan.ranges.is_empty());
        assert!(plan.ranges.len() <= ctx.max_sessions - 1);
        assert!(plan.ranges.iter().all(|r| r.session.is_none()));
    }

    #[test]
    fn padding_never_exceeds_the_session_cap() {
        let mut ctx = ctx_after_first_block(4 * MIB, 10.0 * MIB as f64, 0.02);
        ctx.siblings = (1..=3)
            .map(|id| SessionSnapshot {
                id,
                remaining: 0,
                bandwidth: Some(10.0 * MIB as f64),
                rtt_secs: 0.02,
            })
            .collect();
        // pool already full: hypothetical slots must not appear
        ctx.unopened = 5;

        let plan = plan_split(&ctx).expect("split expected");
        assert!(plan.ranges.len() <= 3);
        assert!(plan.ranges.iter().all(|r| r.session.is_some()));
    }

    #[test]
    fn planned_bytes_cover_exactly_the_handed_off_tail() {
        let mut ctx = ctx_after_first_block(4 * MIB, 10.0 * MIB as f64, 0.02);
        ctx.unopened = 3;

        let plan = plan_split(&ctx).expect("split expected");
        let sub_bytes: u64 = plan.ranges.iter().map(|r| r.end - r.start + 1).sum();
        assert_eq!(sub_bytes, ctx.content_length - plan.main_new_end);
    }

    #[test]
    fn busy_pool_with_queued_bytes_still_plans_contiguously() {
        let bandwidth = 10.0 * MIB as f64;
        let mut ctx = ctx_after_first_block(8 * MIB, bandwidth, 0.02);
        ctx.siblings = vec![
            SessionSnapshot {
                id: 1,
                remaining: 2 * MIB,
                bandwidth: Some(bandwidth),
                rtt_secs: 0.02,
            },
            SessionSnapshot {
                id: 2,
                remaining: 0,
                bandwidth: Some(bandwidth / 4.0),
                rtt_secs: 0.04,
            },
        ];
        ctx.unopened = 1;

        let plan = plan_split(&ctx).expect("split expected");
        assert_contiguous(&plan, ctx.content_length);
        // a sibling still draining 2 MiB gets less than the idle unopened slot
        let busy = plan.ranges.iter().find(|r| r.session == Some(1));
        let fresh = plan.ranges.iter().find(|r| r.session.is_none());
        if let (Some(busy), Some(fresh)) = (busy, fresh) {
            if fresh.end != ctx.content_length - 1 {
                assert!(busy.end - busy.start <= fresh.end - fresh.start);
            }
        }
    }
}
