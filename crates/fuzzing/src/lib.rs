//! Shared fuzzing and testing infrastructure for `page_fragmenter`.

use page_fragmenter::{
    ArenaConfig, Block, BuddyArena, ContigPageInfo, FragmentInjector, FragmentationScorer, Global,
    HistogramSource, InjectorConfig, Lock, OrderBound, OrderHistogram, PageAllocator,
    SingleThreadedLock, StdClock, StopReason, ZoneHistogram,
};
use mutatis::{mutators as m, DefaultMutate, Generate, Mutate};
use std::{collections::BTreeMap, time::Duration};

/// The largest block order of the arena test operations run against.
pub const ARENA_MAX_ORDER: u32 = 6;

/// A test operation.
#[derive(Clone, Debug, Mutate, bincode::Encode, bincode::Decode)]
pub enum Op {
    /// Allocate a block of `order` directly from the arena.
    Alloc { id: u32, order: u8 },
    /// Split the block with the given id into base pages.
    Split { id: u32 },
    /// Free the block, or every split page, with the given id.
    Free { id: u32 },
    /// Run a fragment injector for up to `steps` steps, then release it.
    Inject {
        order: u8,
        stop_score: u8,
        pressure: bool,
        steps: u8,
    },
}

impl Generate<Op> for OpMutator {
    fn generate(&mut self, ctx: &mut mutatis::Context) -> mutatis::Result<Op> {
        let choices: &[fn(&mut mutatis::Context) -> mutatis::Result<Op>] = &[
            |ctx| {
                Ok(Op::Alloc {
                    id: ctx.rng().gen_u32(),
                    order: m::range(0..=ARENA_MAX_ORDER as u8 + 1).generate(ctx)?,
                })
            },
            |ctx| {
                Ok(Op::Split {
                    id: ctx.rng().gen_u32(),
                })
            },
            |ctx| {
                Ok(Op::Free {
                    id: ctx.rng().gen_u32(),
                })
            },
            |ctx| {
                Ok(Op::Inject {
                    order: m::range(1..=ARENA_MAX_ORDER as u8 + 1).generate(ctx)?,
                    stop_score: m::range(0..=100).generate(ctx)?,
                    pressure: ctx.rng().gen_bool(),
                    steps: m::range(0..=64).generate(ctx)?,
                })
            },
        ];

        let f = ctx.rng().choose(choices).unwrap();
        f(ctx)
    }
}

/// A sequence of test operations to perform.
#[derive(Clone, Debug, Default, bincode::Encode, bincode::Decode)]
pub struct Ops {
    ops: Vec<Op>,
}

impl DefaultMutate for Ops {
    type DefaultMutate = OpsMutator;
}

#[derive(Default)]
pub struct OpsMutator;

impl Mutate<Ops> for OpsMutator {
    fn mutate(&mut self, c: &mut mutatis::Candidates<'_>, ops: &mut Ops) -> mutatis::Result<()> {
        // Completely random mutations on a single-element basis.
        m::default::<Vec<Op>>().mutate(c, &mut ops.ops)?;

        fn alloc_positions_and_ids(ops: &Ops) -> impl Iterator<Item = (usize, u32)> + '_ {
            ops.ops.iter().enumerate().filter_map(|(i, op)| match op {
                Op::Alloc { id, .. } => Some((i, *id)),
                _ => None,
            })
        }

        // Retarget an operation to an existing `id`.
        c.mutation(|ctx| {
            let num_allocs = alloc_positions_and_ids(ops).count();
            if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                let (_, new_id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                let op_index = ctx.rng().gen_index(ops.ops.len()).unwrap();
                match &mut ops.ops[op_index] {
                    Op::Alloc { id, .. } | Op::Split { id } | Op::Free { id } => {
                        *id = new_id;
                    }
                    Op::Inject { .. } => {}
                }
            }
            Ok(())
        })?;

        // Split or free an existing allocation some time after it is made.
        if !c.shrink() {
            c.mutation(|ctx| {
                let num_allocs = alloc_positions_and_ids(ops).count();
                if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                    let (op_index, id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                    let op = if ctx.rng().gen_bool() {
                        Op::Split { id }
                    } else {
                        Op::Free { id }
                    };
                    let index =
                        op_index + 1 + ctx.rng().gen_index(ops.ops.len() - op_index).unwrap();
                    ops.ops.insert(index, op);
                }
                Ok(())
            })?;
        }

        Ok(())
    }
}

macro_rules! ensure {
    ( $cond:expr , $msg:expr $( , $args:expr )* $(,)? ) => {{
        let cond = $cond;
        if !cond {
            let msg = format!($msg $( , $args )* );
            let str_cond = stringify!($cond);
            return Err(format!("check failed: `{str_cond}`: {msg}"));
        }
    }};
}

/// Memory held directly by the test, outside of any injector.
#[derive(Debug)]
enum Held {
    Block(Block<u64>),
    Pages(Vec<u64>),
}

impl Ops {
    /// Create a new `Ops` from the given test operations.
    pub fn new(ops: impl IntoIterator<Item = Op>) -> Self {
        let ops = ops.into_iter().collect();
        Ops { ops }
    }

    /// Remove the last operation, returning whether there was one.
    pub fn pop(&mut self) -> bool {
        self.ops.pop().is_some()
    }

    /// The arena test operations run against: two nodes, three zones, none
    /// of them a whole number of maximal blocks.
    pub fn arena_config() -> ArenaConfig {
        ArenaConfig::new(256, ARENA_MAX_ORDER)
            .with_zone(0, "DMA32", 200)
            .with_zone(0, "Normal", 530)
            .with_zone(1, "Normal", 300)
    }

    /// Run these test operations against a fresh arena.
    pub fn run(&self) -> Result<(), String> {
        let arena = BuddyArena::new(Self::arena_config(), Global, SingleThreadedLock::new())
            .map_err(|_| String::from("cannot allocate the arena"))?;
        self.run_with_arena(&arena)
    }

    /// Run these test operations against `arena`, which must be pristine.
    pub fn run_with_arena<L>(&self, arena: &BuddyArena<Global, L>) -> Result<(), String>
    where
        L: Lock,
    {
        log::debug!("========== Running test operations ==========");
        ensure!(arena.is_pristine(), "test operations need a pristine arena");

        let mut live: BTreeMap<u32, Held> = BTreeMap::new();

        let release = |id: u32, held: Held| {
            log::debug!("freeing id{id} -> {held:?}");
            match held {
                Held::Block(block) => arena.free(block.page, block.order),
                Held::Pages(pages) => {
                    for page in pages {
                        arena.free(page, 0);
                    }
                }
            }
        };

        for op in &self.ops {
            log::debug!("Running {op:?}");

            match *op {
                Op::Alloc { id, order } => {
                    if let Ok(block) = arena.allocate(u32::from(order)) {
                        ensure!(
                            block.page % (1 << block.order) == 0,
                            "block {block:?} is not naturally aligned",
                        );
                        if let Some(old) = live.remove(&id) {
                            release(id, old);
                        }
                        live.insert(id, Held::Block(block));
                    } else {
                        ensure!(
                            largest_free_order(arena).map_or(true, |o| o < u32::from(order)),
                            "allocation of order {order} failed with a large enough block free",
                        );
                    }
                }

                Op::Split { id } => {
                    if let Some(&Held::Block(block)) = live.get(&id) {
                        let pages = arena.split(block);
                        ensure!(
                            pages.len() == block.pages(),
                            "split of {block:?} returned {} pages",
                            pages.len(),
                        );
                        if let Some(&head) = pages.first() {
                            while arena.ref_count(head) > 1 {
                                arena.put_ref(head);
                            }
                        }
                        for &page in &pages {
                            ensure!(
                                arena.ref_count(page) == 1,
                                "split page {page} holds {} references",
                                arena.ref_count(page),
                            );
                        }
                        live.insert(id, Held::Pages(pages));
                    }
                }

                Op::Free { id } => {
                    if let Some(held) = live.remove(&id) {
                        release(id, held);
                    }
                }

                Op::Inject {
                    order,
                    stop_score,
                    pressure,
                    steps,
                } => inject(arena, order, stop_score, pressure, steps)?,
            }

            check_scores(arena)?;
        }

        // Finally, free everything still held.
        for (id, held) in live {
            release(id, held);
        }

        ensure!(
            arena.is_pristine(),
            "arena did not coalesce back after every page was freed",
        );
        ensure!(
            arena.arena_stats().invalid_frees == 0,
            "{} invalid frees",
            arena.arena_stats().invalid_frees,
        );
        Ok(())
    }
}

fn largest_free_order<L: Lock>(arena: &BuddyArena<Global, L>) -> Option<u32> {
    arena
        .zone_histograms()
        .iter()
        .flat_map(|zone| {
            (0..=ARENA_MAX_ORDER).filter(move |o| zone.histogram.free_blocks(*o) > 0)
        })
        .max()
}

/// Run an injector over `arena` and check that releasing it puts back
/// exactly what it took.
fn inject<L: Lock>(
    arena: &BuddyArena<Global, L>,
    order: u8,
    stop_score: u8,
    pressure: bool,
    steps: u8,
) -> Result<(), String> {
    // Orders past the arena's largest block exercise allocation failure.
    let order = u32::from(order) % (ARENA_MAX_ORDER + 1) + 1;
    let config = InjectorConfig::builder(i64::from(order))
        .stop_score(i64::from(stop_score % 101))
        .pressure(pressure)
        .score_interval(Duration::ZERO)
        .build()
        .map_err(|e| format!("bad injector config: {e}"))?;

    let before = arena.zone_histograms();
    let free_before = arena.memory_stats().free_pages;

    let scorer = FragmentationScorer::new(arena, order.min(ARENA_MAX_ORDER));
    let mut injector = FragmentInjector::new(config, arena, scorer, StdClock::new());
    for _ in 0..steps {
        if injector.step().is_stopped() {
            break;
        }
        check_scores(arena)?;
    }

    if let Some(reason) = injector.state().stop_reason() {
        log::debug!("injector stopped: {reason}");
        ensure!(
            !matches!(reason, StopReason::AllocatorContractViolation(_)),
            "the arena broke the page allocator contract: {reason}",
        );
        if let StopReason::ScoreThresholdReached {
            score, threshold, ..
        } = reason
        {
            ensure!(
                *score >= u64::from(*threshold),
                "stopped at score {score} below the threshold {threshold}",
            );
        }
    }

    let owned = injector.registry().pressure_len() + injector.registry().fragment_len();
    let summary = injector.release_all();
    ensure!(
        summary.units() == owned,
        "released {} units of the {owned} owned",
        summary.units(),
    );
    ensure!(summary.dead_units == 0, "{} dead units", summary.dead_units);
    ensure!(
        injector.release_all().units() == 0,
        "a second release freed memory again",
    );
    drop(injector);

    ensure!(
        arena.memory_stats().free_pages == free_before,
        "release left {} free pages, had {free_before}",
        arena.memory_stats().free_pages,
    );
    ensure!(
        arena.zone_histograms() == before,
        "release did not restore the free-area histograms",
    );
    Ok(())
}

/// Check the scorer's invariants over the arena's current histograms.
fn check_scores<L: Lock>(arena: &BuddyArena<Global, L>) -> Result<(), String> {
    let zones = arena
        .read_histograms()
        .map_err(|e| format!("cannot read histograms: {e}"))?;
    let bound = OrderBound::Inclusive(ARENA_MAX_ORDER);

    let free: u64 = zones.iter().map(|z| zone_free_pages(z, bound)).sum();
    ensure!(
        free == arena.memory_stats().free_pages,
        "histograms hold {free} free pages, memory stats {}",
        arena.memory_stats().free_pages,
    );

    for k in 0..=ARENA_MAX_ORDER {
        let scorer = FragmentationScorer::new(arena, k).with_order_bound(bound);
        for zone in &zones {
            let info = ContigPageInfo::fill(&zone.histogram, k, bound);
            ensure!(
                info.free_blocks_suitable << k <= info.free_pages,
                "more suitable than free pages in {zone:?} at order {k}",
            );
            ensure!(
                scorer.zone_external_fragmentation(zone) <= 100,
                "extfrag above 100% in {zone:?} at order {k}",
            );
        }

        let snapshot = scorer
            .system_snapshot()
            .map_err(|e| format!("cannot score: {e}"))?;
        for node in snapshot.iter() {
            let sum: u64 = node.zones.iter().map(|z| z.weighted_score).sum();
            ensure!(
                node.score == sum,
                "node {} scores {} but its zones sum to {sum}",
                node.node_id,
                node.score,
            );
            ensure!(node.score < 100, "node score {} out of range", node.score);
        }
    }
    Ok(())
}

fn zone_free_pages(zone: &ZoneHistogram, bound: OrderBound) -> u64 {
    bound
        .orders()
        .map(|o| zone.histogram.free_blocks(o) << o)
        .sum()
}

/// Check that splitting one free block never lowers the external
/// fragmentation index for any target order.
pub fn check_split_monotonicity(counts: &[u8], order: u8, target: u8) -> Result<(), String> {
    let bound = OrderBound::Inclusive(ARENA_MAX_ORDER);
    let order = u32::from(order) % (ARENA_MAX_ORDER + 1);
    let target = u32::from(target) % (ARENA_MAX_ORDER + 1);

    let before = OrderHistogram::from_counts(counts.iter().map(|c| u64::from(*c)));
    let mut after = before.clone();
    if !after.split_block(order) {
        return Ok(());
    }

    let a = ContigPageInfo::fill(&before, target, bound);
    let b = ContigPageInfo::fill(&after, target, bound);
    ensure!(
        a.free_pages == b.free_pages,
        "splitting changed the free page count",
    );
    ensure!(
        a.extfrag_for_order(target) <= b.extfrag_for_order(target),
        "splitting an order-{order} block lowered the order-{target} index from {} to {}",
        a.extfrag_for_order(target),
        b.extfrag_for_order(target),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mutatis::check::{Check, CheckError, CheckFailure};

    #[test]
    fn run_ops() {
        let _ = env_logger::try_init();

        let seed_corpus = [
            // Empty.
            Ops::default(),
            // Simple alloc/free pair.
            Ops::new([Op::Alloc { id: 0, order: 3 }, Op::Free { id: 0 }]),
            // Alloc, split, free the pages.
            Ops::new([
                Op::Alloc { id: 0, order: 4 },
                Op::Split { id: 0 },
                Op::Free { id: 0 },
            ]),
            // An order beyond the arena's largest block.
            Ops::new([Op::Alloc {
                id: 0,
                order: ARENA_MAX_ORDER as u8 + 1,
            }]),
            // Inject with held memory on both sides.
            Ops::new([
                Op::Alloc { id: 0, order: 0 },
                Op::Alloc { id: 1, order: 5 },
                Op::Split { id: 1 },
                Op::Inject {
                    order: 3,
                    stop_score: 50,
                    pressure: true,
                    steps: 40,
                },
                Op::Free { id: 0 },
            ]),
            // Inject until the arena is exhausted.
            Ops::new([Op::Inject {
                order: 2,
                stop_score: 100,
                pressure: false,
                steps: 255,
            }]),
        ];

        match Check::new().iters(10_000).shrink_iters(1).run_with(
            m::default::<Ops>(),
            seed_corpus,
            |ops| ops.run(),
        ) {
            Ok(()) => {}
            Err(CheckError::Failed(CheckFailure { value, message, .. })) => {
                panic!("test failure: {message}: {value:#?}")
            }
            Err(e) => panic!("check error: {e}"),
        }
    }

    #[test]
    fn splitting_never_lowers_fragmentation() {
        let _ = env_logger::try_init();

        let seed_corpus = [
            (vec![0u8, 0, 0, 1], 3u8, 2u8),
            (vec![5u8, 4, 3, 2, 1, 0, 1], 6, 6),
            (vec![], 0, 0),
        ];

        match Check::new().iters(10_000).shrink_iters(1).run_with(
            m::default::<(Vec<u8>, u8, u8)>(),
            seed_corpus,
            |(counts, order, target)| check_split_monotonicity(counts, *order, *target),
        ) {
            Ok(()) => {}
            Err(CheckError::Failed(CheckFailure { value, message, .. })) => {
                panic!("test failure: {message}: {value:#?}")
            }
            Err(e) => panic!("check error: {e}"),
        }
    }

    #[test]
    fn fragmenting_with_a_spin_lock() {
        let _ = env_logger::try_init();
        let arena = BuddyArena::new(Ops::arena_config(), Global, page_fragmenter::SpinLock::new())
            .unwrap();
        Ops::new([
            Op::Alloc { id: 7, order: 1 },
            Op::Inject {
                order: 4,
                stop_score: 30,
                pressure: false,
                steps: 100,
            },
        ])
        .run_with_arena(&arena)
        .unwrap();
    }
}
