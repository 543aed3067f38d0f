//! Operator command line for `page_fragmenter`.

use page_fragmenter::{
    ArenaConfig, BuddyArena, Clock, ConfigError, FragmentInjector, FragmentationScorer, Global,
    HistogramSource, InjectorConfig, PageAllocator, ScoreReporter, SpinLock, StdClock,
    SystemScore, DEFAULT_HUGE_PAGE_ORDER,
};
use std::{env, error::Error, fmt, io, process::ExitCode, sync::Arc};

/// Base pages in the simulated arena: 128 MiB of 4 KiB pages.
const SIMULATED_PAGES: u64 = 1 << 15;

const USAGE: &str = "\
Usage:
    Fragment memory:   page-fragmenter fragment <order> [-s <stop score>] [-r] [--no-pressure]
                                        [--floor <pct>] [--simulate] [--no-hold]
    Show stats:        page-fragmenter stats
    Report scores:     page-fragmenter watch [--seconds <n>]";

#[derive(Clone, Debug, PartialEq, Eq)]
struct FragmentArgs {
    order: i64,
    stop_score: Option<i64>,
    report: bool,
    pressure: bool,
    floor: Option<i64>,
    simulate: bool,
    hold: bool,
}

impl FragmentArgs {
    fn config(&self) -> Result<InjectorConfig, ConfigError> {
        let mut builder = InjectorConfig::builder(self.order)
            .pressure(self.pressure)
            .report(self.report);
        if let Some(score) = self.stop_score {
            builder = builder.stop_score(score);
        }
        if let Some(floor) = self.floor {
            builder = builder.free_ratio_floor(floor);
        }
        builder.build()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Command {
    Fragment(FragmentArgs),
    Stats,
    Watch { seconds: Option<u64> },
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum ArgsError {
    NoCommand,
    UnknownCommand(String),
    UnknownFlag(String),
    MissingValue(&'static str),
    BadValue { what: &'static str, value: String },
}

impl fmt::Display for ArgsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgsError::NoCommand => write!(f, "no command given"),
            ArgsError::UnknownCommand(c) => write!(f, "unknown command `{c}`"),
            ArgsError::UnknownFlag(flag) => write!(f, "unknown flag `{flag}`"),
            ArgsError::MissingValue(what) => write!(f, "missing {what}"),
            ArgsError::BadValue { what, value } => write!(f, "bad {what} `{value}`"),
        }
    }
}

impl Error for ArgsError {}

fn value<T: std::str::FromStr>(
    args: &mut impl Iterator<Item = String>,
    what: &'static str,
) -> Result<T, ArgsError> {
    let value = args.next().ok_or(ArgsError::MissingValue(what))?;
    value
        .parse()
        .map_err(|_| ArgsError::BadValue { what, value })
}

/// Parse the arguments following the program name.
///
/// Ranges are not checked here; the injector configuration builder does that.
fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Command, ArgsError> {
    let mut args = args.into_iter();
    let command = args.next().ok_or(ArgsError::NoCommand)?;

    match command.as_str() {
        "fragment" | "-f" => {
            let mut fragment = FragmentArgs {
                order: value(&mut args, "order")?,
                stop_score: None,
                report: false,
                pressure: true,
                floor: None,
                simulate: false,
                hold: true,
            };
            while let Some(flag) = args.next() {
                match flag.as_str() {
                    "-s" | "--stop-score" => {
                        fragment.stop_score = Some(value(&mut args, "stop score")?)
                    }
                    "-r" | "--report" => fragment.report = true,
                    "--no-pressure" => fragment.pressure = false,
                    "--floor" => fragment.floor = Some(value(&mut args, "free ratio floor")?),
                    "--simulate" => fragment.simulate = true,
                    "--no-hold" => fragment.hold = false,
                    _ => return Err(ArgsError::UnknownFlag(flag)),
                }
            }
            Ok(Command::Fragment(fragment))
        }

        "stats" | "-s" => match args.next() {
            None => Ok(Command::Stats),
            Some(flag) => Err(ArgsError::UnknownFlag(flag)),
        },

        "watch" => {
            let mut seconds = None;
            while let Some(flag) = args.next() {
                match flag.as_str() {
                    "--seconds" => seconds = Some(value(&mut args, "number of seconds")?),
                    _ => return Err(ArgsError::UnknownFlag(flag)),
                }
            }
            Ok(Command::Watch { seconds })
        }

        _ => Err(ArgsError::UnknownCommand(command)),
    }
}

fn print_scores(snapshot: &SystemScore) {
    for node in snapshot.iter() {
        println!(
            "node {}: fragmentation score {} ({} present pages)",
            node.node_id, node.score, node.present_pages_total
        );
        for zone in &node.zones {
            println!(
                "    zone {:<8} extfrag {:>3}%  weighted {:>3}",
                zone.zone_name, zone.extfrag_percent, zone.weighted_score
            );
        }
    }
}

fn wait_for_enter(prompt: &str) -> io::Result<()> {
    println!("{prompt}");
    io::stdin().read_line(&mut String::new())?;
    Ok(())
}

/// Run the injector to its stop, report, optionally hold the memory, then
/// release it.
fn finish<A, S, C>(
    injector: &mut FragmentInjector<A, S, C>,
    reporter: Option<ScoreReporter>,
    hold: bool,
) -> io::Result<()>
where
    A: PageAllocator,
    S: HistogramSource,
    C: Clock,
{
    let reason = injector.run();
    println!("stopped: {reason}");

    let stats = injector.stats();
    println!(
        "{} iterations, {} pages retained, {} pressure blocks, {} allocation failures",
        stats.iterations,
        injector.registry().fragment_len(),
        injector.registry().pressure_len(),
        stats.allocation_failures
    );
    match injector.scorer().system_snapshot() {
        Ok(snapshot) => print_scores(&snapshot),
        Err(e) => log::warn!("cannot score the final state: {e}"),
    }

    let held = if hold {
        wait_for_enter("Press Enter to release the fragmented memory")
    } else {
        Ok(())
    };

    if let Some(reporter) = reporter {
        reporter.stop();
    }
    let summary = injector.release_all();
    println!(
        "released {} pages in {} units",
        summary.pages,
        summary.units()
    );
    held
}

fn spawn_reporter<S>(
    enabled: bool,
    scorer: FragmentationScorer<S>,
) -> io::Result<Option<ScoreReporter>>
where
    S: HistogramSource + Send + 'static,
{
    if !enabled {
        return Ok(None);
    }
    ScoreReporter::spawn(scorer, ScoreReporter::DEFAULT_PERIOD).map(Some)
}

fn fragment_simulated(args: &FragmentArgs, config: InjectorConfig) -> Result<(), Box<dyn Error>> {
    let arena = BuddyArena::new(
        ArenaConfig::single_zone(SIMULATED_PAGES),
        Global,
        SpinLock::new(),
    )
    .map_err(|_| "cannot allocate the simulated arena")?;
    let arena = Arc::new(arena);

    let reporter = spawn_reporter(
        config.report_enabled(),
        FragmentationScorer::new(Arc::clone(&arena), DEFAULT_HUGE_PAGE_ORDER),
    )?;
    let scorer = FragmentationScorer::new(Arc::clone(&arena), DEFAULT_HUGE_PAGE_ORDER);
    let mut injector = FragmentInjector::new(config, Arc::clone(&arena), scorer, StdClock::new());
    finish(&mut injector, reporter, args.hold)?;
    drop(injector);

    log::info!("simulated arena pristine: {}", arena.is_pristine());
    Ok(())
}

#[cfg(target_os = "linux")]
mod host_commands {
    use super::*;
    use page_fragmenter::{
        host::{self, MmapPageAllocator, ProcHistogramSource},
        FreeAreaTable,
    };
    use std::{thread, time::Duration};

    pub(super) fn fragment(
        args: &FragmentArgs,
        config: InjectorConfig,
    ) -> Result<(), Box<dyn Error>> {
        let order = host::huge_page_order();
        let bound = ProcHistogramSource::new().order_bound()?;
        let reporter = spawn_reporter(
            config.report_enabled(),
            FragmentationScorer::new(ProcHistogramSource::new(), order).with_order_bound(bound),
        )?;
        let scorer =
            FragmentationScorer::new(ProcHistogramSource::new(), order).with_order_bound(bound);
        let mut injector =
            FragmentInjector::new(config, MmapPageAllocator::new(), scorer, StdClock::new());
        finish(&mut injector, reporter, args.hold)?;
        Ok(())
    }

    pub(super) fn stats() -> Result<(), Box<dyn Error>> {
        let source = ProcHistogramSource::new();
        let bound = source.order_bound()?;
        let zones = source.read_histograms()?;
        let table = FreeAreaTable::from_zones(&zones, host::page_size(), bound);
        print!("{table}");
        println!();
        print_scores(&SystemScore::from_zones(
            &zones,
            host::huge_page_order(),
            bound,
        ));
        Ok(())
    }

    pub(super) fn watch(seconds: Option<u64>) -> Result<(), Box<dyn Error>> {
        let source = ProcHistogramSource::new();
        let bound = source.order_bound()?;
        let scorer =
            FragmentationScorer::new(source, host::huge_page_order()).with_order_bound(bound);
        let reporter = ScoreReporter::spawn(scorer, ScoreReporter::DEFAULT_PERIOD)?;
        match seconds {
            Some(seconds) => thread::sleep(Duration::from_secs(seconds)),
            None => wait_for_enter("Reporting; press Enter to stop")?,
        }
        let reports = reporter.stop();
        log::info!("{reports} reports");
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
mod host_commands {
    use super::*;

    const NO_HOST: &str = "the host backend needs Linux; try `fragment --simulate`";

    pub(super) fn fragment(_: &FragmentArgs, _: InjectorConfig) -> Result<(), Box<dyn Error>> {
        Err(NO_HOST.into())
    }

    pub(super) fn stats() -> Result<(), Box<dyn Error>> {
        Err(NO_HOST.into())
    }

    pub(super) fn watch(_: Option<u64>) -> Result<(), Box<dyn Error>> {
        Err(NO_HOST.into())
    }
}

fn run(command: Command) -> Result<(), Box<dyn Error>> {
    match command {
        Command::Fragment(args) => {
            let config = args.config()?;
            if args.simulate {
                fragment_simulated(&args, config)
            } else {
                host_commands::fragment(&args, config)
            }
        }
        Command::Stats => host_commands::stats(),
        Command::Watch { seconds } => host_commands::watch(seconds),
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let command = match parse_args(env::args().skip(1)) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("error: {e}");
            eprintln!("{USAGE}");
            return ExitCode::FAILURE;
        }
    };

    match run(command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
