//! memprobe command-line probe

use std::io;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use memprobe_core::config::{parse_byte, parse_byte_size, DEFAULT_PAYLOAD_BYTES};
use memprobe_core::sched;
use memprobe_core::{
    Benchmark, JsonLinesSink, LogSink, Placement, ProbeConfig, ProbeError, SimdWidth, StrategyKind,
    TelemetrySink,
};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// memprobe - where do my pages live, and where was I scheduled?
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Access strategy (flush, stream, simd)
    #[arg(short, long, default_value = "flush", value_parser = parse_strategy)]
    strategy: StrategyKind,

    /// Region size, e.g. 4096, 64MiB, 4GiB
    #[arg(short, long, default_value_t = DEFAULT_PAYLOAD_BYTES, value_parser = parse_payload)]
    payload: usize,

    /// Fill byte for the flush and stream strategies (decimal or 0x..)
    #[arg(long, default_value = "0x00", value_parser = parse_fill)]
    fill: u8,

    /// Bind the region to one NUMA node
    #[arg(long, conflicts_with = "interleave")]
    membind: Option<usize>,

    /// Interleave the region across all NUMA nodes
    #[arg(long)]
    interleave: bool,

    /// Force a SIMD width for the simd strategy (512, 256, 128, scalar)
    #[arg(long, value_parser = parse_width)]
    simd_width: Option<SimdWidth>,

    /// Advise transparent huge pages for the region
    #[arg(long)]
    huge_pages: bool,

    /// Where the result record goes
    #[arg(long, value_enum, default_value_t = Output::Log)]
    output: Output,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log line format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Print the detected topology and exit without running
    #[arg(long)]
    show_topology: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Output {
    /// One structured log event
    Log,
    /// One JSON line on stdout
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn parse_strategy(s: &str) -> Result<StrategyKind, ProbeError> {
    s.parse()
}

fn parse_payload(s: &str) -> Result<usize, ProbeError> {
    parse_byte_size(s)
}

fn parse_fill(s: &str) -> Result<u8, ProbeError> {
    parse_byte(s)
}

fn parse_width(s: &str) -> Result<SimdWidth, ProbeError> {
    s.parse()
}

impl Args {
    fn placement(&self) -> Placement {
        match (self.membind, self.interleave) {
            (Some(node), _) => Placement::Node(node),
            (None, true) => Placement::Interleaved,
            (None, false) => Placement::FirstTouch,
        }
    }

    fn probe_config(&self) -> Result<ProbeConfig> {
        let mut builder = ProbeConfig::builder()
            .strategy(self.strategy)
            .payload_bytes(self.payload)
            .fill_byte(self.fill)
            .placement(self.placement())
            .huge_pages(self.huge_pages);
        if let Some(width) = self.simd_width {
            builder = builder.simd_width(width);
        }
        Ok(builder.build()?)
    }
}

fn init_tracing(args: &Args) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("memprobe={}", args.log_level).into());

    let (text, json) = match args.log_format {
        LogFormat::Text => (
            Some(tracing_subscriber::fmt::layer().with_writer(io::stderr)),
            None,
        ),
        LogFormat::Json => (
            None,
            Some(tracing_subscriber::fmt::layer().json().with_writer(io::stderr)),
        ),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(text)
        .with(json)
        .init();
}

fn run(args: &Args) -> Result<()> {
    let config = args.probe_config().context("invalid probe configuration")?;

    info!("Starting memprobe");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let bench = Benchmark::detect(config)?;
    if args.show_topology {
        println!("{}", bench.topology().summary());
        println!(
            "Scheduler statistics: {}",
            if sched::stats_available() { "available" } else { "unavailable" }
        );
        return Ok(());
    }

    let config = bench.config();
    info!(
        strategy = %config.strategy,
        payload_bytes = config.payload_bytes,
        placement = ?config.placement,
        "Configured probe"
    );

    let mut sink: Box<dyn TelemetrySink> = match args.output {
        Output::Log => Box::new(LogSink),
        Output::Json => Box::new(JsonLinesSink::new(io::stdout())),
    };

    bench.run(sink.as_mut())?;
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(&args);

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => ExitCode::from(report_failure(&e)),
    }
}

/// Logs a failed run and returns its exit code.
fn report_failure(e: &anyhow::Error) -> u8 {
    match e.downcast_ref::<ProbeError>() {
        Some(probe) if probe.is_environmental() => {
            error!(environmental = true, "{e:#}");
            warn!("the host refused a topology or scheduler query; results from this machine are unavailable");
            probe.exit_code()
        }
        Some(probe) => {
            error!(environmental = false, "{e:#}");
            probe.exit_code()
        }
        None => {
            error!("{e:#}");
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["memprobe"]);
        assert_eq!(args.strategy, StrategyKind::FlushBased);
        assert_eq!(args.payload, 4 << 30);
        assert_eq!(args.fill, 0);
        assert_eq!(args.placement(), Placement::FirstTouch);
        assert_eq!(args.output, Output::Log);
    }

    #[test]
    fn test_full_command_line() {
        let args = Args::parse_from([
            "memprobe",
            "--strategy",
            "simd",
            "--payload",
            "64MiB",
            "--fill",
            "0xAA",
            "--membind",
            "1",
            "--simd-width",
            "128",
            "--output",
            "json",
            "--log-format",
            "json",
        ]);
        assert_eq!(args.strategy, StrategyKind::StreamingAdaptiveWidth);
        assert_eq!(args.payload, 64 << 20);
        assert_eq!(args.fill, 0xAA);
        assert_eq!(args.placement(), Placement::Node(1));
        assert_eq!(args.simd_width, Some(SimdWidth::W128));
        assert_eq!(args.output, Output::Json);
        assert_eq!(args.log_format, LogFormat::Json);
    }

    #[test]
    fn test_membind_conflicts_with_interleave() {
        assert!(Args::try_parse_from(["memprobe", "--membind", "0", "--interleave"]).is_err());
    }

    #[test]
    fn test_zero_payload_is_rejected() {
        let args = Args::parse_from(["memprobe", "--payload", "0"]);
        assert!(args.probe_config().is_err());
    }

    #[test]
    fn test_bad_values_are_rejected() {
        assert!(Args::try_parse_from(["memprobe", "--strategy", "random"]).is_err());
        assert!(Args::try_parse_from(["memprobe", "--payload", "4XB"]).is_err());
        assert!(Args::try_parse_from(["memprobe", "--fill", "300"]).is_err());
    }

    #[test]
    fn test_show_topology_flag() {
        assert!(!Args::parse_from(["memprobe"]).show_topology);
        assert!(Args::parse_from(["memprobe", "--show-topology"]).show_topology);
    }

    #[test]
    fn test_failures_map_to_exit_code() {
        let environmental = anyhow::Error::from(ProbeError::SchedulingStatsUnavailable(
            "/proc/thread-self/sched".into(),
        ));
        assert_eq!(report_failure(&environmental), 1);

        let integrity = anyhow::Error::from(ProbeError::DataIntegrity {
            offset: 0,
            expected: 1,
            actual: 2,
        });
        assert_eq!(report_failure(&integrity), 1);

        assert_eq!(report_failure(&anyhow::anyhow!("unrelated")), 1);
    }
}
