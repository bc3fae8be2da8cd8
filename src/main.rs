use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::exit;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use log::debug;

use pidlog::config::{
    DEFAULT_BAUD, DEFAULT_EMPTY_READ_LIMIT, DEFAULT_FLOOR, DEFAULT_MAX_PLAUSIBLE,
    DEFAULT_MIN_PLAUSIBLE, DEFAULT_OUTPUT, DEFAULT_PORT, DEFAULT_RATIO, DEFAULT_READ_TIMEOUT,
    DEFAULT_SETTLE_DELAY,
};
use pidlog::plot::{self, PlotOutcome, Summary};
use pidlog::{
    catch_sigint, logging, read_samples, run_collection, run_monitor, run_set_setpoint, Event,
    FilterConfig, LinkConfig, LinkError, SessionConfig,
};

/// Samples collected by "collect and plot" when no count is given.
const COLLECT_PLOT_SAMPLES: u64 = 5000;

/// Default answer to the menu's "how many samples" question.
const MENU_SAMPLES: u64 = 1000;

#[derive(Parser, Debug)]
#[command(
    name = "pidlog",
    version,
    about = "Collect, monitor and plot data from the PID temperature controller"
)]
struct Cli {
    #[command(flatten)]
    link: LinkArgs,
    #[command(flatten)]
    tuning: TuningArgs,
    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,
    /// Defaults to the interactive menu
    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Args, Debug)]
struct LinkArgs {
    /// Serial port of the controller board
    #[arg(short, long, default_value = DEFAULT_PORT)]
    port: String,
    /// Baud rate
    #[arg(short, long, default_value_t = DEFAULT_BAUD)]
    baud: u32,
    /// Per-read timeout in milliseconds
    #[arg(long, default_value_t = DEFAULT_READ_TIMEOUT.as_millis() as u64)]
    read_timeout_ms: u64,
    /// Wait after opening the port, in milliseconds (the board resets on open)
    #[arg(long, default_value_t = DEFAULT_SETTLE_DELAY.as_millis() as u64)]
    settle_ms: u64,
}

#[derive(Args, Debug)]
struct TuningArgs {
    /// Consecutive empty reads that end a collection run
    #[arg(long, default_value_t = DEFAULT_EMPTY_READ_LIMIT)]
    empty_reads: u32,
    /// Smallest temperature jump accepted between samples
    #[arg(long, default_value_t = DEFAULT_FLOOR)]
    floor: f64,
    /// Accepted jump as a fraction of the last accepted temperature
    #[arg(long, default_value_t = DEFAULT_RATIO)]
    ratio: f64,
    /// Lowest plausible first temperature
    #[arg(long, default_value_t = DEFAULT_MIN_PLAUSIBLE, allow_hyphen_values = true)]
    min_temp: f64,
    /// Highest plausible first temperature
    #[arg(long, default_value_t = DEFAULT_MAX_PLAUSIBLE, allow_hyphen_values = true)]
    max_temp: f64,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Collect samples into a CSV file
    Collect {
        /// Number of samples, 0 runs until the device goes quiet or Ctrl+C
        #[arg(short = 'n', long, default_value_t = 0)]
        samples: u64,
        #[arg(short, long, default_value = DEFAULT_OUTPUT)]
        output: PathBuf,
    },
    /// Plot a CSV file recorded earlier
    Plot {
        #[arg(default_value = DEFAULT_OUTPUT)]
        input: PathBuf,
        /// SVG file to write, defaults to the input name with .svg
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Collect samples, then plot them
    CollectPlot {
        #[arg(short = 'n', long, default_value_t = COLLECT_PLOT_SAMPLES)]
        samples: u64,
        #[arg(short, long, default_value = DEFAULT_OUTPUT)]
        output: PathBuf,
    },
    /// Print live readings until Ctrl+C
    Monitor,
    /// Send a new temperature setpoint (yr)
    SetSetpoint {
        #[arg(allow_hyphen_values = true)]
        value: f64,
    },
    /// Prompt-driven menu
    Menu,
}

impl Cli {
    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            link: LinkConfig {
                port: self.link.port.clone(),
                baud: self.link.baud,
                read_timeout: Duration::from_millis(self.link.read_timeout_ms),
                settle_delay: Duration::from_millis(self.link.settle_ms),
                ..LinkConfig::default()
            },
            filter: FilterConfig {
                floor: self.tuning.floor,
                ratio: self.tuning.ratio,
                min_plausible: self.tuning.min_temp,
                max_plausible: self.tuning.max_temp,
            },
            empty_read_limit: self.tuning.empty_reads,
            ..SessionConfig::default()
        }
    }
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose);

    let config = cli.session_config();
    config.validate().context("invalid command line settings")?;

    match cli.command.unwrap_or(Cmd::Menu) {
        Cmd::Collect { samples, output } => {
            collect(&with_target(&config, samples, output))?;
        }
        Cmd::Plot { input, output } => {
            let output = output.unwrap_or_else(|| plot::default_plot_path(&input));
            plot_file(&input, &output)?;
        }
        Cmd::CollectPlot { samples, output } => {
            let config = with_target(&config, samples, output);
            collect(&config)?;
            plot_file(&config.output, &plot::default_plot_path(&config.output))?;
        }
        Cmd::Monitor => monitor(&config)?,
        Cmd::SetSetpoint { value } => set_setpoint(&config.link, value)?,
        Cmd::Menu => menu(config)?,
    }
    Ok(())
}

fn with_target(config: &SessionConfig, target: u64, output: PathBuf) -> SessionConfig {
    SessionConfig {
        target,
        output,
        ..config.clone()
    }
}

fn print_event(event: &Event<'_>) {
    match event {
        Event::Progress {
            accepted,
            target,
            percent,
        } => println!("{percent:>3}% ({accepted}/{target} samples)"),
        Event::Line(text) => println!("{text}"),
        _ => {}
    }
}

/// Ctrl+C is routed to the session only while it runs.
fn collect(config: &SessionConfig) -> Result<()> {
    let (_sigint, cancel) = catch_sigint().context("failed to install Ctrl+C handler")?;
    println!(
        "Connecting to {} at {} baud, writing {}...",
        config.link.port,
        config.link.baud,
        config.output.display()
    );
    println!("Press Ctrl+C to stop.");
    let outcome = run_collection(config, &cancel, print_event)
        .with_context(|| format!("collection on {} failed", config.link.port))?;
    println!(
        "Done ({}): {} samples saved, {} rejected as outliers, {} unreadable.",
        outcome.reason, outcome.accepted, outcome.rejected, outcome.skipped
    );
    Ok(())
}

fn plot_file(input: &Path, output: &Path) -> Result<()> {
    println!("Loading {}...", input.display());
    match plot::render(input, output)? {
        PlotOutcome::NoData => println!("The file is empty or holds no numeric data."),
        PlotOutcome::Rendered { samples, path } => {
            if let Some(summary) = read_samples(input).ok().as_deref().and_then(Summary::of) {
                println!(
                    "{} samples, ticks {}..{}, temperature min {:.2} / mean {:.2} / max {:.2}",
                    summary.samples,
                    summary.first_tick,
                    summary.last_tick,
                    summary.min,
                    summary.mean,
                    summary.max
                );
            }
            println!("Plotted {samples} samples to {}", path.display());
        }
    }
    Ok(())
}

fn monitor(config: &SessionConfig) -> Result<()> {
    let (_sigint, cancel) = catch_sigint().context("failed to install Ctrl+C handler")?;
    println!("Monitoring {}, press Ctrl+C to stop.", config.link.port);
    let lines = run_monitor(config, &cancel, print_event)
        .with_context(|| format!("monitoring {} failed", config.link.port))?;
    println!("Stopped after {lines} lines.");
    Ok(())
}

fn set_setpoint(link: &LinkConfig, value: f64) -> Result<()> {
    let replies = run_set_setpoint(link, value)
        .with_context(|| format!("setting the setpoint on {} failed", link.port))?;
    match replies.as_slice() {
        [] => println!("Setpoint {value} sent (no reply)."),
        replies => println!("Setpoint {value} sent, device replied: {}", replies.join(" | ")),
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Interactive menu
// ---------------------------------------------------------------------------

const MENU: &str = "\
1. Collect samples (n)
2. Plot
3. Collect and plot
4. Monitor
5. Settings and setpoint
0. Exit";

/// Print `label`, read one line. `None` on end of input.
fn prompt<R: BufRead>(input: &mut R, label: &str) -> Result<Option<String>> {
    print!("{label}");
    io::stdout().flush()?;
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim().to_string()))
}

fn parse_samples(answer: &str, default: u64) -> Result<u64> {
    if answer.is_empty() {
        return Ok(default);
    }
    answer
        .parse::<u64>()
        .with_context(|| format!("{answer:?} is not a sample count"))
}

/// Accepts a decimal comma, e.g. `29,5`.
fn parse_setpoint(answer: &str) -> Result<f64> {
    let value: f64 = answer
        .replace(',', ".")
        .parse()
        .with_context(|| format!("{answer:?} is not a temperature"))?;
    if !value.is_finite() {
        bail!("{answer:?} is not a temperature");
    }
    Ok(value)
}

fn menu(mut config: SessionConfig) -> Result<()> {
    let stdin = io::stdin();
    let mut input = stdin.lock();

    loop {
        println!("\n{MENU}");
        let Some(choice) = prompt(&mut input, "> ")? else {
            break;
        };

        let result = match choice.as_str() {
            "1" => menu_collect(&mut input, &config),
            "2" => plot_file(&config.output, &plot::default_plot_path(&config.output)),
            "3" => {
                let run = with_target(&config, COLLECT_PLOT_SAMPLES, config.output.clone());
                collect(&run)
                    .and_then(|_| plot_file(&run.output, &plot::default_plot_path(&run.output)))
            }
            "4" => monitor(&config),
            "5" => menu_settings(&mut input, &mut config),
            "0" | "q" | "quit" | "exit" => break,
            "" => continue,
            other => {
                println!("Unknown option {other:?}.");
                continue;
            }
        };

        // A failed action never ends the menu, an unreachable port included.
        if let Err(e) = result {
            match e.downcast_ref::<LinkError>() {
                Some(LinkError::StreamUnavailable { port, .. }) => {
                    eprintln!("Error: cannot open {port}. Is it in use or unplugged?")
                }
                _ => eprintln!("Error: {e:#}"),
            }
        }
    }
    Ok(())
}

fn menu_collect<R: BufRead>(input: &mut R, config: &SessionConfig) -> Result<()> {
    let Some(answer) = prompt(input, &format!("How many samples? (0 = unbounded) [{MENU_SAMPLES}]: "))?
    else {
        return Ok(());
    };
    let target = parse_samples(&answer, MENU_SAMPLES)?;
    collect(&with_target(config, target, config.output.clone()))
}

fn menu_settings<R: BufRead>(input: &mut R, config: &mut SessionConfig) -> Result<()> {
    let Some(port) = prompt(input, &format!("Port [{}]: ", config.link.port))? else {
        return Ok(());
    };
    let Some(baud) = prompt(input, &format!("Baud rate [{}]: ", config.link.baud))? else {
        return Ok(());
    };
    let Some(setpoint) = prompt(input, "Setpoint, e.g. 29.0: ")? else {
        return Ok(());
    };

    let mut updated = config.clone();
    if !port.is_empty() {
        updated.link.port = port;
    }
    if !baud.is_empty() {
        updated.link.baud = baud
            .parse()
            .with_context(|| format!("{baud:?} is not a baud rate"))?;
    }
    updated.validate()?;
    let value = parse_setpoint(&setpoint)?;

    debug!("settings now {} at {} baud", updated.link.port, updated.link.baud);
    *config = updated;
    set_setpoint(&config.link, value)
}
