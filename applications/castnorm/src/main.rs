/// castnorm - two-pass loudness normalisation for podcast episodes
use anyhow::Context;
use castnorm_engine::{NativeEngine, WavEncoding, WavSink, WavSource};
use castnorm_loudness::{NormalisationConfig, NormalisationResult, Normaliser, Progress};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "castnorm")]
#[command(about = "Normalise a WAV file to a loudness target", long_about = None)]
struct Cli {
    /// Input WAV file
    input: PathBuf,

    /// Output WAV file (replaced only when normalisation succeeds)
    output: PathBuf,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Target integrated loudness (LUFS)
    #[arg(short = 'i', long, allow_hyphen_values = true)]
    target_i: Option<f64>,

    /// True-peak ceiling (dBTP)
    #[arg(short = 't', long, allow_hyphen_values = true)]
    target_tp: Option<f64>,

    /// Loudness range target (LU)
    #[arg(long)]
    target_lra: Option<f64>,

    /// Accepted deviation from the target (LU)
    #[arg(long)]
    tolerance: Option<f64>,

    /// Disable the pre-limiter stage
    #[arg(long)]
    no_limiter: bool,

    /// Write 16-bit PCM instead of 32-bit float
    #[arg(long)]
    pcm16: bool,

    /// Print the result as JSON
    #[arg(long)]
    json: bool,
}

fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "castnorm=info,castnorm_loudness=info,castnorm_engine=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let mut source = WavSource::open(&cli.input)
        .with_context(|| format!("Failed to open {}", cli.input.display()))?;
    let encoding = if cli.pcm16 {
        WavEncoding::Pcm16
    } else {
        WavEncoding::Float32
    };
    let mut sink = WavSink::new(&cli.output, encoding);

    tracing::info!("Normalising {}", cli.input.display());
    let mut normaliser = Normaliser::new(NativeEngine::new(), config);
    let mut reporter = ProgressReporter::default();
    let result = normaliser
        .normalise_with_progress(&mut source, &mut sink, None, &mut |p| reporter.report(p))
        .with_context(|| format!("Failed to normalise {}", cli.input.display()))?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_summary(&cli, &result);
    }

    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<NormalisationConfig> {
    let mut config = NormalisationConfig::load(cli.config.as_deref())?;

    if let Some(target_i) = cli.target_i {
        config.target_i = target_i;
    }
    if let Some(target_tp) = cli.target_tp {
        config.target_tp = target_tp;
    }
    if let Some(target_lra) = cli.target_lra {
        config.target_lra = target_lra;
    }
    if let Some(tolerance) = cli.tolerance {
        config.tolerance_lu = tolerance;
    }
    if cli.no_limiter {
        config.limiter.enabled = false;
    }

    config.validate()?;
    Ok(config)
}

/// Logs each pass at 25% steps
#[derive(Default)]
struct ProgressReporter {
    pass: u8,
    next_step: u8,
}

impl ProgressReporter {
    fn report(&mut self, progress: &Progress<'_>) {
        if progress.pass != self.pass {
            self.pass = progress.pass;
            self.next_step = 1;
        }

        let step = (progress.fraction * 4.0).floor() as u8;
        if step >= self.next_step {
            self.next_step = step + 1;
            match progress.level_lufs {
                Some(level) if level.is_finite() => tracing::info!(
                    "{}: {:.0}% ({:.1} LUFS)",
                    progress.label,
                    progress.fraction * 100.0,
                    level
                ),
                _ => tracing::info!("{}: {:.0}%", progress.label, progress.fraction * 100.0),
            }
        }
    }
}

fn print_summary(cli: &Cli, result: &NormalisationResult) {
    if result.skipped {
        println!("Normalisation disabled; {} left untouched", cli.output.display());
        return;
    }

    println!(
        "Input:   {:>7.2} LUFS  {:>6.2} dBTP  {:>5.2} LU",
        result.input_i, result.input_tp, result.input_lra
    );
    println!(
        "Output:  {:>7.2} LUFS  {:>6.2} dBTP  {:>5.2} LU",
        result.output_i, result.output_tp, result.output_lra
    );
    println!(
        "Target:  {:>7.2} LUFS (requested {:.2}){}",
        result.effective_target_i,
        result.requested_target_i,
        if result.linear_mode_forced {
            ", lowered to stay linear"
        } else {
            ""
        }
    );
    if let Some(params) = &result.limiter_params {
        println!(
            "Limiter: ceiling {:.2} dBTP, attack {:.2} ms, release {:.0} ms{}",
            params.ceiling_dbtp,
            params.attack_ms,
            params.release_ms,
            if params.asc {
                format!(", ASC {:.2}", params.asc_level)
            } else {
                String::new()
            }
        );
    }
    println!(
        "Result:  {:.2} LU from target ({})",
        result.deviation_lu,
        if result.within_target {
            "within tolerance"
        } else {
            "outside tolerance"
        }
    );
    println!("Written: {}", cli.output.display());
}
