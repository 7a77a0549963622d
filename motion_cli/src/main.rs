use clap::{Parser, Subcommand};
use crossbeam_channel::Receiver;
use motion_core::csv_export::{self, LabelledExercise};
use motion_core::journal::{EventSink, JsonlJournal};
use motion_core::model::{DirectoryModelSource, ModelSource};
use motion_core::*;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "motion")]
#[command(about = "Wrist sensor recording and exercise recognition tools", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Override model directory
    #[arg(long, global = true)]
    model_dir: Option<PathBuf>,

    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the header of a recording
    Inspect {
        /// Recording in the binary sensor format
        file: PathBuf,
    },

    /// Export a recording as CSV
    Csv {
        file: PathBuf,

        /// JSON array of labelled exercises
        #[arg(long)]
        labels: Option<PathBuf>,

        /// Session start (epoch seconds) the recording is relative to
        #[arg(long, default_value_t = 0.0)]
        session_start: f64,

        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Classify a whole recording with one model
    Classify {
        file: PathBuf,

        /// Model id
        #[arg(long)]
        model: String,

        /// Candidates considered per window
        #[arg(long)]
        max_results: Option<usize>,
    },

    /// Send a recording through the live pipeline in chunks
    Replay {
        file: PathBuf,

        /// Model id
        #[arg(long)]
        model: String,

        /// Seconds of data per chunk
        #[arg(long, default_value_t = 5.0)]
        chunk_seconds: f64,

        /// Send every chunk twice
        #[arg(long)]
        duplicate: bool,

        /// Append events to a JSONL journal
        #[arg(long)]
        journal: Option<PathBuf>,
    },

    /// Generate a synthetic recording
    Synth {
        output: PathBuf,

        /// Channel type, repeatable (e.g. accelerometer@left-wrist, heart-rate)
        #[arg(long = "channel", required = true)]
        channels: Vec<ChannelType>,

        /// Samples per second
        #[arg(long, default_value_t = 50)]
        rate: u8,

        /// Number of rows
        #[arg(long)]
        rows: usize,

        /// Constant sample value
        #[arg(long, conflicts_with = "sine_period")]
        constant: Option<f32>,

        /// Sine wave with this period in rows
        #[arg(long)]
        sine_period: Option<usize>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    motion_core::logging::init_with_level(if cli.verbose { "debug" } else { "warn" });

    let config = Config::load()?;
    let model_dir = cli.model_dir.unwrap_or_else(|| config.models.dir.clone());

    match cli.command {
        Commands::Inspect { file } => cmd_inspect(&file),
        Commands::Csv {
            file,
            labels,
            session_start,
            output,
        } => cmd_csv(&file, labels.as_deref(), session_start, output.as_deref()),
        Commands::Classify {
            file,
            model,
            max_results,
        } => cmd_classify(&file, &model, max_results, &model_dir, &config),
        Commands::Replay {
            file,
            model,
            chunk_seconds,
            duplicate,
            journal,
        } => cmd_replay(
            &file,
            &model,
            chunk_seconds,
            duplicate,
            journal,
            &model_dir,
            &config,
        ),
        Commands::Synth {
            output,
            channels,
            rate,
            rows,
            constant,
            sine_period,
        } => {
            let value = match (constant, sine_period) {
                (_, Some(period)) => SampleValue::Sine { period },
                (Some(v), None) => SampleValue::Constant(v),
                (None, None) => SampleValue::Constant(0.0),
            };
            cmd_synth(&output, channels, rate, rows, value)
        }
    }
}

fn cmd_inspect(file: &Path) -> Result<()> {
    let series = codec::read_recording(file)?;
    let channels: Vec<String> = series.types().iter().map(ToString::to_string).collect();

    println!("Channels:  {}", channels.join(", "));
    println!("Dimension: {}", series.dimension());
    println!("Rate:      {} Hz", series.samples_per_second());
    println!("Start:     {:.3}s", series.start());
    println!("Rows:      {}", series.row_count());
    println!("Duration:  {:.3}s", series.duration());
    Ok(())
}

fn cmd_csv(
    file: &Path,
    labels: Option<&Path>,
    session_start: f64,
    output: Option<&Path>,
) -> Result<()> {
    let series = codec::read_recording(file)?;
    let labels: Vec<LabelledExercise> = match labels {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => Vec::new(),
    };

    match output {
        Some(path) => {
            let file = std::fs::File::create(path)?;
            csv_export::write_csv(io::BufWriter::new(file), &series, session_start, &labels)?;
            eprintln!("Wrote {} rows to {}", series.row_count(), path.display());
        }
        None => {
            let stdout = io::stdout();
            csv_export::write_csv(stdout.lock(), &series, session_start, &labels)?;
        }
    }
    Ok(())
}

fn cmd_classify(
    file: &Path,
    model_id: &str,
    max_results: Option<usize>,
    model_dir: &Path,
    config: &Config,
) -> Result<()> {
    let series = codec::read_recording(file)?;
    let source = DirectoryModelSource::new(model_dir);
    let classifier = Classifier::with_settings(
        source.exercise_model(model_id)?,
        config.classifier_settings(),
    )?;

    let events = classifier.classify(
        &series,
        max_results.unwrap_or(config.classifier.max_results),
    )?;

    if events.is_empty() {
        println!("No exercises recognised");
        return Ok(());
    }
    for event in &events {
        println!("{}", describe_exercise(event));
    }
    Ok(())
}

fn cmd_replay(
    file: &Path,
    model_id: &str,
    chunk_seconds: f64,
    duplicate: bool,
    journal: Option<PathBuf>,
    model_dir: &Path,
    config: &Config,
) -> Result<()> {
    let series = codec::read_recording(file)?;
    let transmitter = SessionTransmitter::new(model_id, 0.0).with_chunk_seconds(chunk_seconds);
    let chunks = transmitter.chunks(&series)?;
    tracing::debug!(
        "Replaying {:.1}s recording as {} chunks",
        series.duration(),
        chunks.len()
    );

    let source: Arc<dyn ModelSource> = Arc::new(DirectoryModelSource::new(model_dir));
    let (mut pipeline, events) = Pipeline::new(source, config.pipeline_settings())?;

    let journal = journal.map(JsonlJournal::new);
    let consumer = std::thread::Builder::new()
        .name("replay-consumer".into())
        .spawn(move || consume(events, journal))?;

    let copies = if duplicate { 2 } else { 1 };
    for chunk in &chunks {
        for _ in 0..copies {
            if let Err(e) = pipeline.submit(chunk.clone()) {
                eprintln!("Chunk rejected: {}", e);
            }
        }
    }
    pipeline.finish();

    let delivered = consumer
        .join()
        .map_err(|_| Error::Other("event consumer panicked".into()))??;
    eprintln!(
        "Replayed {} chunks of session {}, {} events",
        chunks.len(),
        transmitter.session_id(),
        delivered
    );
    Ok(())
}

/// Print (and optionally journal) events until the pipeline closes
fn consume(events: Receiver<PipelineEvent>, mut journal: Option<JsonlJournal>) -> Result<usize> {
    let stdout = io::stdout();
    let mut count = 0;
    for event in events {
        if let Some(journal) = journal.as_mut() {
            journal.record(&event)?;
        }
        let mut out = stdout.lock();
        writeln!(out, "{:<16} {}", event.kind(), describe_event(&event))?;
        count += 1;
    }
    Ok(count)
}

fn cmd_synth(
    output: &Path,
    channels: Vec<ChannelType>,
    rate: u8,
    rows: usize,
    value: SampleValue,
) -> Result<()> {
    let series = TimeSeries::generate(channels, rate, rows, value)?;
    codec::write_recording(output, &series)?;
    println!(
        "Wrote {} rows ({:.1}s) to {}",
        series.row_count(),
        series.duration(),
        output.display()
    );
    Ok(())
}

fn describe_exercise(event: &ExerciseEvent) -> String {
    format!(
        "{:>8.1}s {:>7.1}s  {} ({:.2})",
        event.offset, event.duration, event.label, event.confidence
    )
}

fn describe_event(event: &PipelineEvent) -> String {
    match event {
        PipelineEvent::SessionStarted { session } => {
            format!("model {} instance {}", session.model_id, session.instance)
        }
        PipelineEvent::DataReceived {
            accumulated,
            fragment,
            ..
        } => format!(
            "+{} rows, {:.1}s accumulated",
            fragment.row_count(),
            accumulated.duration()
        ),
        PipelineEvent::Classified { events, .. } if events.is_empty() => {
            "nothing recognised".into()
        }
        PipelineEvent::Classified { events, .. } => events
            .iter()
            .map(|e| describe_exercise(e).trim().to_string())
            .collect::<Vec<_>>()
            .join("; "),
        PipelineEvent::SessionEnded { series, .. } => format!(
            "{} rows total",
            series.as_ref().map_or(0, |s| s.row_count())
        ),
    }
}
