use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;

use parallel_copy::config::{PipelineConfig, ScanOptions, UnterminatedQuotePolicy, single_byte};
use parallel_copy::input::open_input;
use parallel_copy::writer::connection::DEFAULT_CONNECTION;
use parallel_copy::writer::{CopyTarget, PgWriterSource, parse_column_list, parse_connection};
use parallel_copy::{ConfigError, CopyPipeline, FailurePolicy, LoadSummary, init_logger};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SummaryFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(
    name = "parallel-copy",
    about = "Load delimited text into PostgreSQL with parallel COPY workers"
)]
struct Args {
    /// Connection string (URL or key=value pairs). Falls back to DATABASE_URL.
    #[arg(long)]
    connection: Option<String>,

    /// Database to connect to, overriding the connection string.
    #[arg(long)]
    db_name: Option<String>,

    #[arg(long, default_value = "public")]
    schema: String,

    #[arg(long, default_value = "test_table")]
    table: String,

    /// Comma separated columns to copy into; all columns when empty.
    #[arg(long, default_value = "")]
    columns: String,

    /// Options appended to the COPY statement.
    #[arg(long, default_value = "CSV")]
    copy_options: String,

    /// Field delimiter.
    #[arg(long, default_value = ",")]
    split: String,

    /// Quote character.
    #[arg(long)]
    quote: Option<String>,

    /// Escape character inside quoted fields; defaults to the quote.
    #[arg(long)]
    escape: Option<String>,

    /// Skip the leading header line(s).
    #[arg(long)]
    skip_header: bool,

    /// Number of header lines skipped with --skip-header.
    #[arg(long, default_value_t = 1)]
    header_line_count: usize,

    /// Rows per COPY statement.
    #[arg(long, default_value_t = 5000)]
    batch_size: usize,

    /// Parallel COPY workers.
    #[arg(long, default_value_t = 1)]
    workers: usize,

    /// Batches allowed to wait for a worker; defaults to the worker count.
    #[arg(long)]
    queue_capacity: Option<usize>,

    /// Stop after this many rows; 0 reads everything.
    #[arg(long, default_value_t = 0)]
    limit: u64,

    /// Progress interval, e.g. `30s` or `500ms`; 0 disables periodic reports.
    #[arg(long, default_value = "0", value_parser = parse_period)]
    reporting_period: Duration,

    /// Truncate the table before loading.
    #[arg(long)]
    truncate: bool,

    /// `continue` past failed batches or `abort` on the first one.
    #[arg(long, default_value = "continue")]
    on_error: FailurePolicy,

    /// Fail when input ends inside a quoted field.
    #[arg(long)]
    strict_quotes: bool,

    /// Log timing for every batch.
    #[arg(long)]
    log_batches: bool,

    #[arg(long, short)]
    verbose: bool,

    /// Input file; standard input when omitted.
    #[arg(long)]
    file: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = SummaryFormat::Text)]
    summary_format: SummaryFormat,
}

impl Args {
    fn pipeline_config(&self) -> Result<PipelineConfig, ConfigError> {
        let delimiter = single_byte("split", &self.split)?;
        let quote = self
            .quote
            .as_deref()
            .map(|value| single_byte("quote", value))
            .transpose()?;
        let escape = self
            .escape
            .as_deref()
            .map(|value| single_byte("escape", value))
            .transpose()?;

        let scan_quote = quote.unwrap_or(b'"');
        let scan = ScanOptions {
            quote: scan_quote,
            escape: escape.unwrap_or(scan_quote),
            skip_header: self.skip_header,
            header_line_count: self.header_line_count,
            unterminated_quote: if self.strict_quotes {
                UnterminatedQuotePolicy::Fail
            } else {
                UnterminatedQuotePolicy::Flush
            },
            ..ScanOptions::default()
        };

        let mut target = CopyTarget::new(self.schema.trim(), self.table.trim());
        target.columns = parse_column_list(&self.columns);
        target.format.delimiter = delimiter;
        target.format.options = self.copy_options.clone();
        target.format.quote = quote;
        target.format.escape = escape;

        let config = PipelineConfig {
            scan,
            target,
            batch_size: self.batch_size,
            workers: self.workers,
            queue_capacity: self.queue_capacity.unwrap_or(self.workers),
            report_period: self.reporting_period,
            failure_policy: self.on_error,
            row_limit: (self.limit > 0).then_some(self.limit),
            log_batches: self.log_batches,
        };
        config.validate()?;
        Ok(config)
    }

    fn connection(&self) -> String {
        self.connection
            .clone()
            .or_else(|| std::env::var("DATABASE_URL").ok())
            .unwrap_or_else(|| DEFAULT_CONNECTION.to_string())
    }
}

/// Parse `500ms`, `30s`, `2m`, `1h` or a bare number of seconds.
fn parse_period(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: f64 = number
        .parse()
        .map_err(|_| format!("invalid duration {value:?}"))?;

    let secs = match unit {
        "" | "s" => number,
        "ms" => number / 1000.0,
        "m" => number * 60.0,
        "h" => number * 3600.0,
        other => return Err(format!("unknown duration unit {other:?}")),
    };
    if !secs.is_finite() || secs < 0.0 {
        return Err(format!("invalid duration {value:?}"));
    }
    Ok(Duration::from_secs_f64(secs))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logger(args.verbose);

    let config = args.pipeline_config()?;
    let options = parse_connection(&args.connection(), args.db_name.as_deref())?;
    let source = PgWriterSource::new(options).with_truncate(args.truncate);
    let reader = open_input(args.file.as_deref()).await?;

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("interrupt received, stopping load");
            interrupt.cancel();
        }
    });

    let workers = config.workers;
    let result = CopyPipeline::new(config, source)
        .with_cancellation(cancel)
        .run(reader)
        .await;

    let summary = LoadSummary::from_result(&result, workers);
    match args.summary_format {
        SummaryFormat::Text => println!("{}", summary.render_text()),
        SummaryFormat::Json => println!("{}", summary.render_json()?),
    }

    if !summary.is_success() {
        std::process::exit(1);
    }
    Ok(())
}
