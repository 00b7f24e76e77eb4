//! Replay command - drive JSON-lines records through a sink task bound to the
//! in-process broker.

use crate::cli::args::{OutputFormat, ReplayArgs};
use crate::core::config::Config;
use crate::core::runtime::{shutdown_on_ctrl_c, Outcome, SinkTask};
use crate::delivery::message::{RecordLine, SinkRecord};
use crate::ops::telemetry;
use crate::session::MemoryBroker;
use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Serialize)]
struct BatchReport {
    batch: usize,
    records: usize,
    outcome: &'static str,
    attempts: u32,
    delivered: usize,
    ignored_nacks: usize,
    discarded_records: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Parse a JSON-lines file; blank lines and `#` comments are skipped.
pub fn read_records(path: &Path) -> Result<Vec<SinkRecord>> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("unable to read records {}", path.display()))?;
    let mut records = Vec::new();
    for (lineno, line) in data.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let parsed: RecordLine = serde_json::from_str(trimmed)
            .with_context(|| format!("{}:{}: invalid record", path.display(), lineno + 1))?;
        records.push(SinkRecord::from(parsed));
    }
    Ok(records)
}

pub async fn run_replay(args: ReplayArgs) -> Result<()> {
    if args.batch_size == 0 {
        bail!("--batch-size must be > 0");
    }
    let mut config = Config::load(&args.config)?;
    config.apply_env_overrides();
    let log_handle = telemetry::init_tracing(config.telemetry.log_level.as_deref())?;
    let records = read_records(&args.input)?;

    let broker = MemoryBroker::new();
    let mut task = SinkTask::new(config, Arc::new(broker.clone()))?;
    let bind = args
        .metrics_bind
        .clone()
        .or_else(|| task.config().telemetry.metrics_bind.clone());
    if let Some(bind) = bind {
        telemetry::start_http(&bind, task.telemetry_source(), Some(log_handle)).await?;
    }
    tokio::spawn(shutdown_on_ctrl_c(task.shutdown_handle()));
    task.start().await?;

    let mut records = records;
    if let Some(offset) = task.take_start_offset() {
        records.retain(|r| r.offset >= offset);
    }

    for (index, batch) in records.chunks(args.batch_size).enumerate() {
        let mut redeliveries = 0;
        loop {
            let outcome = task.submit_batch(batch.to_vec()).await;
            print_report(&args, index, batch.len(), &outcome)?;
            match outcome {
                Outcome::Committed(_) => break,
                Outcome::Retry(err) => {
                    if redeliveries >= args.max_redeliveries || task.shutdown_handle().is_triggered()
                    {
                        task.close().await;
                        bail!("batch {} not committed: {}", index, err);
                    }
                    redeliveries += 1;
                }
                Outcome::Fatal(err) => {
                    task.close().await;
                    bail!("sink task failed: {}", err);
                }
            }
        }
    }

    let mut offsets: Vec<(String, i32, i64)> = task
        .committed_offsets()
        .iter()
        .map(|((topic, partition), offset)| (topic.clone(), *partition, *offset))
        .collect();
    offsets.sort();
    let summary = serde_json::json!({
        "delivered": broker.delivered().len(),
        "commits": broker.commits(),
        "offsets": offsets,
        "metrics": task.metrics().snapshot(),
    });
    println!("{}", serde_json::to_string(&summary)?);
    task.close().await;
    Ok(())
}

fn print_report(args: &ReplayArgs, batch: usize, records: usize, outcome: &Outcome) -> Result<()> {
    let report = match outcome {
        Outcome::Committed(cycle) => BatchReport {
            batch,
            records,
            outcome: outcome.as_str(),
            attempts: cycle.attempts,
            delivered: cycle.delivered,
            ignored_nacks: cycle.ignored_nacks,
            discarded_records: cycle.discarded_records,
            error: None,
        },
        Outcome::Retry(err) | Outcome::Fatal(err) => BatchReport {
            batch,
            records,
            outcome: outcome.as_str(),
            attempts: 0,
            delivered: 0,
            ignored_nacks: 0,
            discarded_records: 0,
            error: Some(err.to_string()),
        },
    };
    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string(&report)?),
        OutputFormat::Text => match &report.error {
            None => println!(
                "batch {}: {} ({} records, {} delivered, {} attempts)",
                batch, report.outcome, records, report.delivered, report.attempts
            ),
            Some(error) => println!("batch {}: {} ({})", batch, report.outcome, error),
        },
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn records_parse_skipping_comments() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# orders").unwrap();
        writeln!(file, r#"{{"topic": "orders", "partition": 1, "offset": 10, "value": "a"}}"#).unwrap();
        writeln!(file).unwrap();
        writeln!(file, r#"{{"offset": 11, "key": "k", "value": "b"}}"#).unwrap();
        let records = read_records(file.path()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].partition, 1);
        assert_eq!(records[1].topic, "replay");
        assert_eq!(records[1].key.as_deref(), Some(&b"k"[..]));
    }

    #[test]
    fn malformed_lines_name_their_position() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"offset": 1}}"#).unwrap();
        writeln!(file, "not json").unwrap();
        let err = read_records(file.path()).unwrap_err();
        assert!(format!("{err:#}").contains(":2: invalid record"));
    }
}
