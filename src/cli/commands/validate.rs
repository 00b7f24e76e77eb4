//! Validate command - load, check and summarize a configuration.

use crate::cli::args::{OutputFormat, ValidateArgs};
use crate::core::config::Config;
use crate::delivery::coordinator::Discipline;
use anyhow::Result;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ConfigSummary {
    pub hosts: Vec<String>,
    pub vpn_name: String,
    pub destinations: Vec<DestinationSummary>,
    pub processor: String,
    pub window_size: usize,
    pub autoflush_size: usize,
    pub ack_event_mode: String,
    pub connect_attempts_per_pass: u32,
    pub connect_passes: u32,
    pub reconnect_passes: u32,
    pub replay_offset: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct DestinationSummary {
    pub destination: String,
    pub discipline: String,
}

pub fn summarize(config: &Config) -> ConfigSummary {
    let destinations = config
        .destinations
        .resolve()
        .into_iter()
        .map(|dest| DestinationSummary {
            discipline: Discipline::for_destination(&config.publisher, &dest)
                .as_str()
                .to_string(),
            destination: dest.to_string(),
        })
        .collect();
    ConfigSummary {
        hosts: config.hosts(),
        vpn_name: config.session.vpn_name.clone(),
        destinations,
        processor: config.record.processor.as_str().to_string(),
        window_size: config.publisher.window_size,
        autoflush_size: config.publisher.autoflush_size,
        ack_event_mode: config.publisher.ack_event_mode.as_str().to_string(),
        connect_attempts_per_pass: config.hosts().len() as u32
            * (1 + config.session.connect_retries_per_host),
        connect_passes: 1 + config.session.connect_retries,
        reconnect_passes: 1 + config.session.reconnect_retries,
        replay_offset: config.source.replay_offset,
    }
}

pub fn run_validate(args: ValidateArgs) -> Result<()> {
    let config = Config::load(&args.config)?;
    config.validate()?;
    let summary = summarize(&config);
    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
        OutputFormat::Text => {
            println!("config {} is valid", args.config.display());
            println!("  hosts: {}", summary.hosts.join(", "));
            println!("  vpn: {}", summary.vpn_name);
            for dest in &summary.destinations {
                println!("  destination {} ({})", dest.destination, dest.discipline);
            }
            println!("  processor: {}", summary.processor);
            println!(
                "  publisher: window {} / autoflush {} / acks {}",
                summary.window_size, summary.autoflush_size, summary.ack_event_mode
            );
            println!(
                "  connect: {} passes of {} attempts, reconnect: {} passes",
                summary.connect_passes, summary.connect_attempts_per_pass, summary.reconnect_passes
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_lists_disciplines() {
        let cfg = Config::parse(
            r#"
[session]
hosts = ["a", "b"]
connect_retries = 1
connect_retries_per_host = 2

[destinations]
topics = ["t1"]
queue = "q1"
"#,
            false,
        )
        .unwrap();
        let summary = summarize(&cfg);
        assert_eq!(summary.destinations.len(), 2);
        assert_eq!(summary.destinations[0].destination, "topic:t1");
        assert_eq!(summary.destinations[0].discipline, "direct");
        assert_eq!(summary.destinations[1].discipline, "transacted");
        assert_eq!(summary.connect_passes, 2);
        assert_eq!(summary.connect_attempts_per_pass, 6);
        assert_eq!(summary.ack_event_mode, "windowed");
    }
}
