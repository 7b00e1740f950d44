use std::fs;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{fmt::format, prelude::__tracing_subscriber_field_MakeExt, EnvFilter};

use crate::domain::queue::QueueDefinition;

#[derive(Debug, Parser)]
pub struct Config {
    #[clap(required = true, env)]
    pub database_url: String,
    #[clap(default_value = "", env)]
    pub env: String,
    #[clap(default_value = "nats://localhost:4222", env)]
    pub nats_url: String,
    #[clap(long, default_value = "queues.json", env)]
    pub queues_file: String,
    #[clap(long, default_value = "30", env)]
    pub save_interval_secs: u64,
    #[clap(long, default_value = "1800", env)]
    pub calendar_refresh_secs: u64,
    #[clap(long, default_value = "2.0", env)]
    pub urgency_weight: f64,
    #[clap(long, default_value = "auth.verify", env)]
    pub identity_subject: String,
    #[clap(long, default_value = "calendar.busy_windows", env)]
    pub calendar_subject: String,
}

pub fn configure_tracing() {
    let formatter =
        format::debug_fn(|writer, field, value| write!(writer, "{}={:?}", field, value))
            .delimited(" ");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .fmt_fields(formatter)
        .init();
}

pub fn load_queues(path: &str) -> Result<Vec<QueueDefinition>> {
    let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path))?;

    parse_queues(&raw).with_context(|| format!("parsing {}", path))
}

fn parse_queues(raw: &str) -> Result<Vec<QueueDefinition>> {
    let queues: Vec<QueueDefinition> = serde_json::from_str(raw)?;

    let mut seen = std::collections::HashSet::new();
    for queue in &queues {
        if !seen.insert(queue.id.as_str()) {
            anyhow::bail!("duplicate queue id {}", queue.id);
        }
    }

    Ok(queues)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_queue_definitions() {
        let queues = parse_queues(
            r#"[
                {"id": "bbb", "name": "BBB", "calendar": {"include": ["BBB"]}, "staff": ["ta1"]},
                {"id": "qqq", "name": "QQQ"}
            ]"#,
        )
        .unwrap();

        assert_eq!(queues.len(), 2);
        assert_eq!(queues[0].calendar.include, vec!["BBB"]);
        assert!(queues[0].calendar.exclude.is_empty());
        assert!(queues[1].staff.is_empty());
    }

    #[test]
    fn rejects_duplicate_queue_ids() {
        let result = parse_queues(r#"[{"id": "bbb", "name": "A"}, {"id": "bbb", "name": "B"}]"#);

        assert!(result.is_err());
    }
}
