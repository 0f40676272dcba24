// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{collections::HashMap, fs, path::Path, sync::Arc};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{Event, Subscriber, field::Field};
use tracing_appender::{
    non_blocking::{NonBlocking, WorkerGuard},
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{
    EnvFilter,
    fmt::{
        self, FmtContext, FormatEvent, FormatFields, FormattedFields,
        format::{FmtSpan, JsonFields, Writer},
    },
    layer::SubscriberExt,
    registry::LookupSpan,
};

#[derive(Debug, Deserialize, Clone)]
struct LoggerFile {
    logger: LogConfig,
}

#[derive(Debug, Deserialize, Clone)]
struct LogConfig {
    level: String,
    output: String,
    is_show_line: bool,
    is_show_module_path: bool,
    is_show_target: bool,
    /// Name of the controller, stamped on every record.
    #[serde(default)]
    adapter: Option<String>,
    file: Option<LogFileConfig>,
}

#[derive(Debug, Deserialize, Clone)]
struct LogFileConfig {
    path: String,
    rotation_frequency: Option<String>,
}

/// One JSON object per line: timestamp, level, optional location and the
/// event fields merged with the fields of every enclosing span.
struct JsonLineFormat {
    config: Arc<LogConfig>,
}

#[derive(Serialize)]
struct LogRecord<'a> {
    timestamp: String,
    level: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    adapter: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    target: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    module_path: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    line: Option<u32>,
    fields: Map<String, Value>,
}

impl<S, N> FormatEvent<S, N> for JsonLineFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let mut visitor = FieldCollector::default();
        event.record(&mut visitor);
        let mut fields = visitor.fields;

        if let Some(scope) = ctx.event_scope() {
            let mut spans = Vec::new();
            for span in scope.from_root() {
                spans.push(span.name().to_string());
                if let Some(ext) = span.extensions().get::<FormattedFields<JsonFields>>() {
                    let parsed: HashMap<String, Value> =
                        serde_json::from_str(&ext.fields).unwrap_or_default();
                    fields.extend(parsed);
                }
            }
            fields.insert("span_names".to_string(), json!(spans));
        }

        let meta = event.metadata();
        let cfg = &self.config;
        let record = LogRecord {
            timestamp: chrono::Utc::now().to_rfc3339(),
            level: meta.level().as_str(),
            adapter: cfg.adapter.as_deref(),
            target: cfg.is_show_target.then(|| meta.target()),
            module_path: cfg.is_show_module_path.then(|| meta.module_path()).flatten(),
            line: cfg.is_show_line.then(|| meta.line()).flatten(),
            fields,
        };
        writeln!(
            writer,
            "{}",
            serde_json::to_string(&record).map_err(|_| std::fmt::Error)?
        )
    }
}

#[derive(Default)]
struct FieldCollector {
    fields: Map<String, Value>,
}

impl tracing::field::Visit for FieldCollector {
    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(field.name().to_string(), json!(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.insert(field.name().to_string(), json!(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.insert(field.name().to_string(), json!(value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.fields.insert(field.name().to_string(), json!(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.fields
            .insert(field.name().to_string(), json!(format!("{value:?}")));
    }
}

fn split_path(path: &str) -> (String, String) {
    let p = Path::new(path);
    let dir = p
        .parent()
        .and_then(|d| d.to_str())
        .unwrap_or_default()
        .to_string();
    let file = p
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or_default()
        .to_string();
    (dir, file)
}

fn make_writer(cfg: &LogConfig) -> Result<(NonBlocking, WorkerGuard)> {
    Ok(match cfg.output.as_str() {
        "stdout" => tracing_appender::non_blocking(std::io::stdout()),
        "stderr" => tracing_appender::non_blocking(std::io::stderr()),
        "file" => {
            let file = cfg.file.as_ref().context("output is 'file' but no file section")?;
            let rotation = match file.rotation_frequency.as_deref() {
                Some("minutely") => Rotation::MINUTELY,
                Some("hourly") => Rotation::HOURLY,
                Some("daily") => Rotation::DAILY,
                _ => Rotation::NEVER,
            };
            let (dir, name) = split_path(&file.path);
            tracing_appender::non_blocking(RollingFileAppender::new(rotation, dir, name))
        },
        other => bail!("invalid log output {other:?}"),
    })
}

/// Installs the global JSON subscriber described by the YAML file at
/// `config_path`. Keep the returned guard alive to flush buffered records.
pub fn init_logger(config_path: &str) -> Result<WorkerGuard> {
    let text = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read logger config {config_path}"))?;
    let parsed: LoggerFile = serde_yaml::from_str(&text)
        .with_context(|| format!("failed to parse logger config {config_path}"))?;
    let cfg = Arc::new(parsed.logger);

    let (writer, guard) = make_writer(&cfg)?;

    let layer = fmt::layer()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .json()
        .event_format(JsonLineFormat {
            config: Arc::clone(&cfg),
        })
        .fmt_fields(JsonFields::default());

    let filter =
        EnvFilter::try_new(&cfg.level).context("failed to parse log level from config")?;

    let subscriber = tracing_subscriber::registry().with(filter).with(layer);
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set global default subscriber")?;

    Ok(guard)
}
