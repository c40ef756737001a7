// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log line formatting.
//!
//! Every line is prefixed with `DD_DATA_STREAMS` so it can be told apart from application output:
//!
//! ```text
//! DD_DATA_STREAMS | LEVEL | [span{fields}:] message fields
//! DD_DATA_STREAMS | INFO | Agent upgrade detected. Enabling data streams because it is now supported
//! ```

use std::fmt;

use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy)]
pub struct Formatter;

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        write!(&mut writer, "DD_DATA_STREAMS | {} | ", metadata.level())?;

        write_scope(ctx, &mut writer)?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Writes `outer: inner{field=value}: ` for the spans enclosing the current event. Spans
/// recorded without fields carry no braces.
fn write_scope<S, N>(ctx: &FmtContext<'_, S, N>, writer: &mut format::Writer<'_>) -> fmt::Result
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    let Some(scope) = ctx.event_scope() else {
        return Ok(());
    };
    for span in scope.from_root() {
        let ext = span.extensions();
        match ext.get::<FormattedFields<N>>() {
            Some(fields) if !fields.is_empty() => write!(writer, "{}{{{fields}}}: ", span.name())?,
            _ => write!(writer, "{}: ", span.name())?,
        }
    }
    Ok(())
}

/// Builds the filter used by [`init`]: HTTP stack internals are silenced, everything else logs at
/// `level`.
///
/// # Errors
///
/// `level` is not a valid filter directive.
pub fn env_filter(level: &str) -> Result<EnvFilter, tracing_subscriber::filter::ParseError> {
    EnvFilter::try_new(format!("h2=off,hyper=off,rustls=off,{level}"))
}

/// Installs the global subscriber.
///
/// # Errors
///
/// `level` cannot be parsed or a global subscriber is already set.
pub fn init(level: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(env_filter(level)?)
        .event_format(Formatter)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
