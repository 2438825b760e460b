// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log line format shared by binaries embedding the channel:
//!
//! ```text
//! DD_TELEMETRY | LEVEL | [span{fields}: ]message fields
//! ```

use std::fmt;
use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;

pub const LOG_PREFIX: &str = "DD_TELEMETRY";

/// Event formatter that tags every line with [`LOG_PREFIX`] so channel logs
/// can be told apart from the host application's.
///
/// Active spans are written root first, each with its fields in braces when
/// it has any:
///
/// ```text
/// DD_TELEMETRY | WARN | Telemetry intake unavailable, pausing transmissions for 10s
/// DD_TELEMETRY | DEBUG | transmitter{queued=3}: Moving 3 queued transmissions to the store
/// ```
///
/// Install it with `tracing_subscriber::fmt().event_format(Formatter)`.
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
        write!(&mut writer, "{} | {} | ", LOG_PREFIX, event.metadata().level())?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;
                let ext = span.extensions();
                // The fmt layer stores these on span creation.
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}
