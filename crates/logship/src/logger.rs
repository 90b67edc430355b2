// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Single-line event format for the agent's diagnostics.
//!
//! Lines are tagged so they can be picked out of a stream that also carries
//! shipped records or the host application's own output:
//!
//! ```text
//! LOGSHIP | INFO | Sender started: shipping to https://example.com every 5s from durable queue
//! LOGSHIP | WARN | drain{records=3}: Failed to deliver batch of 18 bytes: connection refused
//! ```
//!
//! Nested spans are printed root first, each followed by `: `.

use std::fmt;
use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;

pub const DEFAULT_PREFIX: &str = "LOGSHIP";

/// Event formatter producing `PREFIX | LEVEL | span{fields}: message` lines.
#[derive(Debug, Clone, Copy)]
pub struct Formatter {
    prefix: &'static str,
}

impl Formatter {
    #[must_use]
    pub const fn with_prefix(prefix: &'static str) -> Self {
        Formatter { prefix }
    }
}

impl Default for Formatter {
    fn default() -> Self {
        Self::with_prefix(DEFAULT_PREFIX)
    }
}

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
        write!(writer, "{} | {} | ", self.prefix, event.metadata().level())?;

        for span in ctx.event_scope().into_iter().flat_map(|scope| scope.from_root()) {
            let ext = span.extensions();
            match ext.get::<FormattedFields<N>>() {
                Some(fields) if !fields.is_empty() => {
                    write!(writer, "{}{{{fields}}}: ", span.name())?;
                }
                _ => write!(writer, "{}: ", span.name())?,
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_prefixes_level_and_spans() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .event_format(Formatter::default())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("drain", records = 3);
            let _entered = span.enter();
            tracing::warn!("batch requeued");
        });

        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert_eq!(output, "LOGSHIP | WARN | drain{records=3}: batch requeued\n");
    }

    #[test]
    fn test_custom_prefix_and_nested_spans() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .event_format(Formatter::with_prefix("AGENT"))
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let outer = tracing::info_span!("sender");
            let _outer = outer.enter();
            let inner = tracing::info_span!("drain", bytes = 18);
            let _inner = inner.enter();
            tracing::error!(status = 401, "batch rejected");
        });

        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert_eq!(
            output,
            "AGENT | ERROR | sender: drain{bytes=18}: batch rejected status=401\n"
        );
    }
}
