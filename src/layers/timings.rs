// SPDX-License-Identifier: BSD-3-Clause
use std::fmt::Debug;
use std::time::{Duration, SystemTime};

use tracing::field::{Field, Visit};
use tracing::span::Attributes;
use tracing::{Id, Subscriber};
use tracing_subscriber::{layer::Context, registry::LookupSpan, Layer};

/// Label of a span: its name and its `id` field, if any
struct Label(String);

impl Visit for Label {
    fn record_debug(&mut self, field: &Field, value: &dyn Debug) {
        if field.name() == "id" {
            self.0 = format!("{} {:?}", self.0, value);
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "id" {
            self.0 = format!("{} {}", self.0, value);
        }
    }
}

/// Prints the wall-clock time spent in each span when it exits
#[derive(Debug, Default)]
pub struct TimingLayer;

impl<S> Layer<S> for TimingLayer
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        if let Some(span) = ctx.span(id) {
            let mut label = Label(span.name().to_string());
            attrs.record(&mut label);
            span.extensions_mut().insert(label);
        }
    }

    fn on_enter(&self, id: &Id, ctx: Context<'_, S>) {
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(SystemTime::now());
        }
    }

    fn on_exit(&self, id: &Id, ctx: Context<'_, S>) {
        if let Some(span) = ctx.span(id) {
            let ext = span.extensions();
            if let (Some(time), Some(label)) = (ext.get::<SystemTime>(), ext.get::<Label>()) {
                let elapsed = time.elapsed().unwrap_or(Duration::ZERO);
                eprintln!("{}: {:.3}s", label.0, elapsed.as_secs_f64());
            }
        }
    }
}
