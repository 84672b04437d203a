//! Console log format.
//!
//! Every line carries its origin: a hub crate, an explicit `component`, or a
//! mesh node for log lines forwarded by the coordinator. Fields other than
//! the message are appended as `key=value`.

use std::fmt::{self, Write as _};
use std::io::IsTerminal;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

const RESET: &str = "\x1b[0m";
const DIM: &str = "\x1b[2m";
const MAGENTA: &str = "\x1b[35m";

/// Width of the origin column
const ORIGIN_WIDTH: usize = 14;

/// Label and color of one level
struct LevelStyle {
    label: &'static str,
    color: &'static str,
}

static LEVEL_STYLES: [(Level, LevelStyle); 5] = [
    (Level::ERROR, LevelStyle { label: "ERROR", color: "\x1b[1;31m" }),
    (Level::WARN, LevelStyle { label: "WARN", color: "\x1b[33m" }),
    (Level::INFO, LevelStyle { label: "INFO", color: "\x1b[32m" }),
    (Level::DEBUG, LevelStyle { label: "DEBUG", color: "\x1b[34m" }),
    (Level::TRACE, LevelStyle { label: "TRACE", color: "\x1b[90m" }),
];

fn level_style(level: &Level) -> &'static LevelStyle {
    LEVEL_STYLES
        .iter()
        .find(|(l, _)| l == level)
        .map(|(_, style)| style)
        .unwrap_or(&LEVEL_STYLES[2].1)
}

/// Log with an explicit origin instead of the calling crate
#[macro_export]
macro_rules! component_info {
    ($component:expr, $($arg:tt)*) => {
        tracing::info!(component = $component, $($arg)*)
    };
}

#[macro_export]
macro_rules! component_warn {
    ($component:expr, $($arg:tt)*) => {
        tracing::warn!(component = $component, $($arg)*)
    };
}

#[macro_export]
macro_rules! component_debug {
    ($component:expr, $($arg:tt)*) => {
        tracing::debug!(component = $component, $($arg)*)
    };
}

#[macro_export]
macro_rules! component_error {
    ($component:expr, $($arg:tt)*) => {
        tracing::error!(component = $component, $($arg)*)
    };
}

/// Line formatter: `time origin level message key=value...`
pub struct HubLogFormatter {
    binary: &'static str,
    color: bool,
}

impl HubLogFormatter {
    pub fn new(binary: &'static str) -> Self {
        Self {
            binary,
            color: color_supported(),
        }
    }

    /// Origin of an event: forwarding node, explicit component, or hub crate
    fn origin(&self, fields: &EventFields, target: &str) -> String {
        if let Some(node) = &fields.node {
            return format!("node {}", node);
        }
        if let Some(component) = &fields.component {
            return component.clone();
        }
        target
            .split("::")
            .next()
            .and_then(|krate| krate.strip_prefix("hub_"))
            .unwrap_or(self.binary)
            .to_string()
    }

    fn paint<'a>(&self, code: &'a str) -> &'a str {
        if self.color {
            code
        } else {
            ""
        }
    }

    fn render(&self, level: &Level, target: &str, fields: &EventFields) -> String {
        let style = level_style(level);
        let origin = self.origin(fields, target);
        let origin_color = if fields.node.is_some() { MAGENTA } else { "" };

        let mut line = format!(
            "{}{}{} {}{:<width$}{} {}{:<5}{} {}",
            self.paint(DIM),
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
            self.paint(RESET),
            self.paint(origin_color),
            origin,
            self.paint(if origin_color.is_empty() { "" } else { RESET }),
            self.paint(style.color),
            style.label,
            self.paint(RESET),
            fields.message,
            width = ORIGIN_WIDTH,
        );
        for (key, value) in &fields.extra {
            let _ = write!(line, " {}{}={}{}", self.paint(DIM), key, value, self.paint(RESET));
        }
        line
    }
}

impl<S, N> FormatEvent<S, N> for HubLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut fields = EventFields::default();
        event.record(&mut fields);
        let metadata = event.metadata();
        writeln!(
            writer,
            "{}",
            self.render(metadata.level(), metadata.target(), &fields)
        )
    }
}

/// Fields of one event, split by meaning
#[derive(Default)]
struct EventFields {
    message: String,
    component: Option<String>,
    node: Option<String>,
    extra: Vec<(&'static str, String)>,
}

impl EventFields {
    fn record(&mut self, name: &'static str, value: String) {
        match name {
            "message" => self.message = value,
            "component" => self.component = Some(value),
            "node" => self.node = Some(value),
            _ => self.extra.push((name, value)),
        }
    }
}

impl tracing::field::Visit for EventFields {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        self.record(field.name(), format!("{:?}", value));
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.record(field.name(), value.to_string());
    }
}

fn color_supported() -> bool {
    std::env::var_os("NO_COLOR").is_none()
        && std::env::var("TERM").map_or(true, |t| t != "dumb")
        && std::io::stdout().is_terminal()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain() -> HubLogFormatter {
        HubLogFormatter {
            binary: "meshhub",
            color: false,
        }
    }

    fn fields(pairs: &[(&'static str, &str)]) -> EventFields {
        let mut fields = EventFields::default();
        for (name, value) in pairs {
            fields.record(*name, value.to_string());
        }
        fields
    }

    #[test]
    fn test_origin_from_crate_component_and_node() {
        let formatter = plain();
        let empty = EventFields::default();
        assert_eq!(formatter.origin(&empty, "hub_circuit::worker"), "circuit");
        assert_eq!(formatter.origin(&empty, "meshhub"), "meshhub");

        let component = fields(&[("component", "storage")]);
        assert_eq!(formatter.origin(&component, "meshhub"), "storage");

        let forwarded = fields(&[("component", "node"), ("node", "N0A0B0C")]);
        assert_eq!(
            formatter.origin(&forwarded, "hub_session::manager"),
            "node N0A0B0C"
        );
    }

    #[test]
    fn test_render_without_color() {
        let formatter = plain();
        let forwarded = fields(&[
            ("message", "boot complete"),
            ("node", "N0A0B0C"),
            ("handle", "7"),
        ]);
        let line = formatter.render(&Level::WARN, "hub_session::manager", &forwarded);

        assert!(!line.contains('\x1b'));
        let (_, rest) = line.split_once(' ').unwrap();
        assert_eq!(rest, "node N0A0B0C   WARN  boot complete handle=7");
    }

    #[test]
    fn test_level_styles() {
        assert_eq!(level_style(&Level::ERROR).label, "ERROR");
        assert_eq!(level_style(&Level::TRACE).label, "TRACE");
        assert_ne!(
            level_style(&Level::WARN).color,
            level_style(&Level::INFO).color
        );
    }
}
