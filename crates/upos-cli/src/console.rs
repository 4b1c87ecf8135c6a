//! Listener that prints events to stdout.

use chrono::Local;
use upos_core::ErrorResponse;
use upos_runtime::{ErrorEvent, Event, EventListener, PropertyChange};

#[derive(Debug, Default)]
pub struct ConsoleListener {
    /// Also print property changes.
    pub properties: bool,
}

impl ConsoleListener {
    fn print(&self, source: &str, line: &str) {
        println!("{} {:<10} {}", Local::now().format("%H:%M:%S%.3f"), source, line);
    }
}

impl EventListener for ConsoleListener {
    fn on_event(&self, source: &str, event: &Event) {
        let line = match event {
            Event::Status(update) => format!("status {}", update.status),
            Event::Data(data) => {
                let values: Vec<_> = data
                    .values
                    .iter()
                    .map(|(name, value)| format!("{name}={value}"))
                    .collect();
                format!("data {} [{}]", data.status, values.join(", "))
            }
            Event::OutputComplete { output_id } => format!("output complete #{output_id}"),
            Event::DirectIo(io) => format!("direct io {} data={}", io.command, io.data),
            other => format!("{other:?}"),
        };
        self.print(source, &line);
    }

    fn on_error(&self, source: &str, event: &ErrorEvent) -> ErrorResponse {
        let response = event.locus.default_response();
        self.print(
            source,
            &format!(
                "error {} ({}) at {:?}: {} -> {:?}",
                event.code, event.extended, event.locus, event.message, response
            ),
        );
        response
    }

    fn on_property_changed(&self, source: &str, change: &PropertyChange) {
        if self.properties {
            self.print(source, &format!("{} = {}", change.name, change.value));
        }
    }
}
