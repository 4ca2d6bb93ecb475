use std::io::{self, Write};

use serde::Serialize;

use crate::task::{ProgressEvent, ProgressSink};

/// Final-result printer for the CLI: one pretty JSON document per command.
pub struct JsonOutput;

impl JsonOutput {
    pub fn print<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Progress printer writing one line per event to stderr, keeping stdout
/// reserved for the JSON result.
pub struct StderrProgress;

impl ProgressSink for StderrProgress {
    fn event(&self, event: ProgressEvent) {
        match (event.position, event.total) {
            (Some(position), Some(total)) => {
                eprintln!("[{position}/{total}] {}", event.message);
            }
            _ => eprintln!("{}", event.message),
        }
    }
}
