//! Output formatting for CLI commands
//!
//! Every command reports through an [`OutputFormatter`], so `--json`
//! switches all of them to machine-readable output at once. Results go to
//! stdout and diagnostics to stderr.

use std::io::{self, Write};
use std::sync::Mutex;

/// Output format selector
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutputFormat {
    Human,
    Json,
}

impl OutputFormat {
    pub fn is_json(self) -> bool {
        matches!(self, OutputFormat::Json)
    }
}

/// Trait for formatting CLI output
pub trait OutputFormatter {
    fn success(&self, message: &str);
    fn error(&self, message: &str);
    fn info(&self, message: &str);
    /// Multi-line text printed as-is (summaries, daemon replies)
    fn block(&self, text: &str);
    fn print_json(&self, value: &serde_json::Value);
}

/// Destination pair shared by both formatters
struct Streams {
    out: Mutex<Box<dyn Write + Send>>,
    err: Mutex<Box<dyn Write + Send>>,
}

impl Streams {
    fn stdio() -> Self {
        Self {
            out: Mutex::new(Box::new(io::stdout())),
            err: Mutex::new(Box::new(io::stderr())),
        }
    }

    // Output errors (closed pipe) are not worth failing a command over.
    fn out(&self, text: &str) {
        if let Ok(mut w) = self.out.lock() {
            let _ = w.write_all(text.as_bytes());
            let _ = w.flush();
        }
    }

    fn err(&self, text: &str) {
        if let Ok(mut w) = self.err.lock() {
            let _ = w.write_all(text.as_bytes());
            let _ = w.flush();
        }
    }
}

/// Human-readable output with status markers
pub struct HumanFormatter {
    streams: Streams,
}

impl HumanFormatter {
    pub fn new() -> Self {
        Self {
            streams: Streams::stdio(),
        }
    }
}

impl OutputFormatter for HumanFormatter {
    fn success(&self, message: &str) {
        self.streams.out(&format!("\u{2713} {message}\n"));
    }
    fn error(&self, message: &str) {
        self.streams.err(&format!("\u{2717} Error: {message}\n"));
    }
    fn info(&self, message: &str) {
        self.streams.out(&format!("  {message}\n"));
    }
    fn block(&self, text: &str) {
        if text.ends_with('\n') {
            self.streams.out(text);
        } else {
            self.streams.out(&format!("{text}\n"));
        }
    }
    fn print_json(&self, _value: &serde_json::Value) {}
}

/// JSON output; only structured results and errors are printed
pub struct JsonFormatter {
    streams: Streams,
}

impl JsonFormatter {
    pub fn new() -> Self {
        Self {
            streams: Streams::stdio(),
        }
    }

    fn line(&self, value: serde_json::Value) {
        self.streams.out(&format!("{value}\n"));
    }
}

impl OutputFormatter for JsonFormatter {
    fn success(&self, message: &str) {
        self.line(serde_json::json!({"success": true, "message": message}));
    }
    fn error(&self, message: &str) {
        self.streams.err(&format!(
            "{}\n",
            serde_json::json!({"success": false, "error": message})
        ));
    }
    fn info(&self, _message: &str) {}
    fn block(&self, _text: &str) {}
    fn print_json(&self, value: &serde_json::Value) {
        let text = serde_json::to_string_pretty(value).unwrap_or_default();
        self.streams.out(&format!("{text}\n"));
    }
}

pub fn get_formatter(format: OutputFormat) -> Box<dyn OutputFormatter> {
    match format {
        OutputFormat::Json => Box::new(JsonFormatter::new()),
        OutputFormat::Human => Box::new(HumanFormatter::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Writer whose contents stay readable after being boxed
    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Capture {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    fn captured() -> (Streams, Capture, Capture) {
        let (out, err) = (Capture::default(), Capture::default());
        let streams = Streams {
            out: Mutex::new(Box::new(out.clone())),
            err: Mutex::new(Box::new(err.clone())),
        };
        (streams, out, err)
    }

    #[test]
    fn test_human_output() {
        let (streams, out, err) = captured();
        let formatter = HumanFormatter { streams };

        formatter.success("done");
        formatter.info("detail");
        formatter.block("Summary:\n    x\n");
        formatter.block("no newline");
        formatter.error("broken");
        formatter.print_json(&serde_json::json!({"ignored": true}));

        assert_eq!(
            out.text(),
            "\u{2713} done\n  detail\nSummary:\n    x\nno newline\n"
        );
        assert_eq!(err.text(), "\u{2717} Error: broken\n");
    }

    #[test]
    fn test_json_output() {
        let (streams, out, err) = captured();
        let formatter = JsonFormatter { streams };

        formatter.info("hidden");
        formatter.block("hidden");
        formatter.success("done");
        formatter.error("broken");

        let line: serde_json::Value = serde_json::from_str(out.text().trim()).unwrap();
        assert_eq!(line["success"], true);
        assert_eq!(line["message"], "done");
        let line: serde_json::Value = serde_json::from_str(err.text().trim()).unwrap();
        assert_eq!(line["error"], "broken");
    }
}
