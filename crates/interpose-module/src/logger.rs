//! Traffic logging: a console dump per unit and an optional JSON Lines file.
//!
//! Console records look like
//!
//! ```text
//! > [pair 3] 1718000000.123456 5 bytes
//! > 00000000  68 65 6c 6c 6f                                    |hello|
//! ```
//!
//! with `>` for A→B and `<` for B→A, each direction in its own ANSI color.
//! JSON records are one object per line:
//! `{"pair":3,"one":true,"ts":1718000000.123456,"len":5,"data":"68656c6c6f"}`
//! where `one` is true for A→B. Every pair of a run writes to the same file,
//! opened once when the factory is built.

use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::warn;

use crate::corrupt::DirectionFilter;
use crate::error::ModuleError;
use crate::module::{Direction, Module, ModuleFactory, PairInfo};

/// A writer shared by every module instance a factory creates.
pub type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggerOptions {
    #[serde(default = "default_true")]
    pub request: bool,
    #[serde(default = "default_true")]
    pub response: bool,
    /// Hex dump instead of escaped text.
    #[serde(default = "default_true")]
    pub hex: bool,
    #[serde(default = "default_true")]
    pub color: bool,
    #[serde(default = "default_color_request")]
    pub color_request: u8,
    #[serde(default = "default_color_response")]
    pub color_response: u8,
    #[serde(default = "default_width")]
    pub width: usize,
    /// JSON Lines output file.
    #[serde(default)]
    pub json: Option<PathBuf>,
    /// Suppress console output.
    #[serde(default)]
    pub quiet: bool,
}

fn default_true() -> bool {
    true
}

fn default_color_request() -> u8 {
    31
}

fn default_color_response() -> u8 {
    32
}

fn default_width() -> usize {
    interpose_core::DEFAULT_HEXDUMP_WIDTH
}

impl Default for LoggerOptions {
    fn default() -> Self {
        Self {
            request: true,
            response: true,
            hex: true,
            color: true,
            color_request: default_color_request(),
            color_response: default_color_response(),
            width: default_width(),
            json: None,
            quiet: false,
        }
    }
}

impl LoggerOptions {
    fn filter(&self) -> Option<DirectionFilter> {
        match (self.request, self.response) {
            (true, true) => Some(DirectionFilter::Both),
            (true, false) => Some(DirectionFilter::Request),
            (false, true) => Some(DirectionFilter::Response),
            (false, false) => None,
        }
    }
}

#[derive(Clone)]
pub struct LoggerFactory {
    options: Arc<LoggerOptions>,
    console: Option<SharedWriter>,
    json: Option<SharedWriter>,
}

impl std::fmt::Debug for LoggerFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoggerFactory")
            .field("options", &self.options)
            .field("console", &self.console.is_some())
            .field("json", &self.json.is_some())
            .finish()
    }
}

impl LoggerFactory {
    /// Console output goes to stdout unless `quiet` is set.
    pub fn new(options: LoggerOptions) -> Result<Self, ModuleError> {
        if options.width == 0 {
            return Err(ModuleError::Invalid("logger width must be positive".into()));
        }
        let console = if options.quiet {
            None
        } else {
            let stdout: Box<dyn Write + Send> = Box::new(io::stdout());
            Some(Arc::new(Mutex::new(stdout)))
        };
        let json = match &options.json {
            Some(path) => Some(open_json(path)?),
            None => None,
        };
        Ok(Self {
            options: Arc::new(options),
            console,
            json,
        })
    }

    /// Replace the console writer.
    pub fn with_console(mut self, writer: SharedWriter) -> Self {
        self.console = Some(writer);
        self
    }

    pub(crate) fn logger(&self, pair: &PairInfo) -> Logger {
        Logger {
            pair: pair.id,
            filter: self.options.filter(),
            options: self.options.clone(),
            console: self.console.clone(),
            json: self.json.clone(),
        }
    }
}

fn open_json(path: &Path) -> Result<SharedWriter, ModuleError> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .map_err(|source| ModuleError::Output {
            path: path.to_path_buf(),
            source,
        })?;
    let writer: Box<dyn Write + Send> = Box::new(BufWriter::<File>::new(file));
    Ok(Arc::new(Mutex::new(writer)))
}

impl ModuleFactory for LoggerFactory {
    fn name(&self) -> &'static str {
        "logger"
    }

    fn create(&self, pair: &PairInfo) -> Result<Box<dyn Module>, ModuleError> {
        Ok(Box::new(self.logger(pair)))
    }
}

pub struct Logger {
    pair: u64,
    filter: Option<DirectionFilter>,
    options: Arc<LoggerOptions>,
    console: Option<SharedWriter>,
    json: Option<SharedWriter>,
}

impl Logger {
    fn console_record(&self, data: &[u8], direction: Direction, ts: f64) -> String {
        let marker = direction.marker();
        let mut out = format!("{marker} [pair {}] {ts:.6} {} bytes\n", self.pair, data.len());
        if self.options.hex {
            out.push_str(&hexdump(data, self.options.width, marker));
        } else {
            let _ = writeln!(out, "{marker} {}", data.escape_ascii());
        }
        if !self.options.color {
            return out;
        }
        let code = match direction {
            Direction::AToB => self.options.color_request,
            Direction::BToA => self.options.color_response,
        };
        format!("\x1b[{code}m{out}\x1b[0m")
    }

    fn json_record(&self, data: &[u8], direction: Direction, ts: f64) -> String {
        serde_json::json!({
            "pair": self.pair,
            "one": direction.is_a_to_b(),
            "ts": ts,
            "len": data.len(),
            "data": hex::encode(data),
        })
        .to_string()
    }
}

impl Module for Logger {
    fn handle(&mut self, data: Bytes, direction: Direction) -> Option<Bytes> {
        if !self.filter.is_some_and(|f| f.matches(direction)) {
            return Some(data);
        }
        let ts = timestamp(SystemTime::now());

        if let Some(console) = &self.console {
            let record = self.console_record(&data, direction, ts);
            let mut out = console.lock();
            if let Err(e) = out.write_all(record.as_bytes()).and_then(|_| out.flush()) {
                warn!(pair = self.pair, error = %e, "logger console write failed");
            }
        }
        if let Some(json) = &self.json {
            let line = self.json_record(&data, direction, ts);
            let mut out = json.lock();
            if let Err(e) = writeln!(out, "{line}").and_then(|_| out.flush()) {
                warn!(pair = self.pair, error = %e, "logger json write failed");
            }
        }
        Some(data)
    }
}

fn timestamp(now: SystemTime) -> f64 {
    now.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Classic hex dump: offset, hex bytes, printable ASCII between bars.
/// Each line starts with `marker`.
pub fn hexdump(data: &[u8], width: usize, marker: char) -> String {
    let mut out = String::new();
    for (i, chunk) in data.chunks(width.max(1)).enumerate() {
        let _ = write!(out, "{marker} {:08x}  ", i * width);
        for b in chunk {
            let _ = write!(out, "{b:02x} ");
        }
        for _ in chunk.len()..width {
            out.push_str("   ");
        }
        out.push_str(" |");
        out.extend(chunk.iter().map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        }));
        out.push_str("|\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A console sink the test can read back.
    #[derive(Clone, Default)]
    pub struct Capture(pub Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Capture {
        pub fn writer(&self) -> SharedWriter {
            let writer: Box<dyn Write + Send> = Box::new(self.clone());
            Arc::new(Mutex::new(writer))
        }

        pub fn text(&self) -> String {
            String::from_utf8(self.0.lock().clone()).unwrap()
        }
    }

    fn plain() -> LoggerOptions {
        LoggerOptions {
            color: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_hexdump_layout() {
        let dump = hexdump(b"hello\x00world!!!!!!tail", 16, '>');
        let lines: Vec<_> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("> 00000000  68 65 6c 6c 6f 00 "));
        assert!(lines[0].ends_with("|hello.world!!!!!|"));
        assert!(lines[1].starts_with("> 00000010  21 74 61 69 6c "));
        assert!(lines[1].ends_with("|!tail|"));
        // Short lines are padded so the ASCII column lines up.
        assert_eq!(lines[0].find('|'), lines[1].find('|'));
    }

    #[test]
    fn test_logger_passes_data_through() {
        let capture = Capture::default();
        let factory = LoggerFactory::new(plain()).unwrap().with_console(capture.writer());
        let mut logger = factory.create(&PairInfo::new(3, "a", "b")).unwrap();
        let data = Bytes::from_static(b"hello");
        assert_eq!(logger.handle(data.clone(), Direction::AToB), Some(data));

        let text = capture.text();
        assert!(text.starts_with("> [pair 3] "));
        assert!(text.contains(" 5 bytes\n"));
        assert!(text.contains("|hello|"));
    }

    #[test]
    fn test_colors_by_direction() {
        let capture = Capture::default();
        let factory = LoggerFactory::new(LoggerOptions::default())
            .unwrap()
            .with_console(capture.writer());
        let mut logger = factory.create(&PairInfo::new(1, "a", "b")).unwrap();
        logger.handle(Bytes::from_static(b"req"), Direction::AToB);
        logger.handle(Bytes::from_static(b"resp"), Direction::BToA);

        let text = capture.text();
        assert!(text.starts_with("\x1b[31m> "));
        assert!(text.contains("\x1b[32m< "));
        assert!(text.ends_with("\x1b[0m"));
    }

    #[test]
    fn test_response_only() {
        let capture = Capture::default();
        let options = LoggerOptions {
            request: false,
            ..plain()
        };
        let factory = LoggerFactory::new(options).unwrap().with_console(capture.writer());
        let mut logger = factory.create(&PairInfo::new(1, "a", "b")).unwrap();
        logger.handle(Bytes::from_static(b"req"), Direction::AToB);
        assert!(capture.text().is_empty());
        logger.handle(Bytes::from_static(b"resp"), Direction::BToA);
        assert!(capture.text().starts_with("< "));
    }

    #[test]
    fn test_text_mode_escapes() {
        let capture = Capture::default();
        let options = LoggerOptions {
            hex: false,
            ..plain()
        };
        let factory = LoggerFactory::new(options).unwrap().with_console(capture.writer());
        let mut logger = factory.create(&PairInfo::new(1, "a", "b")).unwrap();
        logger.handle(Bytes::from_static(b"GET /\r\n"), Direction::AToB);
        assert!(capture.text().ends_with("> GET /\\r\\n\n"));
    }

    #[test]
    fn test_json_lines_shared_across_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("traffic.jsonl");
        let options = LoggerOptions {
            json: Some(path.clone()),
            quiet: true,
            ..Default::default()
        };
        let factory = LoggerFactory::new(options).unwrap();
        let mut first = factory.create(&PairInfo::new(1, "a", "b")).unwrap();
        let mut second = factory.create(&PairInfo::new(2, "a", "b")).unwrap();
        first.handle(Bytes::from_static(b"hi"), Direction::AToB);
        second.handle(Bytes::from_static(b"\xff"), Direction::BToA);

        let content = std::fs::read_to_string(&path).unwrap();
        let records: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["pair"], 1);
        assert_eq!(records[0]["one"], true);
        assert_eq!(records[0]["data"], "6869");
        assert_eq!(records[1]["pair"], 2);
        assert_eq!(records[1]["one"], false);
        assert_eq!(records[1]["len"], 1);
    }
}
