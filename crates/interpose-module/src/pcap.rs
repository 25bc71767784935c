//! Capture relayed units into a pcap file.
//!
//! All pairs of a run share one file. The console logger is off by default
//! and can be switched on with `log = true`.

use std::fs::{File, OpenOptions};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use interpose_proto::pcap::PcapWriter;
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::ModuleError;
use crate::logger::{Logger, LoggerFactory, LoggerOptions};
use crate::module::{Direction, Module, ModuleFactory, PairInfo};

type SharedPcap = Arc<Mutex<PcapWriter<BufWriter<File>>>>;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PcapOptions {
    #[serde(default = "default_file")]
    pub file: PathBuf,
    /// Keep an existing capture and add records to it.
    #[serde(default)]
    pub append: bool,
    /// Flush after every record.
    #[serde(default = "default_true")]
    pub sync: bool,
    /// Also dump to the console.
    #[serde(default)]
    pub log: bool,
    #[serde(default = "default_true")]
    pub hex: bool,
    #[serde(default = "default_true")]
    pub color: bool,
}

fn default_file() -> PathBuf {
    PathBuf::from(interpose_core::DEFAULT_PCAP_FILE)
}

fn default_true() -> bool {
    true
}

impl Default for PcapOptions {
    fn default() -> Self {
        Self {
            file: default_file(),
            append: false,
            sync: true,
            log: false,
            hex: true,
            color: true,
        }
    }
}

pub struct PcapFactory {
    writer: SharedPcap,
    sync: bool,
    logger: LoggerFactory,
}

impl std::fmt::Debug for PcapFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PcapFactory")
            .field("records", &self.writer.lock().records())
            .field("sync", &self.sync)
            .finish()
    }
}

impl PcapFactory {
    pub fn new(options: PcapOptions) -> Result<Self, ModuleError> {
        let writer = open_capture(&options.file, options.append).map_err(|source| {
            ModuleError::Output {
                path: options.file.clone(),
                source,
            }
        })?;
        let logger = LoggerFactory::new(LoggerOptions {
            hex: options.hex,
            color: options.color,
            quiet: !options.log,
            ..Default::default()
        })?;
        Ok(Self {
            writer: Arc::new(Mutex::new(writer)),
            sync: options.sync,
            logger,
        })
    }

    /// Records written so far across every pair.
    pub fn records(&self) -> u64 {
        self.writer.lock().records()
    }
}

fn open_capture(path: &Path, append: bool) -> std::io::Result<PcapWriter<BufWriter<File>>> {
    let resume = append && std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false);
    let file = if resume {
        OpenOptions::new().append(true).open(path)?
    } else {
        File::create(path)?
    };
    debug!(path = %path.display(), resume, "pcap capture opened");
    let mut writer = PcapWriter::new(BufWriter::new(file), resume)?;
    writer.flush()?;
    Ok(writer)
}

impl ModuleFactory for PcapFactory {
    fn name(&self) -> &'static str {
        "pcap"
    }

    fn create(&self, pair: &PairInfo) -> Result<Box<dyn Module>, ModuleError> {
        Ok(Box::new(Pcap {
            pair: pair.id,
            writer: self.writer.clone(),
            sync: self.sync,
            logger: self.logger.logger(pair),
        }))
    }
}

pub struct Pcap {
    pair: u64,
    writer: SharedPcap,
    sync: bool,
    logger: Logger,
}

impl Module for Pcap {
    fn handle(&mut self, data: Bytes, direction: Direction) -> Option<Bytes> {
        {
            let mut writer = self.writer.lock();
            let mut result = writer.write_record(SystemTime::now(), &data);
            if self.sync && result.is_ok() {
                result = writer.flush();
            }
            if let Err(e) = result {
                warn!(pair = self.pair, error = %e, "pcap write failed");
            }
        }
        self.logger.handle(data, direction)
    }

    fn close(&mut self) {
        if let Err(e) = self.writer.lock().flush() {
            warn!(pair = self.pair, error = %e, "pcap flush failed");
        }
    }
}
