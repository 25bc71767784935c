//! Module registry.

use std::sync::Arc;

use interpose_core::{Options, Registry, parse_options};

use crate::corrupt::{CorruptFactory, CorruptOptions};
use crate::error::ModuleError;
use crate::logger::{LoggerFactory, LoggerOptions};
use crate::module::{ChainFactory, ModuleFactory};
use crate::pcap::{PcapFactory, PcapOptions};

/// Builds a factory from its configuration options.
pub type ModuleConstructor = fn(&Options) -> Result<Arc<dyn ModuleFactory>, ModuleError>;

fn corrupt(options: &Options) -> Result<Arc<dyn ModuleFactory>, ModuleError> {
    let opts: CorruptOptions = parse_options("corrupt", options)?;
    Ok(Arc::new(CorruptFactory::new(opts)?))
}

fn logger(options: &Options) -> Result<Arc<dyn ModuleFactory>, ModuleError> {
    let opts: LoggerOptions = parse_options("logger", options)?;
    Ok(Arc::new(LoggerFactory::new(opts)?))
}

fn pcap(options: &Options) -> Result<Arc<dyn ModuleFactory>, ModuleError> {
    let opts: PcapOptions = parse_options("pcap", options)?;
    Ok(Arc::new(PcapFactory::new(opts)?))
}

/// The built-in modules.
pub fn modules() -> Registry<ModuleConstructor> {
    let mut reg: Registry<ModuleConstructor> = Registry::new("module");
    reg.register(
        "corrupt",
        "mutate random bytes or bits (mode, rate, count, seed, direction)",
        corrupt,
    )
    .register(
        "logger",
        "dump traffic to the console and/or a JSON Lines file",
        logger,
    )
    .register("pcap", "write traffic to a pcap capture file", pcap);
    reg
}

/// Resolve one configured module.
pub fn build_module(name: &str, options: &Options) -> Result<Arc<dyn ModuleFactory>, ModuleError> {
    let reg = modules();
    let ctor = reg.lookup(name)?;
    ctor(options)
}

/// Resolve an ordered list of configured modules.
pub fn build_chain<'a, I>(specs: I) -> Result<ChainFactory, ModuleError>
where
    I: IntoIterator<Item = (&'a str, &'a Options)>,
{
    let reg = modules();
    let mut chain = ChainFactory::default();
    for (name, options) in specs {
        let ctor = reg.lookup(name)?;
        chain.push(ctor(options)?);
    }
    Ok(chain)
}
