//! Codec registry.

use interpose_core::{Options, Registry, parse_options};
use serde::Deserialize;

use crate::codec::CodecSpec;
use crate::error::CodecError;
use crate::length::{ByteOrder, LengthFormat};

/// Builds a [`CodecSpec`] from its configuration options.
pub type CodecConstructor = fn(&Options) -> Result<CodecSpec, CodecError>;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LengthOptions {
    #[serde(default = "default_prefix_size")]
    prefix_size: usize,
    #[serde(default)]
    byte_order: ByteOrder,
    #[serde(default)]
    reverse: bool,
}

fn default_prefix_size() -> usize {
    interpose_core::DEFAULT_LENGTH_PREFIX_SIZE
}

fn passthrough(_options: &Options) -> Result<CodecSpec, CodecError> {
    Ok(CodecSpec::Passthrough)
}

fn length(options: &Options) -> Result<CodecSpec, CodecError> {
    let opts: LengthOptions = parse_options("length", options)?;
    let mut format = LengthFormat::new(opts.prefix_size, opts.byte_order)?;
    if opts.reverse {
        format = format.reversed();
    }
    Ok(CodecSpec::Length(format))
}

/// The built-in codecs.
pub fn codecs() -> Registry<CodecConstructor> {
    let mut reg: Registry<CodecConstructor> = Registry::new("codec");
    reg.register("passthrough", "no framing; chunks are frames", passthrough)
        .register(
            "length",
            "length-prefixed frames (prefix_size, byte_order, reverse)",
            length,
        );
    reg
}

/// Resolve `name` + `options` to a codec spec.
pub fn build_codec(name: &str, options: &Options) -> Result<CodecSpec, CodecError> {
    let reg = codecs();
    let ctor = reg.lookup(name)?;
    ctor(options)
}
