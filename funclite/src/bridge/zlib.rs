//! Compression bridge.
//!
//! One-shot deflate/gzip/raw/brotli (and zstd when compiled in) in sync and
//! promise forms, plus stateful deflate-family streams behind handles. The
//! guest stream shim drains buffered output with `_zlib_streamRead` after
//! each write and collects the tail from `end`.

use std::io::Write;
use std::sync::Arc;

use flate2::Compression;
use flate2::write::{DeflateDecoder, DeflateEncoder, GzDecoder, GzEncoder, ZlibDecoder, ZlibEncoder};
use funclite_shared::{FuncliteError, FuncliteResult};
use rquickjs::Ctx;
use rquickjs::function::{Async, Func, Opt};

use super::convert::{AsyncReply, BytesArg, JsBytes, sync_result};
use super::handles::HandleObject;
use super::BridgeState;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Codec {
    Deflate,
    Inflate,
    Gzip,
    Gunzip,
    DeflateRaw,
    InflateRaw,
    BrotliCompress,
    BrotliDecompress,
    #[cfg(feature = "zstd")]
    ZstdCompress,
    #[cfg(feature = "zstd")]
    ZstdDecompress,
}

impl Codec {
    fn parse(name: &str) -> FuncliteResult<Self> {
        match name {
            "deflate" => Ok(Codec::Deflate),
            "inflate" => Ok(Codec::Inflate),
            "gzip" => Ok(Codec::Gzip),
            "gunzip" => Ok(Codec::Gunzip),
            "deflateRaw" => Ok(Codec::DeflateRaw),
            "inflateRaw" => Ok(Codec::InflateRaw),
            "brotliCompress" => Ok(Codec::BrotliCompress),
            "brotliDecompress" => Ok(Codec::BrotliDecompress),
            #[cfg(feature = "zstd")]
            "zstdCompress" => Ok(Codec::ZstdCompress),
            #[cfg(feature = "zstd")]
            "zstdDecompress" => Ok(Codec::ZstdDecompress),
            other => Err(FuncliteError::InvalidArgument(format!(
                "unknown compression operation: {}",
                other
            ))),
        }
    }
}

const BROTLI_BUFFER: usize = 4096;
const BROTLI_QUALITY: u32 = 5;
const BROTLI_WINDOW: u32 = 22;

fn run_codec(codec: Codec, level: Option<u32>, input: &[u8]) -> FuncliteResult<Vec<u8>> {
    let level = level
        .map(|l| Compression::new(l.min(9)))
        .unwrap_or_else(Compression::default);
    let corrupt = |_| FuncliteError::InvalidArgument("invalid compressed data".into());
    match codec {
        Codec::Deflate => {
            let mut enc = ZlibEncoder::new(Vec::new(), level);
            enc.write_all(input).map_err(corrupt)?;
            enc.finish().map_err(corrupt)
        }
        Codec::Inflate => {
            let mut dec = ZlibDecoder::new(Vec::new());
            dec.write_all(input).map_err(corrupt)?;
            dec.finish().map_err(corrupt)
        }
        Codec::Gzip => {
            let mut enc = GzEncoder::new(Vec::new(), level);
            enc.write_all(input).map_err(corrupt)?;
            enc.finish().map_err(corrupt)
        }
        Codec::Gunzip => {
            let mut dec = GzDecoder::new(Vec::new());
            dec.write_all(input).map_err(corrupt)?;
            dec.finish().map_err(corrupt)
        }
        Codec::DeflateRaw => {
            let mut enc = DeflateEncoder::new(Vec::new(), level);
            enc.write_all(input).map_err(corrupt)?;
            enc.finish().map_err(corrupt)
        }
        Codec::InflateRaw => {
            let mut dec = DeflateDecoder::new(Vec::new());
            dec.write_all(input).map_err(corrupt)?;
            dec.finish().map_err(corrupt)
        }
        Codec::BrotliCompress => {
            let mut out = Vec::new();
            {
                let mut writer =
                    brotli::CompressorWriter::new(&mut out, BROTLI_BUFFER, BROTLI_QUALITY, BROTLI_WINDOW);
                writer.write_all(input).map_err(corrupt)?;
                writer.flush().map_err(corrupt)?;
            }
            Ok(out)
        }
        Codec::BrotliDecompress => {
            let mut out = Vec::new();
            let mut input_ref = input;
            brotli::BrotliDecompress(&mut input_ref, &mut out).map_err(corrupt)?;
            Ok(out)
        }
        #[cfg(feature = "zstd")]
        Codec::ZstdCompress => {
            zstd::stream::encode_all(input, 0).map_err(corrupt)
        }
        #[cfg(feature = "zstd")]
        Codec::ZstdDecompress => {
            zstd::stream::decode_all(input).map_err(corrupt)
        }
    }
}

// ============================================================================
// STREAM HANDLES
// ============================================================================

/// Stateful deflate-family transform behind a handle.
///
/// Output accumulates in the inner vector; `take_output` drains it, `finish`
/// consumes the stream and returns the tail.
pub enum CompressStream {
    Deflate(ZlibEncoder<Vec<u8>>),
    Inflate(ZlibDecoder<Vec<u8>>),
    Gzip(GzEncoder<Vec<u8>>),
    Gunzip(GzDecoder<Vec<u8>>),
    DeflateRaw(DeflateEncoder<Vec<u8>>),
    InflateRaw(DeflateDecoder<Vec<u8>>),
}

impl CompressStream {
    pub fn create(kind: &str, level: Option<u32>) -> FuncliteResult<Self> {
        let level = level
            .map(|l| Compression::new(l.min(9)))
            .unwrap_or_else(Compression::default);
        match Codec::parse(kind)? {
            Codec::Deflate => Ok(CompressStream::Deflate(ZlibEncoder::new(Vec::new(), level))),
            Codec::Inflate => Ok(CompressStream::Inflate(ZlibDecoder::new(Vec::new()))),
            Codec::Gzip => Ok(CompressStream::Gzip(GzEncoder::new(Vec::new(), level))),
            Codec::Gunzip => Ok(CompressStream::Gunzip(GzDecoder::new(Vec::new()))),
            Codec::DeflateRaw => Ok(CompressStream::DeflateRaw(DeflateEncoder::new(Vec::new(), level))),
            Codec::InflateRaw => Ok(CompressStream::InflateRaw(DeflateDecoder::new(Vec::new()))),
            _ => Err(FuncliteError::InvalidArgument(format!(
                "streaming is not supported for {}",
                kind
            ))),
        }
    }

    pub fn write(&mut self, chunk: &[u8]) -> FuncliteResult<()> {
        let corrupt = |_| FuncliteError::InvalidArgument("invalid compressed data".into());
        match self {
            CompressStream::Deflate(w) => w.write_all(chunk).map_err(corrupt),
            CompressStream::Inflate(w) => w.write_all(chunk).map_err(corrupt),
            CompressStream::Gzip(w) => w.write_all(chunk).map_err(corrupt),
            CompressStream::Gunzip(w) => w.write_all(chunk).map_err(corrupt),
            CompressStream::DeflateRaw(w) => w.write_all(chunk).map_err(corrupt),
            CompressStream::InflateRaw(w) => w.write_all(chunk).map_err(corrupt),
        }
    }

    pub fn flush(&mut self) -> FuncliteResult<()> {
        let fail = |_| FuncliteError::Internal("flush failed".into());
        match self {
            CompressStream::Deflate(w) => w.flush().map_err(fail),
            CompressStream::Inflate(w) => w.flush().map_err(fail),
            CompressStream::Gzip(w) => w.flush().map_err(fail),
            CompressStream::Gunzip(w) => w.flush().map_err(fail),
            CompressStream::DeflateRaw(w) => w.flush().map_err(fail),
            CompressStream::InflateRaw(w) => w.flush().map_err(fail),
        }
    }

    /// Drain output produced so far.
    pub fn take_output(&mut self) -> Vec<u8> {
        match self {
            CompressStream::Deflate(w) => std::mem::take(w.get_mut()),
            CompressStream::Inflate(w) => std::mem::take(w.get_mut()),
            CompressStream::Gzip(w) => std::mem::take(w.get_mut()),
            CompressStream::Gunzip(w) => std::mem::take(w.get_mut()),
            CompressStream::DeflateRaw(w) => std::mem::take(w.get_mut()),
            CompressStream::InflateRaw(w) => std::mem::take(w.get_mut()),
        }
    }

    pub fn finish(self) -> FuncliteResult<Vec<u8>> {
        let corrupt = |_| FuncliteError::InvalidArgument("invalid compressed data".into());
        match self {
            CompressStream::Deflate(w) => w.finish().map_err(corrupt),
            CompressStream::Inflate(w) => w.finish().map_err(corrupt),
            CompressStream::Gzip(w) => w.finish().map_err(corrupt),
            CompressStream::Gunzip(w) => w.finish().map_err(corrupt),
            CompressStream::DeflateRaw(w) => w.finish().map_err(corrupt),
            CompressStream::InflateRaw(w) => w.finish().map_err(corrupt),
        }
    }
}

// ============================================================================
// INSTALLATION
// ============================================================================

pub fn install(ctx: &Ctx<'_>, state: &Arc<BridgeState>) -> rquickjs::Result<()> {
    let globals = ctx.globals();

    globals.set(
        "_zlib_runSync",
        Func::from(|ctx: Ctx<'_>, op: String, data: BytesArg, level: Opt<u32>| {
            let result = Codec::parse(&op).and_then(|c| run_codec(c, level.0, &data.0));
            sync_result(&ctx, result.map(JsBytes))
        }),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_zlib_run",
        Func::from(Async(move |op: String, data: BytesArg, level: Opt<u32>| {
            let st = Arc::clone(&st);
            async move {
                let result = st
                    .guard(async move {
                        tokio::task::spawn_blocking(move || {
                            Codec::parse(&op).and_then(|c| run_codec(c, level.0, &data.0))
                        })
                        .await
                        .map_err(|e| FuncliteError::Internal(format!("blocking task failed: {}", e)))?
                    })
                    .await;
                Ok::<_, rquickjs::Error>(AsyncReply::from(result.map(JsBytes)))
            }
        })),
    )?;

    // Whether zstd refs exist at all; the shim checks this.
    globals.set("_zlib_hasZstd", cfg!(feature = "zstd"))?;

    let st = Arc::clone(state);
    globals.set(
        "_zlib_streamNew",
        Func::from(move |ctx: Ctx<'_>, kind: String, level: Opt<u32>| {
            let stream = sync_result(&ctx, CompressStream::create(&kind, level.0))?;
            Ok::<_, rquickjs::Error>(st.handles.lock().insert(HandleObject::Compress(stream)))
        }),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_zlib_streamWrite",
        Func::from(move |ctx: Ctx<'_>, handle: u32, chunk: BytesArg| {
            let mut handles = st.handles.lock();
            match sync_result(&ctx, handles.get_mut(handle))? {
                HandleObject::Compress(s) => {
                    let result = s.write(&chunk.0);
                    drop(handles);
                    sync_result(&ctx, result)
                }
                _ => Err(super::throw_funclite(
                    &ctx,
                    FuncliteError::InvalidArgument("handle is not a compression stream".into()),
                )),
            }
        }),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_zlib_streamFlush",
        Func::from(move |ctx: Ctx<'_>, handle: u32| {
            let mut handles = st.handles.lock();
            match sync_result(&ctx, handles.get_mut(handle))? {
                HandleObject::Compress(s) => {
                    let result = s.flush();
                    drop(handles);
                    sync_result(&ctx, result)
                }
                _ => Err(super::throw_funclite(
                    &ctx,
                    FuncliteError::InvalidArgument("handle is not a compression stream".into()),
                )),
            }
        }),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_zlib_streamRead",
        Func::from(move |ctx: Ctx<'_>, handle: u32| {
            let mut handles = st.handles.lock();
            match sync_result(&ctx, handles.get_mut(handle))? {
                HandleObject::Compress(s) => Ok::<_, rquickjs::Error>(JsBytes(s.take_output())),
                _ => Err(super::throw_funclite(
                    &ctx,
                    FuncliteError::InvalidArgument("handle is not a compression stream".into()),
                )),
            }
        }),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_zlib_streamEnd",
        Func::from(move |ctx: Ctx<'_>, handle: u32| {
            let object = sync_result(&ctx, st.handles.lock().remove(handle))?;
            match object {
                HandleObject::Compress(s) => sync_result(&ctx, s.finish().map(JsBytes)),
                _ => Err(super::throw_funclite(
                    &ctx,
                    FuncliteError::InvalidArgument("handle is not a compression stream".into()),
                )),
            }
        }),
    )?;

    Ok(())
}
