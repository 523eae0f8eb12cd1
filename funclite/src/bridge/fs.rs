//! Filesystem bridge over the VFS.
//!
//! Sync operations run inline; the promise-returning variants (backing the
//! callback and `fs.promises` shims) run on the blocking pool and respect
//! invocation cancellation. Stream constructors are refused by the shim.

use std::sync::Arc;

use funclite_shared::{FuncliteError, FuncliteResult};
use rquickjs::Ctx;
use rquickjs::function::{Async, Func, Opt};

use super::convert::{
    AsyncReply, BytesArg, JsBytes, JsJson, TextOrBytes, data_with_encoding, sync_result,
};
use super::{BridgeState, opt_str};

fn read_with_encoding(
    state: &BridgeState,
    path: &str,
    encoding: Option<&str>,
) -> FuncliteResult<TextOrBytes> {
    match encoding {
        Some(enc) => state.vfs.read_file_string(path, enc).map(TextOrBytes::Text),
        None => state.vfs.read_file(path).map(TextOrBytes::Bytes),
    }
}

fn write_with_encoding(
    state: &BridgeState,
    path: &str,
    data: BytesArg,
    encoding: Option<&str>,
    append: bool,
) -> FuncliteResult<()> {
    let bytes = data_with_encoding(data, encoding)?;
    if append {
        state.vfs.append_file(path, &bytes)
    } else {
        state.vfs.write_file(path, &bytes)
    }
}

fn stat_json(state: &BridgeState, path: &str, follow: bool) -> FuncliteResult<JsJson> {
    let stat = if follow {
        state.vfs.stat(path)?
    } else {
        state.vfs.lstat(path)?
    };
    Ok(JsJson(serde_json::to_value(stat)?))
}

/// Run a VFS operation on the blocking pool under the cancellation guard.
async fn blocking<T: Send + 'static>(
    state: &Arc<BridgeState>,
    op: impl FnOnce(&BridgeState) -> FuncliteResult<T> + Send + 'static,
) -> FuncliteResult<T> {
    let st = Arc::clone(state);
    state
        .guard(async move {
            tokio::task::spawn_blocking(move || op(&st))
                .await
                .map_err(|e| FuncliteError::Internal(format!("blocking task failed: {}", e)))?
        })
        .await
}

pub fn install(ctx: &Ctx<'_>, state: &Arc<BridgeState>) -> rquickjs::Result<()> {
    let globals = ctx.globals();

    // ------------------------------------------------------------------
    // Synchronous surface
    // ------------------------------------------------------------------

    let st = Arc::clone(state);
    globals.set(
        "_fs_readFileSync",
        Func::from(move |ctx: Ctx<'_>, path: String, encoding: Opt<String>| {
            sync_result(&ctx, read_with_encoding(&st, &path, opt_str(&encoding)))
        }),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_fs_writeFileSync",
        Func::from(
            move |ctx: Ctx<'_>, path: String, data: BytesArg, encoding: Opt<String>| {
                sync_result(
                    &ctx,
                    write_with_encoding(&st, &path, data, opt_str(&encoding), false),
                )
            },
        ),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_fs_appendFileSync",
        Func::from(
            move |ctx: Ctx<'_>, path: String, data: BytesArg, encoding: Opt<String>| {
                sync_result(
                    &ctx,
                    write_with_encoding(&st, &path, data, opt_str(&encoding), true),
                )
            },
        ),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_fs_readdirSync",
        Func::from(move |ctx: Ctx<'_>, path: String| sync_result(&ctx, st.vfs.read_dir(&path))),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_fs_statSync",
        Func::from(move |ctx: Ctx<'_>, path: String| sync_result(&ctx, stat_json(&st, &path, true))),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_fs_lstatSync",
        Func::from(move |ctx: Ctx<'_>, path: String| {
            sync_result(&ctx, stat_json(&st, &path, false))
        }),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_fs_existsSync",
        Func::from(move |path: String| Ok::<_, rquickjs::Error>(st.vfs.exists(&path))),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_fs_accessSync",
        Func::from(move |ctx: Ctx<'_>, path: String, mode: Opt<u32>| {
            sync_result(&ctx, st.vfs.access(&path, mode.0.unwrap_or(0)))
        }),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_fs_mkdirSync",
        Func::from(move |ctx: Ctx<'_>, path: String, recursive: Opt<bool>| {
            sync_result(&ctx, st.vfs.mkdir(&path, recursive.0.unwrap_or(false)))
        }),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_fs_unlinkSync",
        Func::from(move |ctx: Ctx<'_>, path: String| sync_result(&ctx, st.vfs.unlink(&path))),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_fs_rmdirSync",
        Func::from(move |ctx: Ctx<'_>, path: String, recursive: Opt<bool>| {
            sync_result(&ctx, st.vfs.rmdir(&path, recursive.0.unwrap_or(false)))
        }),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_fs_renameSync",
        Func::from(move |ctx: Ctx<'_>, from: String, to: String| {
            sync_result(&ctx, st.vfs.rename(&from, &to))
        }),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_fs_copyFileSync",
        Func::from(move |ctx: Ctx<'_>, from: String, to: String| {
            sync_result(&ctx, st.vfs.copy_file(&from, &to))
        }),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_fs_truncateSync",
        Func::from(move |ctx: Ctx<'_>, path: String, len: Opt<f64>| {
            sync_result(&ctx, st.vfs.truncate(&path, len.0.unwrap_or(0.0) as u64))
        }),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_fs_chmodSync",
        Func::from(move |ctx: Ctx<'_>, path: String, mode: u32| {
            sync_result(&ctx, st.vfs.chmod(&path, mode))
        }),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_fs_chownSync",
        Func::from(move |ctx: Ctx<'_>, path: String, uid: u32, gid: u32| {
            sync_result(&ctx, st.vfs.chown(&path, uid, gid))
        }),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_fs_realpathSync",
        Func::from(move |ctx: Ctx<'_>, path: String| {
            // Confinement check, then report the guest-visible form.
            sync_result(&ctx, st.vfs.resolve(&path).map(|_| st.vfs.to_guest_path(&path)))
        }),
    )?;

    // ------------------------------------------------------------------
    // Descriptor surface
    // ------------------------------------------------------------------

    let st = Arc::clone(state);
    globals.set(
        "_fs_openSync",
        Func::from(move |ctx: Ctx<'_>, path: String, flags: Opt<String>| {
            let flags = flags.0.unwrap_or_else(|| "r".into());
            sync_result(&ctx, st.fds.lock().open(&st.vfs, &path, &flags))
        }),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_fs_closeSync",
        Func::from(move |ctx: Ctx<'_>, fd: u32| sync_result(&ctx, st.fds.lock().close(fd))),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_fs_readSync",
        Func::from(move |ctx: Ctx<'_>, fd: u32, length: u32, position: Opt<f64>| {
            let result = st
                .fds
                .lock()
                .read(fd, length as usize, position.0.map(|p| p as u64))
                .map(JsBytes);
            sync_result(&ctx, result)
        }),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_fs_writeSync",
        Func::from(
            move |ctx: Ctx<'_>, fd: u32, data: BytesArg, position: Opt<f64>| {
                let result = st
                    .fds
                    .lock()
                    .write(fd, &data.0, position.0.map(|p| p as u64))
                    .map(|n| n as u32);
                sync_result(&ctx, result)
            },
        ),
    )?;

    // ------------------------------------------------------------------
    // Promise-returning surface (callback + promises shims)
    // ------------------------------------------------------------------

    let st = Arc::clone(state);
    globals.set(
        "_fs_readFile",
        Func::from(Async(move |path: String, encoding: Opt<String>| {
            let st = Arc::clone(&st);
            async move {
                let result = blocking(&st, move |s| {
                    read_with_encoding(s, &path, encoding.0.as_deref())
                })
                .await;
                Ok::<_, rquickjs::Error>(AsyncReply::from(result))
            }
        })),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_fs_writeFile",
        Func::from(Async(
            move |path: String, data: BytesArg, encoding: Opt<String>| {
                let st = Arc::clone(&st);
                async move {
                    let result = blocking(&st, move |s| {
                        write_with_encoding(s, &path, data, encoding.0.as_deref(), false)
                    })
                    .await;
                    Ok::<_, rquickjs::Error>(AsyncReply::from(result))
                }
            },
        )),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_fs_appendFile",
        Func::from(Async(
            move |path: String, data: BytesArg, encoding: Opt<String>| {
                let st = Arc::clone(&st);
                async move {
                    let result = blocking(&st, move |s| {
                        write_with_encoding(s, &path, data, encoding.0.as_deref(), true)
                    })
                    .await;
                    Ok::<_, rquickjs::Error>(AsyncReply::from(result))
                }
            },
        )),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_fs_readdir",
        Func::from(Async(move |path: String| {
            let st = Arc::clone(&st);
            async move {
                let result = blocking(&st, move |s| s.vfs.read_dir(&path)).await;
                Ok::<_, rquickjs::Error>(AsyncReply::from(result))
            }
        })),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_fs_stat",
        Func::from(Async(move |path: String| {
            let st = Arc::clone(&st);
            async move {
                let result = blocking(&st, move |s| stat_json(s, &path, true)).await;
                Ok::<_, rquickjs::Error>(AsyncReply::from(result))
            }
        })),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_fs_access",
        Func::from(Async(move |path: String, mode: Opt<u32>| {
            let st = Arc::clone(&st);
            async move {
                let result = blocking(&st, move |s| s.vfs.access(&path, mode.0.unwrap_or(0))).await;
                Ok::<_, rquickjs::Error>(AsyncReply::from(result))
            }
        })),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_fs_mkdir",
        Func::from(Async(move |path: String, recursive: Opt<bool>| {
            let st = Arc::clone(&st);
            async move {
                let result =
                    blocking(&st, move |s| s.vfs.mkdir(&path, recursive.0.unwrap_or(false))).await;
                Ok::<_, rquickjs::Error>(AsyncReply::from(result))
            }
        })),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_fs_unlink",
        Func::from(Async(move |path: String| {
            let st = Arc::clone(&st);
            async move {
                let result = blocking(&st, move |s| s.vfs.unlink(&path)).await;
                Ok::<_, rquickjs::Error>(AsyncReply::from(result))
            }
        })),
    )?;

    Ok(())
}
