//! POSIX path algebra for the guest path universe.
//!
//! Guest paths always use `/`, independent of the host platform, so these
//! operate on strings rather than `std::path`. Semantics follow the usual
//! `path.posix` behaviour.

use rquickjs::function::{Func, Rest};
use rquickjs::Ctx;
use serde::Serialize;

use super::constrain_ctx_value;
use super::convert::JsJson;

#[derive(Serialize)]
struct ParsedPath {
    root: String,
    dir: String,
    base: String,
    ext: String,
    name: String,
}

pub fn normalize(input: &str) -> String {
    if input.is_empty() {
        return ".".into();
    }
    let absolute = input.starts_with('/');
    let trailing_slash = input.len() > 1 && input.ends_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for seg in input.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                if let Some(last) = parts.last() {
                    if *last == ".." {
                        parts.push("..");
                    } else {
                        parts.pop();
                    }
                } else if !absolute {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    let mut out = String::new();
    if absolute {
        out.push('/');
    }
    out.push_str(&parts.join("/"));
    if out.is_empty() {
        return ".".into();
    }
    if trailing_slash && !out.ends_with('/') {
        out.push('/');
    }
    out
}

pub fn join(parts: &[String]) -> String {
    let joined = parts
        .iter()
        .filter(|p| !p.is_empty())
        .cloned()
        .collect::<Vec<_>>()
        .join("/");
    if joined.is_empty() {
        ".".into()
    } else {
        normalize(&joined)
    }
}

/// Right-to-left resolution against `/app` as the working directory.
pub fn resolve(parts: &[String]) -> String {
    let mut resolved = String::new();
    for part in parts.iter().rev() {
        if part.is_empty() {
            continue;
        }
        if resolved.is_empty() {
            resolved = part.clone();
        } else {
            resolved = format!("{}/{}", part, resolved);
        }
        if part.starts_with('/') {
            return normalize(&resolved);
        }
    }
    if resolved.is_empty() {
        return crate::vfs::GUEST_ROOT.to_string();
    }
    normalize(&format!("{}/{}", crate::vfs::GUEST_ROOT, resolved))
}

pub fn dirname(input: &str) -> String {
    let trimmed = input.trim_end_matches('/');
    if trimmed.is_empty() {
        return if input.starts_with('/') { "/".into() } else { ".".into() };
    }
    match trimmed.rfind('/') {
        Some(0) => "/".into(),
        Some(idx) => trimmed[..idx].to_string(),
        None => ".".into(),
    }
}

pub fn basename(input: &str, ext: Option<&str>) -> String {
    let trimmed = input.trim_end_matches('/');
    let base = match trimmed.rfind('/') {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    };
    if let Some(ext) = ext {
        if base.len() > ext.len() && base.ends_with(ext) {
            return base[..base.len() - ext.len()].to_string();
        }
    }
    base.to_string()
}

pub fn extname(input: &str) -> String {
    let base = basename(input, None);
    match base.rfind('.') {
        // A leading dot is a hidden file, not an extension.
        Some(0) | None => String::new(),
        Some(idx) => base[idx..].to_string(),
    }
}

pub fn relative(from: &str, to: &str) -> String {
    let from = resolve(&[from.to_string()]);
    let to = resolve(&[to.to_string()]);
    let from_parts: Vec<&str> = from.split('/').filter(|p| !p.is_empty()).collect();
    let to_parts: Vec<&str> = to.split('/').filter(|p| !p.is_empty()).collect();
    let common = from_parts
        .iter()
        .zip(to_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let mut out: Vec<String> = Vec::new();
    for _ in common..from_parts.len() {
        out.push("..".into());
    }
    for part in &to_parts[common..] {
        out.push((*part).to_string());
    }
    out.join("/")
}

fn parse(input: &str) -> ParsedPath {
    let root = if input.starts_with('/') { "/" } else { "" }.to_string();
    let base = basename(input, None);
    let ext = extname(input);
    let name = if ext.is_empty() {
        base.clone()
    } else {
        base[..base.len() - ext.len()].to_string()
    };
    let dir = dirname(input);
    ParsedPath {
        root,
        dir: if dir == "." && !input.contains('/') { String::new() } else { dir },
        base,
        ext,
        name,
    }
}

fn format_record(record: &serde_json::Value) -> String {
    let get = |key: &str| {
        record
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string()
    };
    let dir = {
        let d = get("dir");
        if d.is_empty() { get("root") } else { d }
    };
    let base = {
        let b = get("base");
        if b.is_empty() {
            format!("{}{}", get("name"), get("ext"))
        } else {
            b
        }
    };
    if dir.is_empty() {
        base
    } else if dir == "/" {
        format!("/{}", base)
    } else {
        format!("{}/{}", dir, base)
    }
}

pub fn install(ctx: &Ctx<'_>) -> rquickjs::Result<()> {
    let globals = ctx.globals();

    globals.set(
        "_path_normalize",
        Func::from(|p: String| Ok::<_, rquickjs::Error>(normalize(&p))),
    )?;
    globals.set(
        "_path_join",
        Func::from(|parts: Rest<String>| Ok::<_, rquickjs::Error>(join(&parts.0))),
    )?;
    globals.set(
        "_path_resolve",
        Func::from(|parts: Rest<String>| Ok::<_, rquickjs::Error>(resolve(&parts.0))),
    )?;
    globals.set(
        "_path_dirname",
        Func::from(|p: String| Ok::<_, rquickjs::Error>(dirname(&p))),
    )?;
    globals.set(
        "_path_basename",
        Func::from(|p: String, ext: rquickjs::function::Opt<String>| {
            Ok::<_, rquickjs::Error>(basename(&p, ext.0.as_deref()))
        }),
    )?;
    globals.set(
        "_path_extname",
        Func::from(|p: String| Ok::<_, rquickjs::Error>(extname(&p))),
    )?;
    globals.set(
        "_path_isAbsolute",
        Func::from(|p: String| Ok::<_, rquickjs::Error>(p.starts_with('/'))),
    )?;
    globals.set(
        "_path_relative",
        Func::from(|from: String, to: String| Ok::<_, rquickjs::Error>(relative(&from, &to))),
    )?;
    globals.set(
        "_path_parse",
        Func::from(|p: String| {
            let parsed = parse(&p);
            let json = serde_json::to_value(parsed).unwrap_or(serde_json::Value::Null);
            Ok::<_, rquickjs::Error>(JsJson(json))
        }),
    )?;
    globals.set(
        "_path_format",
        Func::from(constrain_ctx_value(|ctx: Ctx<'_>, record: rquickjs::Value<'_>| {
            let text = ctx
                .json_stringify(record)?
                .map(|s| s.to_string())
                .transpose()?
                .unwrap_or_default();
            let json: serde_json::Value = serde_json::from_str(&text).unwrap_or_default();
            Ok::<_, rquickjs::Error>(format_record(&json))
        })),
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_handles_dots_and_slashes() {
        assert_eq!(normalize("/app/./x/../y"), "/app/y");
        assert_eq!(normalize("a/b/../../.."), "..");
        assert_eq!(normalize("/../x"), "/x");
        assert_eq!(normalize(""), ".");
        assert_eq!(normalize("a//b/"), "a/b/");
    }

    #[test]
    fn join_skips_empty_segments() {
        assert_eq!(join(&["/app".into(), "".into(), "lib".into(), "x.js".into()]), "/app/lib/x.js");
        assert_eq!(join(&[]), ".");
    }

    #[test]
    fn resolve_is_right_to_left_with_app_cwd() {
        assert_eq!(resolve(&["./data".into()]), "/app/data");
        assert_eq!(resolve(&["/etc".into(), "conf".into()]), "/etc/conf");
        assert_eq!(resolve(&["a".into(), "/b".into(), "c".into()]), "/b/c");
        assert_eq!(resolve(&[]), "/app");
    }

    #[test]
    fn dirname_basename_extname() {
        assert_eq!(dirname("/app/lib/x.js"), "/app/lib");
        assert_eq!(dirname("x.js"), ".");
        assert_eq!(dirname("/x"), "/");
        assert_eq!(basename("/app/lib/x.tar.gz", None), "x.tar.gz");
        assert_eq!(basename("/app/lib/x.js", Some(".js")), "x");
        assert_eq!(extname("x.tar.gz"), ".gz");
        assert_eq!(extname(".hidden"), "");
        assert_eq!(extname("noext"), "");
    }

    #[test]
    fn relative_walks_up_and_down() {
        assert_eq!(relative("/app/a/b", "/app/a/c/d"), "../c/d");
        assert_eq!(relative("/app", "/app"), "");
        assert_eq!(relative("/app/x", "/app"), "..");
    }

    #[test]
    fn parse_and_format_round_trip() {
        let parsed = parse("/app/lib/util.test.js");
        assert_eq!(parsed.root, "/");
        assert_eq!(parsed.dir, "/app/lib");
        assert_eq!(parsed.base, "util.test.js");
        assert_eq!(parsed.ext, ".js");
        assert_eq!(parsed.name, "util.test");
        let json = serde_json::to_value(&parsed).unwrap();
        assert_eq!(format_record(&json), "/app/lib/util.test.js");
    }
}
