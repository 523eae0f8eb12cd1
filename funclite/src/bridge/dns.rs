//! DNS bridge.
//!
//! Promise-returning resolution per record type plus reverse and address
//! lookup. A `Resolver` handle carries custom upstream servers; dropping the
//! handle cancels nothing in flight but abandons the configuration.

use std::net::IpAddr;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use funclite_shared::{FuncliteError, FuncliteResult};
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::proto::rr::RecordType;
use rquickjs::Ctx;
use rquickjs::function::{Async, Func, Opt};

use super::convert::{AsyncReply, JsJson};
use super::handles::HandleObject;
use super::BridgeState;

/// Custom-server resolver behind a handle.
pub struct ResolverHandle {
    resolver: TokioAsyncResolver,
}

impl ResolverHandle {
    pub fn new(servers: Vec<IpAddr>) -> Self {
        let config = if servers.is_empty() {
            ResolverConfig::default()
        } else {
            ResolverConfig::from_parts(
                None,
                vec![],
                NameServerConfigGroup::from_ips_clear(&servers, 53, true),
            )
        };
        Self {
            resolver: TokioAsyncResolver::tokio(config, ResolverOpts::default()),
        }
    }

    pub fn resolver(&self) -> TokioAsyncResolver {
        self.resolver.clone()
    }
}

fn default_resolver() -> TokioAsyncResolver {
    static DEFAULT: OnceLock<TokioAsyncResolver> = OnceLock::new();
    DEFAULT
        .get_or_init(|| {
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        })
        .clone()
}

fn resolve_error(err: hickory_resolver::error::ResolveError, name: &str) -> FuncliteError {
    match err.kind() {
        ResolveErrorKind::NoRecordsFound { .. } => {
            FuncliteError::NotFound(format!("no DNS records for {}", name))
        }
        _ => FuncliteError::Internal(format!("DNS resolution failed for {}", name)),
    }
}

/// Resolve the addresses for a host. Used by the socket and fetch bridges
/// for their post-lookup policy checks as well.
pub async fn resolve_host_addrs(host: &str) -> FuncliteResult<Vec<IpAddr>> {
    if let Ok(literal) = IpAddr::from_str(host) {
        return Ok(vec![literal]);
    }
    let lookup = default_resolver()
        .lookup_ip(host)
        .await
        .map_err(|e| resolve_error(e, host))?;
    let addrs: Vec<IpAddr> = lookup.iter().collect();
    if addrs.is_empty() {
        return Err(FuncliteError::NotFound(format!("no addresses for {}", host)));
    }
    Ok(addrs)
}

async fn resolve_records(
    resolver: TokioAsyncResolver,
    rrtype: &str,
    name: &str,
) -> FuncliteResult<serde_json::Value> {
    let records = match rrtype.to_ascii_uppercase().as_str() {
        "A" => {
            let lookup = resolver
                .ipv4_lookup(name)
                .await
                .map_err(|e| resolve_error(e, name))?;
            lookup
                .iter()
                .map(|a| serde_json::json!(a.to_string()))
                .collect()
        }
        "AAAA" => {
            let lookup = resolver
                .ipv6_lookup(name)
                .await
                .map_err(|e| resolve_error(e, name))?;
            lookup
                .iter()
                .map(|a| serde_json::json!(a.to_string()))
                .collect()
        }
        "MX" => {
            let lookup = resolver
                .mx_lookup(name)
                .await
                .map_err(|e| resolve_error(e, name))?;
            lookup
                .iter()
                .map(|mx| {
                    serde_json::json!({
                        "priority": mx.preference(),
                        "exchange": mx.exchange().to_string().trim_end_matches('.'),
                    })
                })
                .collect()
        }
        "TXT" => {
            let lookup = resolver
                .txt_lookup(name)
                .await
                .map_err(|e| resolve_error(e, name))?;
            lookup
                .iter()
                .map(|txt| {
                    let joined = txt
                        .iter()
                        .map(|part| String::from_utf8_lossy(part).into_owned())
                        .collect::<Vec<_>>();
                    serde_json::json!(joined)
                })
                .collect()
        }
        "SRV" => {
            let lookup = resolver
                .srv_lookup(name)
                .await
                .map_err(|e| resolve_error(e, name))?;
            lookup
                .iter()
                .map(|srv| {
                    serde_json::json!({
                        "priority": srv.priority(),
                        "weight": srv.weight(),
                        "port": srv.port(),
                        "name": srv.target().to_string().trim_end_matches('.'),
                    })
                })
                .collect()
        }
        "SOA" => {
            let lookup = resolver
                .soa_lookup(name)
                .await
                .map_err(|e| resolve_error(e, name))?;
            lookup
                .iter()
                .map(|soa| {
                    serde_json::json!({
                        "nsname": soa.mname().to_string().trim_end_matches('.'),
                        "hostmaster": soa.rname().to_string().trim_end_matches('.'),
                        "serial": soa.serial(),
                        "refresh": soa.refresh(),
                        "retry": soa.retry(),
                        "expire": soa.expire(),
                        "minttl": soa.minimum(),
                    })
                })
                .collect()
        }
        other @ ("ANY" | "CNAME" | "NS" | "PTR" | "NAPTR") => {
            let rtype = RecordType::from_str(other)
                .map_err(|_| FuncliteError::InvalidArgument(format!("bad record type: {}", other)))?;
            let lookup = resolver
                .lookup(name, rtype)
                .await
                .map_err(|e| resolve_error(e, name))?;
            lookup
                .iter()
                .map(|rdata| serde_json::json!(rdata.to_string().trim_end_matches('.')))
                .collect::<Vec<_>>()
        }
        other => {
            return Err(FuncliteError::InvalidArgument(format!(
                "unsupported record type: {}",
                other
            )));
        }
    };
    Ok(serde_json::Value::Array(records))
}

fn service_name(port: u16) -> &'static str {
    match port {
        21 => "ftp",
        22 => "ssh",
        25 => "smtp",
        53 => "domain",
        80 => "http",
        110 => "pop3",
        143 => "imap",
        443 => "https",
        587 => "submission",
        993 => "imaps",
        995 => "pop3s",
        _ => "unknown",
    }
}

pub fn install(ctx: &Ctx<'_>, state: &Arc<BridgeState>) -> rquickjs::Result<()> {
    let globals = ctx.globals();

    let st = Arc::clone(state);
    globals.set(
        "_dns_resolve",
        Func::from(Async(move |rrtype: String, name: String| {
            let st = Arc::clone(&st);
            async move {
                let result = st
                    .guard(resolve_records(default_resolver(), &rrtype, &name))
                    .await;
                Ok::<_, rquickjs::Error>(AsyncReply::from(result.map(JsJson)))
            }
        })),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_dns_lookup",
        Func::from(Async(move |name: String| {
            let st = Arc::clone(&st);
            async move {
                let result = st
                    .guard(async {
                        let addrs = resolve_host_addrs(&name).await?;
                        let records = addrs
                            .iter()
                            .map(|addr| {
                                serde_json::json!({
                                    "address": addr.to_string(),
                                    "family": if addr.is_ipv4() { 4 } else { 6 },
                                })
                            })
                            .collect::<Vec<_>>();
                        Ok(serde_json::Value::Array(records))
                    })
                    .await;
                Ok::<_, rquickjs::Error>(AsyncReply::from(result.map(JsJson)))
            }
        })),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_dns_reverse",
        Func::from(Async(move |ip: String| {
            let st = Arc::clone(&st);
            async move {
                let result = st
                    .guard(async {
                        let addr = IpAddr::from_str(&ip).map_err(|_| {
                            FuncliteError::InvalidArgument(format!("invalid IP address: {}", ip))
                        })?;
                        let lookup = default_resolver()
                            .reverse_lookup(addr)
                            .await
                            .map_err(|e| resolve_error(e, &ip))?;
                        let names = lookup
                            .iter()
                            .map(|name| name.to_string().trim_end_matches('.').to_string())
                            .collect::<Vec<_>>();
                        Ok(names)
                    })
                    .await;
                Ok::<_, rquickjs::Error>(AsyncReply::from(result))
            }
        })),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_dns_lookupService",
        Func::from(Async(move |ip: String, port: u16| {
            let st = Arc::clone(&st);
            async move {
                let result = st
                    .guard(async {
                        let addr = IpAddr::from_str(&ip).map_err(|_| {
                            FuncliteError::InvalidArgument(format!("invalid IP address: {}", ip))
                        })?;
                        let hostname = match default_resolver().reverse_lookup(addr).await {
                            Ok(lookup) => lookup
                                .iter()
                                .next()
                                .map(|n| n.to_string().trim_end_matches('.').to_string())
                                .unwrap_or_else(|| ip.clone()),
                            Err(_) => ip.clone(),
                        };
                        Ok(serde_json::json!({
                            "hostname": hostname,
                            "service": service_name(port),
                        }))
                    })
                    .await;
                Ok::<_, rquickjs::Error>(AsyncReply::from(result.map(JsJson)))
            }
        })),
    )?;

    // ---- resolver handles ----
    let st = Arc::clone(state);
    globals.set(
        "_dns_resolverNew",
        Func::from(move |ctx: Ctx<'_>, servers: Opt<Vec<String>>| {
            let mut addrs = Vec::new();
            for server in servers.0.unwrap_or_default() {
                let addr = IpAddr::from_str(&server).map_err(|_| {
                    super::throw_funclite(
                        &ctx,
                        FuncliteError::InvalidArgument(format!("invalid DNS server: {}", server)),
                    )
                })?;
                addrs.push(addr);
            }
            Ok::<_, rquickjs::Error>(
                st.handles
                    .lock()
                    .insert(HandleObject::Resolver(ResolverHandle::new(addrs))),
            )
        }),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_dns_resolverResolve",
        Func::from(Async(move |handle: u32, rrtype: String, name: String| {
            let st = Arc::clone(&st);
            async move {
                let resolver = {
                    let mut handles = st.handles.lock();
                    match handles.get_mut(handle) {
                        Ok(HandleObject::Resolver(r)) => Ok(r.resolver()),
                        Ok(_) => Err(FuncliteError::InvalidArgument(
                            "handle is not a resolver".into(),
                        )),
                        Err(e) => Err(e),
                    }
                };
                let result = match resolver {
                    Ok(resolver) => {
                        st.guard(resolve_records(resolver, &rrtype, &name)).await
                    }
                    Err(e) => Err(e),
                };
                Ok::<_, rquickjs::Error>(AsyncReply::from(result.map(JsJson)))
            }
        })),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_dns_resolverDispose",
        Func::from(move |handle: u32| {
            st.handles.lock().try_remove(handle);
            Ok::<_, rquickjs::Error>(())
        }),
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_names_cover_common_ports() {
        assert_eq!(service_name(443), "https");
        assert_eq!(service_name(22), "ssh");
        assert_eq!(service_name(6543), "unknown");
    }

    #[tokio::test]
    async fn literal_addresses_skip_resolution() {
        let addrs = resolve_host_addrs("127.0.0.1").await.unwrap();
        assert_eq!(addrs, vec![IpAddr::from_str("127.0.0.1").unwrap()]);
        let addrs = resolve_host_addrs("::1").await.unwrap();
        assert_eq!(addrs, vec![IpAddr::from_str("::1").unwrap()]);
    }
}
