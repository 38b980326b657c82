//! Network policy: preamble generation and host-side URL validation.
//!
//! The preamble is a self-contained script evaluated before user code. It
//! only touches the global object: in `blocked` mode every network primitive
//! becomes a throwing stub installed with non-writable, non-configurable
//! property semantics; in `allow-list` and `unrestricted` modes `fetch`
//! delegates to the host over the reserved `__net` bridge route, where
//! [`is_url_allowed`] is enforced. The interpreter itself ships no network
//! primitives, so the host bridge is the only path out.

use std::net::IpAddr;

use capsule_js_common::config::NetworkPolicy;
use url::{Host, Url};

/// Reserved bridge adapter name for host-mediated fetches.
pub const NET_ADAPTER: &str = "__net";

/// Message thrown by neutralized primitives in `blocked` mode.
pub const NETWORK_BLOCKED_MESSAGE: &str = "Network access is blocked in this sandbox";

/// Opaque message for primitives that stay blocked under an allow list. Must
/// not leak the list itself.
const OPAQUE_BLOCKED_MESSAGE: &str = "Network access blocked";

const NEUTRALIZED_PRIMITIVES: &[&str] = &["fetch", "XMLHttpRequest", "WebSocket", "EventSource"];

/// Generate the policy preamble for a sandbox configuration.
pub fn generate_preamble(policy: &NetworkPolicy) -> String {
    match policy {
        NetworkPolicy::Blocked => blocked_preamble(),
        NetworkPolicy::AllowList(_) => delegating_preamble(true),
        NetworkPolicy::Unrestricted => delegating_preamble(false),
    }
}

fn freeze_property(name: &str, value_expr: &str) -> String {
    format!(
        "Object.defineProperty(globalThis, {name:?}, {{ value: {value_expr}, writable: false, configurable: false, enumerable: false }});"
    )
}

fn blocked_preamble() -> String {
    let mut script = String::from(
        "(() => {\n  \"use strict\";\n  const originals = {};\n",
    );
    for name in NEUTRALIZED_PRIMITIVES {
        // Original handles (if any) end up captured here, unreachable from
        // user scope.
        script.push_str(&format!("  originals[{name:?}] = globalThis[{name:?}];\n"));
        let stub = format!(
            "function {name}() {{ throw new Error({NETWORK_BLOCKED_MESSAGE:?}); }}"
        );
        script.push_str("  ");
        script.push_str(&freeze_property(name, &stub));
        script.push('\n');
    }
    script.push_str("})();\n");
    script
}

/// `fetch` delegates to the host bridge; the host decides per URL. With
/// `restricted` the remaining primitives throw an opaque message.
fn delegating_preamble(restricted: bool) -> String {
    let mut script = String::from("(() => {\n  \"use strict\";\n");
    script.push_str("  const call = globalThis.__adapter_call;\n");
    script.push_str("  const makeResponse = globalThis.__make_response;\n");
    script.push_str(concat!(
        "  const wrapped = function fetch(input, init) {\n",
        "    let url;\n",
        "    try {\n",
        "      url = typeof input === \"string\"\n",
        "        ? input\n",
        "        : String(input && input.url !== undefined ? input.url : input);\n",
        "    } catch (coercionError) {\n",
        "      return Promise.reject(new TypeError(\"fetch: request is not coercible to a URL\"));\n",
        "    }\n",
        "    return call(\"__net\", \"fetch\", [url, init === undefined ? null : init]).then(makeResponse);\n",
        "  };\n",
    ));
    script.push_str("  ");
    script.push_str(&freeze_property("fetch", "wrapped"));
    script.push('\n');
    if restricted {
        for name in &NEUTRALIZED_PRIMITIVES[1..] {
            let stub = format!(
                "function {name}() {{ throw new Error({OPAQUE_BLOCKED_MESSAGE:?}); }}"
            );
            script.push_str("  ");
            script.push_str(&freeze_property(name, &stub));
            script.push('\n');
        }
    }
    script.push_str("})();\n");
    script
}

/// Host-side verdict for a fetch attempted by sandboxed code.
pub fn is_url_allowed(raw: &str, policy: &NetworkPolicy) -> bool {
    let domains = match policy {
        NetworkPolicy::Blocked => return false,
        NetworkPolicy::Unrestricted => None,
        NetworkPolicy::AllowList(domains) => Some(domains),
    };

    let Ok(url) = Url::parse(raw) else {
        return false;
    };
    if !matches!(url.scheme(), "http" | "https") {
        return false;
    }
    let Some(host) = url.host() else {
        return false;
    };

    let Some(domains) = domains else {
        // Unrestricted: any well-formed http(s) URL goes through.
        return true;
    };

    match host {
        Host::Domain(name) => {
            let name = name.to_ascii_lowercase();
            if name == "localhost" || name.ends_with(".localhost") {
                return false;
            }
            domains.iter().any(|d| {
                let d = d.to_ascii_lowercase();
                name == d || name.ends_with(&format!(".{d}"))
            })
        }
        Host::Ipv4(ip) => !is_forbidden_ip(IpAddr::V4(ip)) && domains.iter().any(|d| d == &ip.to_string()),
        Host::Ipv6(ip) => !is_forbidden_ip(IpAddr::V6(ip)) && domains.iter().any(|d| d == &ip.to_string()),
    }
}

/// Loopback, link-local, RFC 1918 private, and IPv6 unique-local addresses
/// are never fetchable under an allow list.
fn is_forbidden_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                // Unique-local fc00::/7.
                || (first & 0xfe00) == 0xfc00
                // Link-local fe80::/10.
                || (first & 0xffc0) == 0xfe80
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allow(domains: &[&str]) -> NetworkPolicy {
        NetworkPolicy::allow_list(domains.iter().copied())
    }

    #[test]
    fn blocked_preamble_neutralizes_every_primitive() {
        let preamble = generate_preamble(&NetworkPolicy::Blocked);
        for name in ["fetch", "XMLHttpRequest", "WebSocket", "EventSource"] {
            assert!(preamble.contains(name), "{name} missing from preamble");
        }
        assert!(preamble.contains(NETWORK_BLOCKED_MESSAGE));
        assert!(preamble.contains("writable: false"));
        assert!(preamble.contains("configurable: false"));
    }

    #[test]
    fn allow_list_preamble_does_not_leak_the_list() {
        let preamble = generate_preamble(&allow(&["internal.example.com"]));
        assert!(!preamble.contains("internal.example.com"));
        assert!(preamble.contains("__net"));
    }

    #[test]
    fn unrestricted_preamble_installs_only_fetch() {
        let preamble = generate_preamble(&NetworkPolicy::Unrestricted);
        assert!(preamble.contains("fetch"));
        assert!(!preamble.contains("WebSocket"));
    }

    #[test]
    fn allow_list_accepts_exact_domain_and_subdomains() {
        let policy = allow(&["example.com"]);
        assert!(is_url_allowed("https://example.com/a", &policy));
        assert!(is_url_allowed("https://api.example.com/a?b=1", &policy));
        assert!(is_url_allowed("http://deep.api.example.com", &policy));
    }

    #[test]
    fn allow_list_rejects_lookalike_domains() {
        let policy = allow(&["example.com"]);
        assert!(!is_url_allowed("https://evil.com/", &policy));
        assert!(!is_url_allowed("https://notexample.com/", &policy));
        assert!(!is_url_allowed("https://example.com.evil.net/", &policy));
    }

    #[test]
    fn allow_list_rejects_bad_schemes_and_malformed_urls() {
        let policy = allow(&["example.com"]);
        assert!(!is_url_allowed("ftp://example.com/", &policy));
        assert!(!is_url_allowed("file:///etc/passwd", &policy));
        assert!(!is_url_allowed("not a url", &policy));
        assert!(!is_url_allowed("", &policy));
    }

    #[test]
    fn allow_list_rejects_private_and_loopback_hosts() {
        let policy = allow(&["example.com", "127.0.0.1", "10.0.0.8"]);
        assert!(!is_url_allowed("http://localhost/", &policy));
        assert!(!is_url_allowed("http://127.0.0.1/", &policy));
        assert!(!is_url_allowed("http://10.0.0.8/", &policy));
        assert!(!is_url_allowed("http://192.168.1.4/", &policy));
        assert!(!is_url_allowed("http://172.16.3.2/", &policy));
        assert!(!is_url_allowed("http://169.254.1.1/", &policy));
        assert!(!is_url_allowed("http://[::1]/", &policy));
        assert!(!is_url_allowed("http://[fc00::1]/", &policy));
        assert!(!is_url_allowed("http://[fe80::1]/", &policy));
    }

    #[test]
    fn blocked_policy_allows_nothing() {
        assert!(!is_url_allowed("https://example.com/", &NetworkPolicy::Blocked));
    }

    #[test]
    fn unrestricted_policy_allows_wellformed_http() {
        assert!(is_url_allowed("https://anything.example/", &NetworkPolicy::Unrestricted));
        assert!(!is_url_allowed("ftp://anything.example/", &NetworkPolicy::Unrestricted));
    }
}
