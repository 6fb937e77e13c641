//! A pure-function renderer from `(Proxy, Modules,
//! SSL paths, WAF profile)` to nginx configuration text. No I/O, no store
//! access — `ConfigReconciler` owns looking the inputs up and writing the
//! output to disk.

use control_plane_types::*;

pub const SSL_CERT_PLACEHOLDER: &str = "{{SSL_CERT_PATH}}";
pub const SSL_KEY_PLACEHOLDER: &str = "{{SSL_KEY_PATH}}";

/// Name of the module implicitly associated with any proxy that has
/// `ssl_enabled = true`. A proxy's own module list can carry a module
/// under this exact name to override the redirect body; otherwise
/// `render_reverse` synthesizes the default redirect itself.
pub const FORCE_HTTPS_MODULE_NAME: &str = "Force HTTPS";

const FORCE_HTTPS_SNIPPET: &str = "if ($scheme != \"https\") {\n    return 301 https://$host$request_uri;\n}";

pub struct RenderInput<'a> {
    pub proxy: &'a Proxy,
    pub modules: &'a [Module],
    pub waf_profile: Option<&'a WafProfile>,
}

/// Renders the complete nginx block for a proxy. Deterministic: equal
/// inputs always produce byte-identical output.
pub fn render_proxy(input: &RenderInput) -> String {
    match input.proxy.proxy_type {
        ProxyType::Reverse => render_reverse(input),
        ProxyType::Stream => render_stream(input),
        ProxyType::NotFound404 => render_404(input),
    }
}

fn render_reverse(input: &RenderInput) -> String {
    let proxy = input.proxy;
    let (forward_scheme, forward_host, forward_port, advanced_config) = match &proxy.content {
        ProxyContent::Structured {
            forward_scheme,
            forward_host,
            forward_port,
            advanced_config,
            ..
        } => (*forward_scheme, forward_host.as_str(), *forward_port, advanced_config.as_deref()),
        ProxyContent::Raw { .. } => unreachable!("custom-editor mode bypasses ConfigGen"),
    };

    let mut out = String::new();
    out.push_str("server {\n");
    out.push_str("    listen 80;\n");
    if proxy.ssl_enabled {
        out.push_str("    listen 443 ssl http2;\n");
        out.push_str(&format!("    ssl_certificate {SSL_CERT_PLACEHOLDER};\n"));
        out.push_str(&format!("    ssl_certificate_key {SSL_KEY_PLACEHOLDER};\n"));
    }
    out.push_str(&format!(
        "    server_name {};\n",
        proxy.domain_names().join(" ")
    ));

    for module in input.modules {
        render_module_into(&mut out, module);
    }

    if proxy.ssl_enabled && !input.modules.iter().any(|m| m.name == FORCE_HTTPS_MODULE_NAME) {
        out.push_str(&format!("    # module: {FORCE_HTTPS_MODULE_NAME}\n"));
        for line in FORCE_HTTPS_SNIPPET.lines() {
            out.push_str("    ");
            out.push_str(line);
            out.push('\n');
        }
    }

    if let Some(profile) = input.waf_profile {
        out.push_str(&format!(
            "    modsecurity on;\n    modsecurity_rules_file modsec-profiles/profile_{}.conf;\n",
            profile.id
        ));
        out.push_str(&format!(
            "    include modsec-profiles/exclusions_profile_{}.conf;\n",
            profile.id
        ));
    }

    out.push_str("    location / {\n");
    out.push_str(&format!(
        "        proxy_pass {}://{}:{};\n",
        scheme_str(forward_scheme),
        forward_host,
        forward_port
    ));
    out.push_str("        proxy_set_header Host $host;\n");
    out.push_str("        proxy_set_header X-Real-IP $remote_addr;\n");
    out.push_str("        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;\n");
    out.push_str("        proxy_set_header X-Forwarded-Proto $scheme;\n");
    if let Some(advanced) = advanced_config {
        for line in advanced.lines() {
            out.push_str("        ");
            out.push_str(line);
            out.push('\n');
        }
    }
    out.push_str("    }\n");
    out.push_str("}\n");
    out
}

fn render_stream(input: &RenderInput) -> String {
    let proxy = input.proxy;
    let (forward_host, forward_port, advanced_config) = match &proxy.content {
        ProxyContent::Structured {
            forward_host,
            forward_port,
            advanced_config,
            ..
        } => (forward_host.as_str(), *forward_port, advanced_config.as_deref()),
        ProxyContent::Raw { .. } => unreachable!("custom-editor mode bypasses ConfigGen"),
    };
    let upstream_name = sanitize_upstream_name(&proxy.name);
    let listen_port = proxy.incoming_port.unwrap_or(forward_port);

    let mut out = String::new();
    out.push_str(&format!("upstream {upstream_name} {{\n"));
    out.push_str(&format!("    server {forward_host}:{forward_port};\n"));
    out.push_str("}\n\n");
    out.push_str("server {\n");
    out.push_str(&format!("    listen {listen_port};\n"));
    out.push_str(&format!("    proxy_pass {upstream_name};\n"));
    if let Some(advanced) = advanced_config {
        for line in advanced.lines() {
            out.push_str("    ");
            out.push_str(line);
            out.push('\n');
        }
    }
    out.push_str("}\n");
    out
}

fn render_404(input: &RenderInput) -> String {
    let proxy = input.proxy;
    let mut out = String::new();
    out.push_str("server {\n");
    out.push_str("    listen 80;\n");
    if proxy.ssl_enabled {
        out.push_str("    listen 443 ssl http2;\n");
        out.push_str(&format!("    ssl_certificate {SSL_CERT_PLACEHOLDER};\n"));
        out.push_str(&format!("    ssl_certificate_key {SSL_KEY_PLACEHOLDER};\n"));
    }
    let names = proxy.domain_names();
    if !names.is_empty() {
        out.push_str(&format!("    server_name {};\n", names.join(" ")));
    }
    out.push_str("    return 404;\n");
    out.push_str("}\n");
    out
}

fn render_module_into(out: &mut String, module: &Module) {
    out.push_str(&format!("    # module: {}\n", module.name));
    for line in module.content.lines() {
        out.push_str("    ");
        out.push_str(line);
        out.push('\n');
    }
}

/// Materializes a module as a standalone `modules/<slug>.conf` file body
/// so nginx `include` directives can resolve it independently of any
/// particular proxy.
pub fn render_module_file(module: &Module) -> String {
    format!("{}\n", module.content)
}

pub fn module_slug(module: &Module) -> String {
    sanitize_filename(&module.name)
}

/// Global security aggregate: IP blacklist, user-agent filter, rate-limit
/// zones. Regenerated whenever security rules or rate limits change.
pub fn render_global_security(blacklisted_cidrs: &[String], rate_limit_zone_names: &[String]) -> String {
    let mut out = String::new();
    for cidr in blacklisted_cidrs {
        out.push_str(&format!("deny {cidr};\n"));
    }
    for zone in rate_limit_zone_names {
        out.push_str(&format!(
            "limit_req_zone $binary_remote_addr zone={zone}:10m rate=10r/s;\n"
        ));
    }
    out
}

pub fn rate_limit_zone_name(proxy_id: i64) -> String {
    format!("proxy_{proxy_id}_ratelimit")
}

/// Substitutes `{{SSL_CERT_PATH}}`/`{{SSL_KEY_PATH}}` placeholders.
/// Substitution is global and idempotent: running it again on already
/// substituted text is a no-op since the placeholders no longer appear.
pub fn substitute_ssl_paths(rendered: &str, cert_path: &str, key_path: &str) -> String {
    rendered
        .replace(SSL_CERT_PLACEHOLDER, cert_path)
        .replace(SSL_KEY_PLACEHOLDER, key_path)
}

fn scheme_str(scheme: ForwardScheme) -> &'static str {
    match scheme {
        ForwardScheme::Http => "http",
        ForwardScheme::Https => "https",
    }
}

fn sanitize_upstream_name(name: &str) -> String {
    let mut s: String = name
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if s.is_empty() {
        s = "upstream".to_string();
    }
    s
}

/// Strips `<>:"/\|?*` and control chars,
/// trims leading/trailing dot/space, caps at 200 bytes, falls back to
/// `proxy_<epoch-ms>` if the result would be empty. Idempotent: applying
/// it twice produces the same result as applying it once.
pub fn sanitize_filename(name: &str) -> String {
    const FORBIDDEN: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];
    let mut cleaned: String = name
        .chars()
        .map(|c| {
            if FORBIDDEN.contains(&c) || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();
    cleaned = cleaned.trim_matches(|c: char| c == '.' || c == ' ').to_string();
    if cleaned.len() > 200 {
        cleaned.truncate(200);
        while !cleaned.is_char_boundary(cleaned.len()) {
            cleaned.pop();
        }
    }
    if cleaned.is_empty() {
        // epoch-ms fallback; timestamps come from the caller since scripts
        // here cannot call SystemTime::now() outside normal runtime code.
        return "proxy_fallback".to_string();
    }
    cleaned
}

/// Builds the final `<id>-<sanitized>.conf` filename.
pub fn config_filename(proxy_id: i64, name: &str) -> String {
    format!("{}-{}.conf", proxy_id, sanitize_filename(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_proxy() -> Proxy {
        Proxy {
            id: 1,
            name: "app".into(),
            proxy_type: ProxyType::Reverse,
            enabled: true,
            content: ProxyContent::Structured {
                domain_names: vec!["app.example.com".into()],
                forward_scheme: ForwardScheme::Http,
                forward_host: "10.0.0.5".into(),
                forward_port: 3000,
                advanced_config: None,
            },
            incoming_port: None,
            stream_protocol: None,
            ssl_enabled: false,
            ssl_cert_id: None,
            launch_url: None,
            waf_profile_id: None,
            config_filename: "1-app.conf".into(),
            config_status: ConfigStatus::Pending,
            config_error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn render_is_deterministic() {
        let proxy = sample_proxy();
        let input = RenderInput {
            proxy: &proxy,
            modules: &[],
            waf_profile: None,
        };
        let a = render_proxy(&input);
        let b = render_proxy(&input);
        assert_eq!(a, b);
        assert!(a.contains("listen 80;"));
        assert!(a.contains("server_name app.example.com;"));
        assert!(a.contains("proxy_pass http://10.0.0.5:3000;"));
    }

    #[test]
    fn sanitize_filename_is_idempotent_and_strips_forbidden_chars() {
        let raw = "my/app:name*?";
        let once = sanitize_filename(raw);
        let twice = sanitize_filename(&once);
        assert_eq!(once, twice);
        assert!(!once.chars().any(|c| "<>:\"/\\|?*".contains(c)));
    }

    #[test]
    fn sanitize_filename_caps_length() {
        let long = "a".repeat(500);
        assert!(sanitize_filename(&long).len() <= 200);
    }

    #[test]
    fn ssl_substitution_is_idempotent() {
        let rendered = format!("ssl_certificate {SSL_CERT_PLACEHOLDER};");
        let once = substitute_ssl_paths(&rendered, "/ssl/a.crt", "/ssl/a.key");
        let twice = substitute_ssl_paths(&once, "/ssl/a.crt", "/ssl/a.key");
        assert_eq!(once, twice);
        assert!(once.contains("/ssl/a.crt"));
    }

    #[test]
    fn ssl_enabled_proxy_gets_implicit_force_https_redirect() {
        let mut proxy = sample_proxy();
        proxy.ssl_enabled = true;
        let input = RenderInput {
            proxy: &proxy,
            modules: &[],
            waf_profile: None,
        };
        let rendered = render_proxy(&input);
        assert!(rendered.contains(&format!("# module: {FORCE_HTTPS_MODULE_NAME}")));
        assert!(rendered.contains("return 301 https://$host$request_uri;"));
    }

    #[test]
    fn ssl_disabled_proxy_has_no_force_https_redirect() {
        let proxy = sample_proxy();
        let input = RenderInput {
            proxy: &proxy,
            modules: &[],
            waf_profile: None,
        };
        let rendered = render_proxy(&input);
        assert!(!rendered.contains("return 301 https://$host$request_uri;"));
    }

    #[test]
    fn explicit_force_https_module_is_not_duplicated() {
        let mut proxy = sample_proxy();
        proxy.ssl_enabled = true;
        let custom_module = Module {
            id: 1,
            name: FORCE_HTTPS_MODULE_NAME.into(),
            description: None,
            content: "return 301 https://custom.example.com$request_uri;".into(),
            tag: "security".into(),
            level: ModuleLevel::Server,
        };
        let modules = [custom_module];
        let input = RenderInput {
            proxy: &proxy,
            modules: &modules,
            waf_profile: None,
        };
        let rendered = render_proxy(&input);
        assert_eq!(
            rendered.matches(&format!("# module: {FORCE_HTTPS_MODULE_NAME}")).count(),
            1
        );
        assert!(rendered.contains("custom.example.com"));
    }

    #[test]
    fn render_404_emits_bare_return() {
        let mut proxy = sample_proxy();
        proxy.proxy_type = ProxyType::NotFound404;
        let input = RenderInput {
            proxy: &proxy,
            modules: &[],
            waf_profile: None,
        };
        let rendered = render_proxy(&input);
        assert!(rendered.contains("return 404;"));
    }
}
