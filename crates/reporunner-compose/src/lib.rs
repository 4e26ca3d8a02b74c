//! Compose-manifest parsing for multi-service builds (§4.3): the service
//! graph, the port-mapping parser (`${VAR:-default}`/`${VAR}` resolution,
//! `/tcp`/`/udp` stripping), and environment parsing in both its map and
//! `KEY=value` list forms.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// Root of a parsed compose manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposeManifest {
    pub services: BTreeMap<String, ComposeService>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposeService {
    pub image: Option<String>,
    pub build: Option<BuildSpec>,
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub expose: Vec<String>,
    pub environment: Option<EnvironmentSpec>,
    #[serde(default)]
    pub profiles: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BuildSpec {
    ContextOnly(String),
    Detailed {
        context: String,
        dockerfile: Option<String>,
    },
}

/// `environment:` accepts either a map (`KEY: value`) or a list
/// (`- KEY=value`) in a compose manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvironmentSpec {
    Map(BTreeMap<String, Option<String>>),
    List(Vec<String>),
}

impl EnvironmentSpec {
    pub fn to_map(&self) -> BTreeMap<String, String> {
        match self {
            EnvironmentSpec::Map(m) => m
                .iter()
                .map(|(k, v)| (k.clone(), v.clone().unwrap_or_default()))
                .collect(),
            EnvironmentSpec::List(list) => list
                .iter()
                .filter_map(|entry| entry.split_once('=').map(|(k, v)| (k.to_string(), v.to_string())))
                .collect(),
        }
    }
}

pub fn parse(yaml: &str) -> anyhow::Result<ComposeManifest> {
    Ok(serde_yaml::from_str(yaml)?)
}

pub fn serialize(manifest: &ComposeManifest) -> anyhow::Result<String> {
    Ok(serde_yaml::to_string(manifest)?)
}

/// Where a resolved service's image comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceSource {
    External { image: String },
    Build {
        context: String,
        dockerfile: Option<String>,
        tag: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedService {
    pub name: String,
    pub source: ServiceSource,
    pub ports: Vec<u16>,
    pub environment: BTreeMap<String, String>,
}

/// Service names that default to port 80 when neither `ports` nor `expose`
/// resolves to anything (§4.3).
pub const WEB_SERVICE_NAMES: [&str; 7] = ["web", "app", "frontend", "api", "server", "nginx", "apache"];

/// Walk the service graph, skip profile-gated services, carry through
/// external images, assign build tags for the rest, and resolve ports.
pub fn resolve_services(
    manifest: &ComposeManifest,
    run_id: &str,
    vars: &HashMap<String, String>,
) -> Vec<ResolvedService> {
    let mut out = Vec::new();

    for (name, svc) in &manifest.services {
        if !svc.profiles.is_empty() {
            continue;
        }

        let source = match &svc.image {
            Some(image) => ServiceSource::External {
                image: image.clone(),
            },
            None => {
                let (context, dockerfile) = match &svc.build {
                    Some(BuildSpec::ContextOnly(ctx)) => (ctx.clone(), None),
                    Some(BuildSpec::Detailed { context, dockerfile }) => {
                        (context.clone(), dockerfile.clone())
                    }
                    None => (".".to_string(), None),
                };
                ServiceSource::Build {
                    context,
                    dockerfile,
                    tag: format!("{run_id}-{name}:latest"),
                }
            }
        };

        let mut ports: Vec<u16> = svc
            .ports
            .iter()
            .filter_map(|p| parse_port_mapping(p, vars))
            .collect();
        if ports.is_empty() {
            ports = svc
                .expose
                .iter()
                .filter_map(|p| parse_port_mapping(p, vars))
                .collect();
        }
        if ports.is_empty() && WEB_SERVICE_NAMES.contains(&name.as_str()) {
            ports.push(80);
        }

        let environment = svc
            .environment
            .as_ref()
            .map(EnvironmentSpec::to_map)
            .unwrap_or_default();

        out.push(ResolvedService {
            name: name.clone(),
            source,
            ports,
            environment,
        });
    }

    out
}

/// Parse one `ports` or `expose` entry into the resolved container-side
/// port. A `ports` entry is split on the top-level `:` (one not occurring
/// inside `${…}`); the container-side half (right of `:`) is used. An
/// `expose` entry has no host half to split off. Either way the result is
/// stripped of a trailing `/tcp` or `/udp`, then resolved against `vars`.
/// Returns `None` if the container half references a variable that isn't
/// in `vars` and has no default.
pub fn parse_port_mapping(raw: &str, vars: &HashMap<String, String>) -> Option<u16> {
    let container = match split_top_level_colon(raw) {
        Some((_host, container)) => container,
        None => raw.to_string(),
    };
    let stripped = strip_protocol_suffix(&container);
    let resolved = resolve_placeholders(&stripped, vars)?;
    resolved.trim().parse::<u16>().ok()
}

fn strip_protocol_suffix(s: &str) -> String {
    s.strip_suffix("/tcp")
        .or_else(|| s.strip_suffix("/udp"))
        .unwrap_or(s)
        .to_string()
}

/// Split `s` on the first top-level `:` — one that isn't nested inside a
/// `${…}` placeholder — returning `(left, right)`.
fn split_top_level_colon(s: &str) -> Option<(String, String)> {
    let chars: Vec<char> = s.chars().collect();
    let mut depth = 0i32;
    for (idx, &c) in chars.iter().enumerate() {
        match c {
            '{' => depth += 1,
            '}' => depth -= 1,
            ':' if depth == 0 => {
                let left: String = chars[..idx].iter().collect();
                let right: String = chars[idx + 1..].iter().collect();
                return Some((left, right));
            }
            _ => {}
        }
    }
    None
}

/// Resolve every `${VAR}` / `${VAR:-default}` placeholder in `s` against
/// `vars`. Returns `None` if any placeholder has neither a binding in
/// `vars` nor a literal default.
pub fn resolve_placeholders(s: &str, vars: &HashMap<String, String>) -> Option<String> {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::new();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '$' && chars.get(i + 1) == Some(&'{') {
            let mut depth = 1;
            let mut j = i + 2;
            while j < chars.len() && depth > 0 {
                match chars[j] {
                    '{' => depth += 1,
                    '}' => {
                        depth -= 1;
                        if depth == 0 {
                            break;
                        }
                    }
                    _ => {}
                }
                j += 1;
            }
            if j >= chars.len() {
                return None;
            }
            let inner: String = chars[i + 2..j].iter().collect();
            let (name, default) = match inner.split_once(":-") {
                Some((n, d)) => (n, Some(d)),
                None => (inner.as_str(), None),
            };
            match vars.get(name) {
                Some(v) => out.push_str(v),
                None => match default {
                    Some(d) => out.push_str(d),
                    None => return None,
                },
            }
            i = j + 1;
        } else {
            out.push(chars[i]);
            i += 1;
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn parses_simple_host_container_mapping() {
        assert_eq!(parse_port_mapping("3100:3100", &HashMap::new()), Some(3100));
    }

    #[test]
    fn strips_tcp_and_udp_suffix() {
        assert_eq!(parse_port_mapping("53:53/udp", &HashMap::new()), Some(53));
        assert_eq!(parse_port_mapping("80:8080/tcp", &HashMap::new()), Some(8080));
    }

    #[test]
    fn resolves_default_form_variable() {
        assert_eq!(
            parse_port_mapping("${PORT:-3000}:3000", &HashMap::new()),
            Some(3000)
        );
        assert_eq!(
            parse_port_mapping("8080:${TARGET:-9090}", &HashMap::new()),
            Some(9090)
        );
    }

    #[test]
    fn resolves_bound_variable_over_default() {
        let v = vars(&[("TARGET", "4200")]);
        assert_eq!(parse_port_mapping("8080:${TARGET}", &v), Some(4200));
    }

    #[test]
    fn rejects_unresolvable_variable() {
        assert_eq!(parse_port_mapping("8080:${MISSING}", &HashMap::new()), None);
    }

    #[test]
    fn expose_entry_has_no_host_half() {
        assert_eq!(parse_port_mapping("9000", &HashMap::new()), Some(9000));
    }

    #[test]
    fn colon_inside_placeholder_is_not_a_split_point() {
        // The only top-level ':' is the one separating host from container;
        // the ':-' inside ${..} must not be treated as the split.
        assert_eq!(
            parse_port_mapping("${HOST_PORT:-8080}:3000", &HashMap::new()),
            Some(3000)
        );
    }

    #[test]
    fn environment_map_form() {
        let spec = EnvironmentSpec::Map(BTreeMap::from([
            ("FOO".to_string(), Some("bar".to_string())),
            ("EMPTY".to_string(), None),
        ]));
        let map = spec.to_map();
        assert_eq!(map.get("FOO"), Some(&"bar".to_string()));
        assert_eq!(map.get("EMPTY"), Some(&"".to_string()));
    }

    #[test]
    fn environment_list_form() {
        let spec = EnvironmentSpec::List(vec!["FOO=bar".to_string(), "BAZ=qux".to_string()]);
        let map = spec.to_map();
        assert_eq!(map.get("FOO"), Some(&"bar".to_string()));
        assert_eq!(map.get("BAZ"), Some(&"qux".to_string()));
    }

    #[test]
    fn resolve_services_skips_profile_gated_services() {
        let yaml = r#"
services:
  web:
    build:
      context: .
    ports:
      - "3100:3100"
  debug:
    image: busybox
    profiles: ["debug"]
"#;
        let manifest = parse(yaml).expect("parse");
        let resolved = resolve_services(&manifest, "r1", &HashMap::new());
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].name, "web");
    }

    #[test]
    fn resolve_services_defaults_web_name_to_port_80() {
        let yaml = r#"
services:
  web:
    image: nginx:latest
"#;
        let manifest = parse(yaml).expect("parse");
        let resolved = resolve_services(&manifest, "r1", &HashMap::new());
        assert_eq!(resolved[0].ports, vec![80]);
    }

    #[test]
    fn resolve_services_assigns_build_tag() {
        let yaml = r#"
services:
  api:
    build:
      context: ./api
      dockerfile: Dockerfile.api
    ports:
      - "3000:3000"
  db:
    image: postgres:16
"#;
        let manifest = parse(yaml).expect("parse");
        let resolved = resolve_services(&manifest, "r9", &HashMap::new());
        let api = resolved.iter().find(|s| s.name == "api").unwrap();
        match &api.source {
            ServiceSource::Build { tag, dockerfile, .. } => {
                assert_eq!(tag, "r9-api:latest");
                assert_eq!(dockerfile.as_deref(), Some("Dockerfile.api"));
            }
            _ => panic!("expected build source"),
        }
        let db = resolved.iter().find(|s| s.name == "db").unwrap();
        assert_eq!(db.source, ServiceSource::External { image: "postgres:16".to_string() });
    }

    #[test]
    fn manifest_round_trips_through_yaml() {
        let yaml = r#"
services:
  web:
    build:
      context: .
    ports:
      - "3100:3100"
"#;
        let parsed = parse(yaml).expect("parse");
        let serialized = serialize(&parsed).expect("serialize");
        let reparsed = parse(&serialized).expect("reparse");
        assert_eq!(parsed.services.len(), reparsed.services.len());
        assert_eq!(
            parsed.services["web"].ports,
            reparsed.services["web"].ports
        );
    }

    proptest::proptest! {
        #[test]
        fn port_mapping_never_exceeds_u16(port in 1u16..=65535) {
            let raw = format!("3000:{port}");
            let resolved = parse_port_mapping(&raw, &HashMap::new());
            proptest::prop_assert_eq!(resolved, Some(port));
        }
    }
}
