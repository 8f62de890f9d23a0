use std::collections::BTreeMap;
use std::time::Duration;

use docker_compose_types::{
    Command, Compose, DependsOnOptions, Entrypoint, Environment, HealthcheckTest, MapOrEmpty,
    Ports, Service, SingleValue, Volumes,
};
use indexmap::IndexMap;

use crate::error::{HosterError, HosterResult};

/// A parsed, normalized composition: what the planner consumes.
///
/// Only the behaviors the platform materializes are kept (services,
/// named networks and volumes, the `depends_on` DAG, port mappings,
/// environment, health probes, restart policy, resource limits).
/// Unsupported composition keys are ignored.
#[derive(Debug, Clone)]
pub struct CompositionSpec {
    pub services: Vec<ServiceSpec>,
    pub networks: Vec<String>,
    pub volumes: Vec<VolumeSpec>,
}

#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub name: String,
    pub image: String,
    pub command: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
    pub environment: IndexMap<String, String>,
    pub ports: Vec<PortMapping>,
    pub mounts: Vec<MountSpec>,
    pub depends_on: Vec<String>,
    pub restart: Option<String>,
    pub limits: ResourceLimits,
    pub health: Option<HealthProbe>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub container_port: u16,
    pub host_port: Option<u16>,
    pub protocol: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountSpec {
    Bind {
        source: String,
        target: String,
        read_only: bool,
    },
    Named {
        volume: String,
        target: String,
        read_only: bool,
    },
    Tmpfs {
        target: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceLimits {
    pub cpus: Option<f64>,
    pub memory_bytes: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthProbe {
    pub test: Vec<String>,
    pub interval: Duration,
    pub timeout: Duration,
    pub retries: u32,
    pub start_period: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpec {
    pub name: String,
    pub external: bool,
}

/// Parse composition text into a normalized spec.
///
/// Rejects compositions with no services; everything else the parser
/// does not understand is dropped, not refused.
pub fn parse(text: &str) -> HosterResult<CompositionSpec> {
    let compose: Compose = serde_yaml::from_str(text)
        .map_err(|e| HosterError::Configuration(format!("composition does not parse: {e}")))?;

    // Typed structs drop keys they don't model; resource limits live
    // under deploy.resources which we read from the raw document.
    let raw: serde_yaml::Value = serde_yaml::from_str(text)
        .map_err(|e| HosterError::Configuration(format!("composition does not parse: {e}")))?;

    let mut services = Vec::new();
    for (name, service) in &compose.services.0 {
        let Some(service) = service else {
            return Err(HosterError::Configuration(format!(
                "service {name} has no definition"
            )));
        };
        services.push(normalize_service(name, service, &raw)?);
    }

    if services.is_empty() {
        return Err(HosterError::Configuration(
            "composition declares no services".into(),
        ));
    }

    let networks = compose.networks.0.keys().cloned().collect();

    let volumes = compose
        .volumes
        .0
        .iter()
        .map(|(name, value)| VolumeSpec {
            name: name.clone(),
            external: match value {
                MapOrEmpty::Map(vol) => vol.external.is_some(),
                MapOrEmpty::Empty => false,
            },
        })
        .collect();

    Ok(CompositionSpec {
        services,
        networks,
        volumes,
    })
}

impl CompositionSpec {
    /// Look up a service by name.
    #[must_use]
    pub fn service(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Order services so that every dependency comes before its
    /// dependents (Kahn's algorithm). Ties break lexicographically
    /// by service name; a cycle is a configuration error.
    pub fn ordered_services(&self) -> HosterResult<Vec<&ServiceSpec>> {
        let mut in_degree: BTreeMap<&str, usize> = self
            .services
            .iter()
            .map(|s| (s.name.as_str(), 0))
            .collect();
        let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

        for service in &self.services {
            for dep in &service.depends_on {
                if !in_degree.contains_key(dep.as_str()) {
                    return Err(HosterError::Configuration(format!(
                        "service {} depends on unknown service {dep}",
                        service.name
                    )));
                }
                *in_degree.get_mut(service.name.as_str()).unwrap() += 1;
                dependents
                    .entry(dep.as_str())
                    .or_default()
                    .push(service.name.as_str());
            }
        }

        // BTreeMap iteration keeps the ready set lexicographic.
        let mut ready: Vec<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(name, _)| *name)
            .collect();
        let mut ordered = Vec::with_capacity(self.services.len());

        while let Some(name) = ready.first().copied() {
            ready.remove(0);
            ordered.push(self.service(name).expect("service exists"));

            for &dependent in dependents.get(name).into_iter().flatten() {
                let degree = in_degree.get_mut(dependent).unwrap();
                *degree -= 1;
                if *degree == 0 {
                    let pos = ready.partition_point(|n| *n < dependent);
                    ready.insert(pos, dependent);
                }
            }
        }

        if ordered.len() != self.services.len() {
            return Err(HosterError::Configuration(
                "dependency cycle in composition".into(),
            ));
        }
        Ok(ordered)
    }
}

/// Substitute `${VAR}` tokens with values from the variable map.
///
/// Pure: same input and map always produce the same output. Tokens
/// with no matching variable are left intact.
#[must_use]
pub fn substitute_variables(input: &str, variables: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match variables.get(name) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push_str("${");
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str("${");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn normalize_service(
    name: &str,
    service: &Service,
    raw: &serde_yaml::Value,
) -> HosterResult<ServiceSpec> {
    let image = service
        .image
        .clone()
        .ok_or_else(|| HosterError::Configuration(format!("service {name} has no image")))?;

    let command = service.command.as_ref().map(|c| match c {
        Command::Simple(s) => shell_words(s),
        Command::Args(args) => args.clone(),
    });

    let entrypoint = service.entrypoint.as_ref().map(|e| match e {
        Entrypoint::Simple(s) => shell_words(s),
        Entrypoint::List(items) => items.clone(),
    });

    let environment = normalize_environment(&service.environment);
    let ports = normalize_ports(name, &service.ports)?;
    let mounts = service
        .volumes
        .iter()
        .map(normalize_mount)
        .collect::<HosterResult<Vec<_>>>()?;

    let depends_on = match &service.depends_on {
        DependsOnOptions::Simple(names) => names.clone(),
        DependsOnOptions::Conditional(map) => map.keys().cloned().collect(),
    };

    let health = service.healthcheck.as_ref().and_then(normalize_healthcheck);

    Ok(ServiceSpec {
        name: name.to_string(),
        image,
        command,
        entrypoint,
        environment,
        ports,
        mounts,
        depends_on,
        restart: service.restart.clone(),
        limits: resource_limits(name, raw),
        health,
    })
}

fn normalize_environment(env: &Environment) -> IndexMap<String, String> {
    match env {
        Environment::List(items) => items
            .iter()
            .map(|item| match item.split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (item.clone(), String::new()),
            })
            .collect(),
        Environment::KvPair(map) => map
            .iter()
            .map(|(k, v)| {
                let value = v.as_ref().map_or_else(String::new, single_value_string);
                (k.clone(), value)
            })
            .collect(),
    }
}

fn single_value_string(value: &SingleValue) -> String {
    match value {
        SingleValue::String(s) => s.clone(),
        SingleValue::Bool(b) => b.to_string(),
        SingleValue::Unsigned(u) => u.to_string(),
        SingleValue::Signed(i) => i.to_string(),
        SingleValue::Float(f) => f.to_string(),
    }
}

fn normalize_ports(name: &str, ports: &Ports) -> HosterResult<Vec<PortMapping>> {
    match ports {
        Ports::Short(entries) => entries
            .iter()
            .map(|entry| parse_short_port(name, entry))
            .collect(),
        Ports::Long(entries) => Ok(entries
            .iter()
            .map(|port| PortMapping {
                container_port: port.target,
                host_port: match &port.published {
                    Some(docker_compose_types::PublishedPort::Single(p)) => Some(*p),
                    _ => None,
                },
                protocol: port.protocol.clone().unwrap_or_else(|| "tcp".into()),
            })
            .collect()),
    }
}

/// Short port syntax: `80`, `8080:80`, `127.0.0.1:8080:80`, `80/udp`.
fn parse_short_port(service: &str, entry: &str) -> HosterResult<PortMapping> {
    let (spec, protocol) = entry
        .split_once('/')
        .map_or((entry, "tcp"), |(spec, proto)| (spec, proto));

    let parts: Vec<&str> = spec.split(':').collect();
    let bad = || {
        HosterError::Configuration(format!("service {service} has invalid port mapping {entry}"))
    };

    let (host, container) = match parts.as_slice() {
        [container] => (None, *container),
        [host, container] => (Some(*host), *container),
        [_ip, host, container] => (Some(*host), *container),
        _ => return Err(bad()),
    };

    Ok(PortMapping {
        container_port: container.parse().map_err(|_| bad())?,
        host_port: host.map(str::parse).transpose().map_err(|_| bad())?,
        protocol: protocol.to_string(),
    })
}

fn normalize_mount(volume: &Volumes) -> HosterResult<MountSpec> {
    match volume {
        Volumes::Simple(spec) => {
            let mut parts = spec.splitn(3, ':');
            let first = parts.next().unwrap_or_default().to_string();
            let second = parts.next();
            let mode = parts.next();
            let read_only = mode == Some("ro");

            match second {
                // Single-path form mounts an anonymous volume; treat
                // the path as both name-less volume and target.
                None => Ok(MountSpec::Named {
                    volume: String::new(),
                    target: first,
                    read_only: false,
                }),
                Some(target) if first.starts_with('/') || first.starts_with('.') => {
                    Ok(MountSpec::Bind {
                        source: first,
                        target: target.to_string(),
                        read_only,
                    })
                }
                Some(target) => Ok(MountSpec::Named {
                    volume: first,
                    target: target.to_string(),
                    read_only,
                }),
            }
        }
        Volumes::Advanced(advanced) => {
            let target = advanced.target.clone();
            match advanced._type.as_str() {
                "tmpfs" => Ok(MountSpec::Tmpfs { target }),
                "bind" => Ok(MountSpec::Bind {
                    source: advanced.source.clone().unwrap_or_default(),
                    target,
                    read_only: advanced.read_only,
                }),
                _ => Ok(MountSpec::Named {
                    volume: advanced.source.clone().unwrap_or_default(),
                    target,
                    read_only: advanced.read_only,
                }),
            }
        }
    }
}

fn normalize_healthcheck(check: &docker_compose_types::Healthcheck) -> Option<HealthProbe> {
    if check.disable {
        return None;
    }
    let test = match check.test.as_ref()? {
        HealthcheckTest::Single(cmd) => {
            vec!["CMD-SHELL".to_string(), cmd.clone()]
        }
        HealthcheckTest::Multiple(items) => items.clone(),
    };

    Some(HealthProbe {
        test,
        interval: parse_duration(check.interval.as_deref(), Duration::from_secs(30)),
        timeout: parse_duration(check.timeout.as_deref(), Duration::from_secs(10)),
        retries: u32::try_from(check.retries).unwrap_or(3),
        start_period: parse_duration(check.start_period.as_deref(), Duration::ZERO),
    })
}

/// Compose duration strings: `90s`, `2m`, `1h`, bare seconds.
fn parse_duration(raw: Option<&str>, default: Duration) -> Duration {
    let Some(raw) = raw else { return default };
    let raw = raw.trim();

    let (digits, unit) = match raw.find(|c: char| !c.is_ascii_digit()) {
        Some(pos) => raw.split_at(pos),
        None => (raw, "s"),
    };
    let Ok(value) = digits.parse::<u64>() else {
        return default;
    };

    match unit {
        "ms" => Duration::from_millis(value),
        "m" => Duration::from_secs(value * 60),
        "h" => Duration::from_secs(value * 3600),
        _ => Duration::from_secs(value),
    }
}

/// Resource limits live at `services.<name>.deploy.resources.limits`.
fn resource_limits(name: &str, raw: &serde_yaml::Value) -> ResourceLimits {
    let limits = raw
        .get("services")
        .and_then(|s| s.get(name))
        .and_then(|s| s.get("deploy"))
        .and_then(|d| d.get("resources"))
        .and_then(|r| r.get("limits"));

    let Some(limits) = limits else {
        return ResourceLimits::default();
    };

    let cpus = limits.get("cpus").and_then(|v| match v {
        serde_yaml::Value::String(s) => s.parse().ok(),
        serde_yaml::Value::Number(n) => n.as_f64(),
        _ => None,
    });

    let memory_bytes = limits
        .get("memory")
        .and_then(|v| match v {
            serde_yaml::Value::String(s) => parse_memory(s),
            serde_yaml::Value::Number(n) => n.as_i64(),
            _ => None,
        });

    ResourceLimits { cpus, memory_bytes }
}

/// Memory strings: `512M`, `2g`, `1048576b`, bare bytes.
fn parse_memory(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    let split = raw.find(|c: char| !c.is_ascii_digit()).unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let value: i64 = digits.parse().ok()?;

    let multiplier = match unit.to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" => 1024,
        "m" | "mb" => 1024 * 1024,
        "g" | "gb" => 1024 * 1024 * 1024,
        _ => return None,
    };
    Some(value * multiplier)
}

/// Minimal shell-style splitting for string-form command/entrypoint.
fn shell_words(input: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in input.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => quote = Some(c),
            None if c.is_whitespace() => {
                if !current.is_empty() {
                    words.push(std::mem::take(&mut current));
                }
            }
            None => current.push(c),
        }
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

#[cfg(test)]
mod tests {
    use super::*;

    const WORDPRESS: &str = r"
services:
  db:
    image: mysql:8.0
    environment:
      MYSQL_ROOT_PASSWORD: ${DB_ROOT_PASSWORD}
      MYSQL_DATABASE: wordpress
    volumes:
      - db-data:/var/lib/mysql
    healthcheck:
      test: ['CMD', 'mysqladmin', 'ping']
      interval: 10s
      retries: 5
  wordpress:
    image: wordpress:6
    depends_on:
      - db
    ports:
      - '80'
    environment:
      WORDPRESS_DB_PASSWORD: ${DB_PASSWORD}
volumes:
  db-data:
";

    #[test]
    fn parses_services_and_volumes() {
        let spec = parse(WORDPRESS).unwrap();

        assert_eq!(spec.services.len(), 2);
        assert_eq!(spec.volumes, vec![VolumeSpec {
            name: "db-data".into(),
            external: false,
        }]);

        let db = spec.service("db").unwrap();
        assert_eq!(db.image, "mysql:8.0");
        assert_eq!(
            db.environment.get("MYSQL_ROOT_PASSWORD").unwrap(),
            "${DB_ROOT_PASSWORD}"
        );
        assert_eq!(db.mounts, vec![MountSpec::Named {
            volume: "db-data".into(),
            target: "/var/lib/mysql".into(),
            read_only: false,
        }]);

        let health = db.health.as_ref().unwrap();
        assert_eq!(health.test, vec!["CMD", "mysqladmin", "ping"]);
        assert_eq!(health.interval, Duration::from_secs(10));
        assert_eq!(health.retries, 5);
    }

    #[test]
    fn dependency_order_puts_db_first() {
        let spec = parse(WORDPRESS).unwrap();
        let order: Vec<&str> = spec
            .ordered_services()
            .unwrap()
            .iter()
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(order, vec!["db", "wordpress"]);
    }

    #[test]
    fn order_ties_break_lexicographically() {
        let spec = parse(
            "services:\n  zeta:\n    image: a\n  alpha:\n    image: b\n  mid:\n    image: c\n",
        )
        .unwrap();
        let order: Vec<&str> = spec
            .ordered_services()
            .unwrap()
            .iter()
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(order, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn cycle_is_configuration_error() {
        let text = "
services:
  a:
    image: x
    depends_on: [b]
  b:
    image: y
    depends_on: [a]
";
        let err = parse(text).unwrap().ordered_services().unwrap_err();
        assert_eq!(err.kind(), "configuration-error");
    }

    #[test]
    fn empty_composition_rejected() {
        assert!(parse("services: {}\n").is_err());
    }

    #[test]
    fn short_port_forms() {
        let p = parse_short_port("web", "80").unwrap();
        assert_eq!(p.container_port, 80);
        assert_eq!(p.host_port, None);
        assert_eq!(p.protocol, "tcp");

        let p = parse_short_port("web", "8080:80").unwrap();
        assert_eq!(p.host_port, Some(8080));

        let p = parse_short_port("web", "127.0.0.1:53:53/udp").unwrap();
        assert_eq!(p.container_port, 53);
        assert_eq!(p.host_port, Some(53));
        assert_eq!(p.protocol, "udp");
    }

    #[test]
    fn substitution_is_pure_and_total() {
        let mut vars = BTreeMap::new();
        vars.insert("DB_PASSWORD".to_string(), "s3cr3t".to_string());

        let once = substitute_variables("pass=${DB_PASSWORD} keep=${MISSING}", &vars);
        let twice = substitute_variables("pass=${DB_PASSWORD} keep=${MISSING}", &vars);
        assert_eq!(once, "pass=s3cr3t keep=${MISSING}");
        assert_eq!(once, twice);
    }

    #[test]
    fn unterminated_token_is_preserved() {
        let vars = BTreeMap::new();
        assert_eq!(substitute_variables("x=${OOPS", &vars), "x=${OOPS");
    }

    #[test]
    fn memory_strings() {
        assert_eq!(parse_memory("512M"), Some(512 * 1024 * 1024));
        assert_eq!(parse_memory("2g"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_memory("1024"), Some(1024));
        assert_eq!(parse_memory("weird"), None);
    }

    #[test]
    fn shell_words_respects_quotes() {
        assert_eq!(
            shell_words(r#"sh -c "echo hello world""#),
            vec!["sh", "-c", "echo hello world"]
        );
    }
}
