//! docker-compose dialect transformation.
//!
//! Reads the relevant subset of a compose file from a `serde_yaml::Value`
//! tree and normalizes it into a [`PodDescriptor`]. Working on the value
//! tree directly keeps the string-or-sequence fields (`entrypoint`,
//! `command`, `environment`, `build`, `healthcheck.test`) tractable without
//! a zoo of custom deserializers.

use super::model::{
    BoolVal, HealthCheckDescriptor, NumberVal, PodDescriptor, PortBindingDescriptor,
    ServiceBuildDescriptor, ServiceDescriptor, ServiceExtension, VolumeDescriptor,
};
use crate::constants::MAX_SUPPORTED_COMPOSE_VERSION;
use crate::error::{Error, Result};
use indexmap::IndexMap;
use serde_yaml::Value;
use std::path::Path;
use tracing::warn;

/// Transforms a parsed compose document into the canonical descriptor.
pub fn transform_compose(
    doc: &Value,
    file: &Path,
    default_volume_base_dir: &str,
) -> Result<PodDescriptor> {
    let mut pod = PodDescriptor::new();
    pod.file = file.to_path_buf();

    if let Some(v) = doc.get("version") {
        let version = value_to_string(v, file, ".version")?;
        let parsed: f64 = version.parse().map_err(|_| {
            Error::config(file, ".version", format!("invalid version format: {version:?}"))
        })?;
        if parsed > MAX_SUPPORTED_COMPOSE_VERSION {
            warn!("docker compose version >3 is not supported");
        }
    }

    let services = doc
        .get("services")
        .and_then(Value::as_mapping)
        .ok_or_else(|| Error::config(file, ".services", "empty"))?;

    for (key, svc) in services {
        let name = value_to_string(key, file, ".services")?;
        let pointer = format!(".services.{name}");
        let service = transform_service(svc, &name, file, &pointer, &mut pod)?;
        pod.services.insert(name, service);
    }

    if let Some(volumes) = doc.get("volumes").and_then(Value::as_mapping) {
        for (key, _) in volumes {
            let name = value_to_string(key, file, ".volumes")?;
            pod.volumes.insert(
                name.clone(),
                VolumeDescriptor {
                    source: format!("{default_volume_base_dir}/{name}"),
                    kind: "host".to_string(),
                    readonly: BoolVal::default(),
                },
            );
        }
    }

    Ok(pod)
}

fn transform_service(
    svc: &Value,
    name: &str,
    file: &Path,
    pointer: &str,
    pod: &mut PodDescriptor,
) -> Result<ServiceDescriptor> {
    let mut s = ServiceDescriptor::default();

    if let Some(ext) = svc.get("extends") {
        let ext_file = ext
            .get("file")
            .map(|v| value_to_string(v, file, &format!("{pointer}.extends.file")))
            .transpose()?
            .unwrap_or_default();
        let ext_service = ext
            .get("service")
            .map(|v| value_to_string(v, file, &format!("{pointer}.extends.service")))
            .transpose()?
            .unwrap_or_default();
        s.extends = Some(ServiceExtension {
            file: ext_file,
            service: ext_service,
        });
    }

    let image = svc
        .get("image")
        .map(|v| value_to_string(v, file, &format!("{pointer}.image")))
        .transpose()?
        .unwrap_or_default();
    let build = svc.get("build");
    if !image.is_empty() {
        // Images named in compose files live in a Docker registry unless the
        // service builds them locally.
        s.image = if build.is_none() {
            format!("docker://{image}")
        } else {
            image
        };
    }
    if let Some(b) = build {
        s.build = Some(transform_build(b, file, &format!("{pointer}.build"))?);
    }

    s.entrypoint = to_string_seq(svc.get("entrypoint"), file, &format!("{pointer}.entrypoint"))?;
    s.command = to_string_seq(svc.get("command"), file, &format!("{pointer}.command"))?;
    s.env_file = to_file_list(svc.get("env_file"), file, &format!("{pointer}.env_file"))?;
    s.environment = to_string_map(svc.get("environment"), file, &format!("{pointer}.environment"))?;

    if let Some(hostname) = svc.get("hostname") {
        let hostname = value_to_string(hostname, file, &format!("{pointer}.hostname"))?;
        if pod.hostname.is_empty() {
            pod.hostname = hostname;
        }
    }
    if let Some(domainname) = svc.get("domainname") {
        let domainname = value_to_string(domainname, file, &format!("{pointer}.domainname"))?;
        if pod.domainname.is_empty() {
            pod.domainname = domainname;
        }
    }

    if let Some(sgp) = svc.get("stop_grace_period") {
        let sgp = value_to_string(sgp, file, &format!("{pointer}.stop_grace_period"))?;
        promote_stop_grace_period(&sgp, file, pointer, pod)?;
    }

    if let Some(mounts) = svc.get("volumes") {
        s.mounts = to_volume_mounts(mounts, file, &format!("{pointer}.volumes"))?;
    }
    if let Some(ports) = svc.get("ports") {
        s.ports = expand_ports(ports, file, &format!("{pointer}.ports"))?;
    }
    if let Some(hc) = svc.get("healthcheck") {
        s.healthcheck = Some(transform_healthcheck(hc, file, &format!("{pointer}.healthcheck"))?);
    }

    // HTTP_HOST/HTTP_PORT publish a routing hint into the registry KV store.
    if let Some(http_host) = s.environment.get("HTTP_HOST") {
        let http_port = s.environment.get("HTTP_PORT").ok_or_else(|| {
            Error::config(
                file,
                format!("{pointer}.environment"),
                "HTTP_HOST without HTTP_PORT env var defined",
            )
        })?;
        let key = format!("http/{http_host}");
        let value = format!("{name}:{http_port}");
        if let Some(existing) = pod.shared_keys.get(&key) {
            warn!("shared key {key:?} already declared as {existing:?}; keeping it");
        } else {
            pod.shared_keys.insert(key, value);
        }
    }

    Ok(s)
}

fn transform_build(b: &Value, file: &Path, pointer: &str) -> Result<ServiceBuildDescriptor> {
    match b {
        Value::String(context) => Ok(ServiceBuildDescriptor {
            context: context.clone(),
            ..Default::default()
        }),
        Value::Mapping(_) => Ok(ServiceBuildDescriptor {
            context: b
                .get("context")
                .map(|v| value_to_string(v, file, &format!("{pointer}.context")))
                .transpose()?
                .unwrap_or_default(),
            dockerfile: b
                .get("dockerfile")
                .map(|v| value_to_string(v, file, &format!("{pointer}.dockerfile")))
                .transpose()?
                .unwrap_or_default(),
            args: to_string_map(b.get("args"), file, &format!("{pointer}.args"))?,
        }),
        _ => Err(Error::config(file, pointer, "string or mapping expected")),
    }
}

fn transform_healthcheck(hc: &Value, file: &Path, pointer: &str) -> Result<HealthCheckDescriptor> {
    let test = to_string_seq(hc.get("test"), file, &format!("{pointer}.test"))?
        .unwrap_or_default();
    if test.is_empty() {
        return Err(Error::config(
            file,
            format!("{pointer}.test"),
            "undefined health test command",
        ));
    }
    let command = translate_test_command(test);
    let interval = hc
        .get("interval")
        .map(|v| value_to_string(v, file, &format!("{pointer}.interval")))
        .transpose()?
        .unwrap_or_default();
    let timeout = hc
        .get("timeout")
        .map(|v| value_to_string(v, file, &format!("{pointer}.timeout")))
        .transpose()?
        .unwrap_or_default();
    let retries = match hc.get("retries") {
        Some(v) => NumberVal::Expr(value_to_string(v, file, &format!("{pointer}.retries"))?),
        None => NumberVal::default(),
    };
    let disable = match hc.get("disable") {
        Some(v) => BoolVal::Expr(value_to_string(v, file, &format!("{pointer}.disable"))?),
        None => BoolVal::default(),
    };
    Ok(HealthCheckDescriptor {
        command,
        http: String::new(),
        interval,
        timeout,
        retries,
        disable,
    })
}

/// Maps a compose `healthcheck.test` onto the exec command actually run.
fn translate_test_command(test: Vec<String>) -> Vec<String> {
    match test[0].as_str() {
        "CMD" => test[1..].to_vec(),
        "CMD-SHELL" => {
            let mut cmd = vec!["/bin/sh".to_string(), "-c".to_string()];
            cmd.extend_from_slice(&test[1..]);
            cmd
        }
        _ => vec!["/bin/sh".to_string(), "-c".to_string(), test.join(" ")],
    }
}

/// Expands compose port strings (`[ip:][hostRange:]containerRange[/proto]`)
/// into one binding per port offset.
fn expand_ports(ports: &Value, file: &Path, pointer: &str) -> Result<Vec<PortBindingDescriptor>> {
    let seq = ports
        .as_sequence()
        .ok_or_else(|| Error::config(file, pointer, "sequence expected"))?;
    let mut out = Vec::new();
    for entry in seq {
        let entry = value_to_string(entry, file, pointer)?;
        let invalid = || Error::config(file, pointer, format!("invalid port entry {entry:?}"));

        let (addr, protocol) = match entry.splitn(2, '/').collect::<Vec<_>>()[..] {
            [addr] => (addr, "tcp".to_string()),
            [addr, proto] if !proto.contains('/') => (addr, proto.to_lowercase()),
            _ => return Err(invalid()),
        };

        let segments: Vec<&str> = addr.split(':').collect();
        let (ip, host_expr, target_expr) = match segments[..] {
            [target] => ("", target, target),
            [host, target] => ("", host, target),
            [ip, host, target] => (ip, host, target),
            _ => return Err(invalid()),
        };

        let (host_from, host_to) = parse_port_range(host_expr).ok_or_else(invalid)?;
        let (target_from, target_to) = parse_port_range(target_expr).ok_or_else(invalid)?;
        let range = target_to - target_from;
        if host_to - host_from != range {
            return Err(Error::config(
                file,
                pointer,
                format!("port {entry:?} range size differs between host and destination"),
            ));
        }
        for offset in 0..=range {
            out.push(PortBindingDescriptor {
                target: NumberVal::Int(u64::from(target_from + offset)),
                published: NumberVal::Int(u64::from(host_from + offset)),
                ip: ip.to_string(),
                protocol: protocol.clone(),
            });
        }
    }
    Ok(out)
}

fn parse_port_range(expr: &str) -> Option<(u16, u16)> {
    let parts: Vec<&str> = expr.split('-').collect();
    match parts[..] {
        [single] => {
            let p = single.parse().ok()?;
            Some((p, p))
        }
        [from, to] => {
            let from = from.parse().ok()?;
            let to = to.parse().ok()?;
            (from <= to).then_some((from, to))
        }
        _ => None,
    }
}

/// Compose service volumes are `HOST:TARGET`; the descriptor keys mounts by
/// target path.
fn to_volume_mounts(v: &Value, file: &Path, pointer: &str) -> Result<IndexMap<String, String>> {
    let seq = v
        .as_sequence()
        .ok_or_else(|| Error::config(file, pointer, "sequence expected"))?;
    let mut mounts = IndexMap::new();
    for entry in seq {
        let entry = value_to_string(entry, file, pointer)?;
        let (source, target) = entry.split_once(':').ok_or_else(|| {
            Error::config(file, pointer, format!("invalid volume entry {entry:?}"))
        })?;
        mounts.insert(target.to_string(), source.to_string());
    }
    Ok(mounts)
}

// =============================================================================
// Value Coercion
// =============================================================================

fn value_to_string(v: &Value, file: &Path, pointer: &str) -> Result<String> {
    match v {
        Value::String(s) => Ok(s.clone()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(Error::config(file, pointer, "string expected")),
    }
}

/// A sequence position that also accepts a whitespace-separated string.
fn to_string_seq(v: Option<&Value>, file: &Path, pointer: &str) -> Result<Option<Vec<String>>> {
    match v {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.split_whitespace().map(str::to_string).collect())),
        Some(Value::Sequence(seq)) => Ok(Some(
            seq.iter()
                .map(|e| value_to_string(e, file, pointer))
                .collect::<Result<_>>()?,
        )),
        Some(_) => Err(Error::config(file, pointer, "string or sequence expected")),
    }
}

/// `env_file` accepts a single file name or a list; names are never split.
fn to_file_list(v: Option<&Value>, file: &Path, pointer: &str) -> Result<Vec<String>> {
    match v {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(s)) => Ok(vec![s.clone()]),
        Some(Value::Sequence(seq)) => seq
            .iter()
            .map(|e| value_to_string(e, file, pointer))
            .collect(),
        Some(_) => Err(Error::config(file, pointer, "string or sequence expected")),
    }
}

/// A mapping position that also accepts a `KEY=VALUE` sequence.
fn to_string_map(v: Option<&Value>, file: &Path, pointer: &str) -> Result<IndexMap<String, String>> {
    match v {
        None | Some(Value::Null) => Ok(IndexMap::new()),
        Some(Value::Mapping(m)) => {
            let mut out = IndexMap::new();
            for (k, v) in m {
                out.insert(
                    value_to_string(k, file, pointer)?,
                    value_to_string(v, file, pointer)?,
                );
            }
            Ok(out)
        }
        Some(Value::Sequence(seq)) => {
            let mut out = IndexMap::new();
            for e in seq {
                let entry = value_to_string(e, file, pointer)?;
                let (k, v) = entry.split_once('=').ok_or_else(|| {
                    Error::config(file, pointer, format!("invalid environment entry {entry:?}"))
                })?;
                out.insert(k.to_string(), v.to_string());
            }
            Ok(out)
        }
        Some(_) => Err(Error::config(file, pointer, "mapping or sequence expected")),
    }
}

fn promote_stop_grace_period(
    candidate: &str,
    file: &Path,
    pointer: &str,
    pod: &mut PodDescriptor,
) -> Result<()> {
    let parsed = humantime::parse_duration(candidate).map_err(|_| {
        Error::config(
            file,
            format!("{pointer}.stop_grace_period"),
            format!("invalid stop_grace_period format: {candidate}"),
        )
    })?;
    let current = if pod.stop_grace_period.is_empty() {
        std::time::Duration::ZERO
    } else {
        humantime::parse_duration(&pod.stop_grace_period).unwrap_or_default()
    };
    // The longest grace period any service asks for wins for the whole pod.
    if parsed > current {
        pod.stop_grace_period = candidate.to_string();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn file() -> PathBuf {
        PathBuf::from("/pods/app/docker-compose.yml")
    }

    fn ports_of(entries: &[&str]) -> Result<Vec<PortBindingDescriptor>> {
        let yaml = serde_yaml::to_value(entries).unwrap();
        expand_ports(&yaml, &file(), ".services.s.ports")
    }

    #[test]
    fn expands_udp_port_range() {
        let ports = ports_of(&["8000-8002:9000-9002/udp"]).unwrap();
        let got: Vec<(u64, u64, &str)> = ports
            .iter()
            .map(|p| match (&p.target, &p.published) {
                (NumberVal::Int(t), NumberVal::Int(h)) => (*h, *t, p.protocol.as_str()),
                _ => panic!("expected native ints"),
            })
            .collect();
        assert_eq!(
            got,
            vec![(8000, 9000, "udp"), (8001, 9001, "udp"), (8002, 9002, "udp")]
        );
    }

    #[test]
    fn rejects_mismatched_port_ranges() {
        assert!(ports_of(&["8000-8002:9000-9001/udp"]).is_err());
    }

    #[test]
    fn parses_ip_qualified_port() {
        let ports = ports_of(&["127.0.0.1:80:8080"]).unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].target, NumberVal::Int(8080));
        assert_eq!(ports[0].published, NumberVal::Int(80));
        assert_eq!(ports[0].ip, "127.0.0.1");
        assert_eq!(ports[0].protocol, "tcp");
    }

    #[test]
    fn single_port_publishes_itself() {
        let ports = ports_of(&["6379"]).unwrap();
        assert_eq!(ports[0].target, NumberVal::Int(6379));
        assert_eq!(ports[0].published, NumberVal::Int(6379));
    }

    #[test]
    fn rejects_malformed_port_entries() {
        assert!(ports_of(&["80:80:80:80"]).is_err());
        assert!(ports_of(&["80/tcp/udp"]).is_err());
        assert!(ports_of(&["eighty"]).is_err());
    }

    #[test]
    fn translates_cmd_healthcheck() {
        let cmd = translate_test_command(
            ["CMD", "curl", "-f", "http://x"].map(String::from).to_vec(),
        );
        assert_eq!(cmd, vec!["curl", "-f", "http://x"]);
    }

    #[test]
    fn translates_cmd_shell_healthcheck() {
        let cmd = translate_test_command(["CMD-SHELL", "exit 1"].map(String::from).to_vec());
        assert_eq!(cmd, vec!["/bin/sh", "-c", "exit 1"]);
    }

    #[test]
    fn wraps_bare_healthcheck_in_shell() {
        let cmd = translate_test_command(["echo", "hi"].map(String::from).to_vec());
        assert_eq!(cmd, vec!["/bin/sh", "-c", "echo hi"]);
    }

    #[test]
    fn environment_accepts_both_shapes() {
        let mapping: Value = serde_yaml::from_str("A: 1\nB: two").unwrap();
        let m = to_string_map(Some(&mapping), &file(), ".e").unwrap();
        assert_eq!(m["A"], "1");
        assert_eq!(m["B"], "two");

        let list: Value = serde_yaml::from_str("- A=1\n- B=two").unwrap();
        let m = to_string_map(Some(&list), &file(), ".e").unwrap();
        assert_eq!(m["A"], "1");
        assert_eq!(m["B"], "two");

        let broken: Value = serde_yaml::from_str("- NOEQUALS").unwrap();
        assert!(to_string_map(Some(&broken), &file(), ".e").is_err());
    }

    #[test]
    fn image_gets_docker_prefix_only_without_build() {
        let yaml: Value = serde_yaml::from_str(
            r#"
version: "2"
services:
  web:
    image: nginx:1.25
  builder:
    image: myimg
    build: ./ctx
"#,
        )
        .unwrap();
        let pod = transform_compose(&yaml, &file(), "./volumes").unwrap();
        assert_eq!(pod.services["web"].image, "docker://nginx:1.25");
        assert_eq!(pod.services["builder"].image, "myimg");
        assert_eq!(
            pod.services["builder"].build.as_ref().unwrap().context,
            "./ctx"
        );
    }

    #[test]
    fn http_host_requires_http_port() {
        let yaml: Value = serde_yaml::from_str(
            r#"
services:
  web:
    image: nginx
    environment:
      HTTP_HOST: example.org
"#,
        )
        .unwrap();
        assert!(transform_compose(&yaml, &file(), "./volumes").is_err());
    }

    #[test]
    fn http_host_and_port_publish_shared_key() {
        let yaml: Value = serde_yaml::from_str(
            r#"
services:
  web:
    image: nginx
    environment:
      HTTP_HOST: example.org
      HTTP_PORT: "80"
"#,
        )
        .unwrap();
        let pod = transform_compose(&yaml, &file(), "./volumes").unwrap();
        assert_eq!(pod.shared_keys["http/example.org"], "web:80");
    }

    #[test]
    fn top_level_volumes_get_default_base_dir() {
        let yaml: Value = serde_yaml::from_str(
            r#"
services:
  db:
    image: postgres
volumes:
  pgdata: {}
"#,
        )
        .unwrap();
        let pod = transform_compose(&yaml, &file(), "./volumes").unwrap();
        assert_eq!(pod.volumes["pgdata"].source, "./volumes/pgdata");
        assert_eq!(pod.volumes["pgdata"].kind, "host");
    }
}
