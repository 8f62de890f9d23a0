use std::collections::BTreeMap;

use hoster::compose::{self, MountSpec};

const STACK: &str = "
services:
  app:
    image: ghcr.io/acme/app:2.1
    ports:
      - '8080:3000'
    environment:
      - DATABASE_URL=postgres://app:${DB_PASSWORD}@db:5432/app
      - LOG_LEVEL=info
    depends_on:
      - db
    restart: unless-stopped
    deploy:
      resources:
        limits:
          cpus: '0.5'
          memory: 512M
  db:
    image: postgres:16-alpine
    environment:
      POSTGRES_PASSWORD: ${DB_PASSWORD}
    volumes:
      - pg-data:/var/lib/postgresql/data
    healthcheck:
      test: ['CMD-SHELL', 'pg_isready -U app']
      interval: 5s
      timeout: 3s
      retries: 10
networks:
  internal:
volumes:
  pg-data:
  external-share:
    external: true
";

#[test]
fn full_stack_normalizes() {
    let spec = compose::parse(STACK).unwrap();

    assert_eq!(spec.services.len(), 2);
    assert_eq!(spec.networks, vec!["internal".to_string()]);

    let volumes: Vec<(&str, bool)> = spec
        .volumes
        .iter()
        .map(|v| (v.name.as_str(), v.external))
        .collect();
    assert!(volumes.contains(&("pg-data", false)));
    assert!(volumes.contains(&("external-share", true)));

    let app = spec.service("app").unwrap();
    assert_eq!(app.image, "ghcr.io/acme/app:2.1");
    assert_eq!(app.depends_on, vec!["db".to_string()]);
    assert_eq!(app.restart.as_deref(), Some("unless-stopped"));
    assert_eq!(app.ports[0].container_port, 3000);
    assert_eq!(app.ports[0].host_port, Some(8080));
    assert_eq!(app.limits.cpus, Some(0.5));
    assert_eq!(app.limits.memory_bytes, Some(512 * 1024 * 1024));

    let db = spec.service("db").unwrap();
    assert_eq!(db.mounts, vec![MountSpec::Named {
        volume: "pg-data".into(),
        target: "/var/lib/postgresql/data".into(),
        read_only: false,
    }]);
    let probe = db.health.as_ref().unwrap();
    assert_eq!(probe.retries, 10);
}

#[test]
fn dependency_order_is_stable() {
    let spec = compose::parse(STACK).unwrap();
    let order: Vec<&str> = spec
        .ordered_services()
        .unwrap()
        .iter()
        .map(|s| s.name.as_str())
        .collect();
    assert_eq!(order, vec!["db", "app"]);
}

#[test]
fn unknown_dependency_is_rejected() {
    let err = compose::parse("services:\n  a:\n    image: x\n    depends_on: [ghost]\n")
        .unwrap()
        .ordered_services()
        .unwrap_err();
    assert_eq!(err.kind(), "configuration-error");
}

#[test]
fn unparseable_text_is_configuration_error() {
    let err = compose::parse(":{ not yaml").unwrap_err();
    assert_eq!(err.kind(), "configuration-error");
}

#[test]
fn service_without_image_is_rejected() {
    let err = compose::parse("services:\n  a:\n    restart: always\n").unwrap_err();
    assert_eq!(err.kind(), "configuration-error");
}

#[test]
fn substitution_is_deterministic() {
    let mut vars = BTreeMap::new();
    vars.insert("DB_PASSWORD".to_string(), "hunter2".to_string());

    let input = "postgres://app:${DB_PASSWORD}@db:5432/app";
    let a = compose::substitute_variables(input, &vars);
    let b = compose::substitute_variables(input, &vars);

    assert_eq!(a, "postgres://app:hunter2@db:5432/app");
    assert_eq!(a, b);
}

#[test]
fn unsupported_keys_are_ignored() {
    let text = "
services:
  app:
    image: nginx:alpine
    ports: ['80']
    logging:
      driver: json-file
    cap_add: [NET_ADMIN]
";
    let spec = compose::parse(text).unwrap();
    assert_eq!(spec.services.len(), 1);
    assert_eq!(spec.service("app").unwrap().ports[0].container_port, 80);
}
