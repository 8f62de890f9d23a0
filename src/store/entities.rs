use serde::{Deserialize, Serialize};
use serde_json::json;

use super::EntityRow;
use super::schema::{
    ActionSpec, DeleteSpec, EntitySchema, FieldKind, FieldSpec, Hook, OwnerKind, Transition,
};
use crate::error::{HosterError, HosterResult};

pub const TEMPLATES: &str = "templates";
pub const DEPLOYMENTS: &str = "deployments";
pub const NODES: &str = "nodes";
pub const SSH_KEYS: &str = "ssh_keys";
pub const CLOUD_PROVISIONS: &str = "cloud_provisions";
pub const INVOICES: &str = "invoices";

/// All entity schemas the engine serves. Adding an entity to the
/// platform means adding a record here.
#[must_use]
pub fn registry() -> Vec<EntitySchema> {
    vec![
        templates(),
        deployments(),
        nodes(),
        ssh_keys(),
        cloud_provisions(),
        invoices(),
    ]
}

fn templates() -> EntitySchema {
    EntitySchema {
        name: TEMPLATES,
        owner: OwnerKind::Creator,
        fields: vec![
            FieldSpec::new("name", FieldKind::String).required(),
            FieldSpec::new("slug", FieldKind::String).immutable(),
            FieldSpec::new("version", FieldKind::String).required(),
            FieldSpec::new("composition", FieldKind::String).required(),
            FieldSpec::new("variables", FieldKind::Json).default_value(json!([])),
            FieldSpec::new("resources", FieldKind::Json).required(),
            FieldSpec::new("price_cents", FieldKind::Integer).default_value(json!(0)),
            FieldSpec::new("capabilities", FieldKind::Json).default_value(json!(["docker"])),
            FieldSpec::new("published", FieldKind::Boolean).default_value(json!(false)),
            FieldSpec::new("routed_port", FieldKind::Integer),
            FieldSpec::new("config_files", FieldKind::Json).default_value(json!([])),
        ],
        initial_status: "active",
        transitions: vec![Transition::new("active", "deleted")],
        actions: vec![
            ActionSpec {
                name: "publish",
                from: &["active"],
                target: None,
                command: Some("publish"),
                noop_in: &[],
            },
            ActionSpec {
                name: "unpublish",
                from: &["active"],
                target: None,
                command: Some("unpublish"),
                noop_in: &[],
            },
        ],
        delete: Some(DeleteSpec {
            target: "deleted",
            hard_remove: false,
        }),
        create_transition: None,
        hook: Hook::Template,
        public_read_flag: Some("published"),
        terminal_statuses: &["deleted"],
    }
}

fn deployments() -> EntitySchema {
    EntitySchema {
        name: DEPLOYMENTS,
        owner: OwnerKind::Customer,
        fields: vec![
            FieldSpec::new("name", FieldKind::String).immutable(),
            FieldSpec::new("template_id", FieldKind::Reference)
                .required()
                .immutable(),
            FieldSpec::new("template_version", FieldKind::String).immutable(),
            FieldSpec::new("node_id", FieldKind::Reference),
            FieldSpec::new("variables", FieldKind::Json)
                .secret()
                .default_value(json!({})),
            FieldSpec::new("domains", FieldKind::Json).default_value(json!([])),
            FieldSpec::new("containers", FieldKind::Json).default_value(json!([])),
            FieldSpec::new("resources", FieldKind::Json),
            FieldSpec::new("proxy_port", FieldKind::Integer),
            FieldSpec::new("error_message", FieldKind::String),
            FieldSpec::new("started_at", FieldKind::String),
            FieldSpec::new("stopped_at", FieldKind::String),
        ],
        initial_status: "pending",
        transitions: vec![
            Transition::with_command("pending", "scheduled", "schedule"),
            Transition::with_command("scheduled", "starting", "start"),
            Transition::new("starting", "running"),
            Transition::with_command("running", "stopping", "stop"),
            Transition::new("stopping", "stopped"),
            Transition::with_command("stopped", "starting", "start"),
            Transition::with_command("failed", "starting", "start"),
            Transition::with_command("stopped", "deleting", "destroy"),
            Transition::with_command("failed", "deleting", "destroy"),
            Transition::new("deleting", "deleted"),
            Transition::new("pending", "failed"),
            Transition::new("scheduled", "failed"),
            Transition::new("starting", "failed"),
            Transition::new("running", "failed"),
            Transition::new("stopping", "failed"),
            Transition::new("stopped", "failed"),
            Transition::new("deleting", "failed"),
        ],
        actions: vec![
            ActionSpec {
                name: "start",
                from: &["stopped", "failed"],
                target: Some("starting"),
                command: None,
                noop_in: &["running"],
            },
            ActionSpec {
                name: "stop",
                from: &["running"],
                target: Some("stopping"),
                command: None,
                noop_in: &["stopped"],
            },
            ActionSpec {
                name: "restart",
                from: &["running"],
                target: Some("stopping"),
                command: Some("restart"),
                noop_in: &[],
            },
            ActionSpec {
                name: "destroy",
                from: &["stopped", "failed"],
                target: Some("deleting"),
                command: None,
                noop_in: &[],
            },
        ],
        delete: Some(DeleteSpec {
            target: "deleting",
            hard_remove: false,
        }),
        create_transition: Some("scheduled"),
        hook: Hook::Deployment,
        public_read_flag: None,
        terminal_statuses: &["deleted"],
    }
}

fn nodes() -> EntitySchema {
    EntitySchema {
        name: NODES,
        owner: OwnerKind::Creator,
        fields: vec![
            FieldSpec::new("name", FieldKind::String).required(),
            FieldSpec::new("ssh_host", FieldKind::String).required(),
            FieldSpec::new("ssh_port", FieldKind::Integer).default_value(json!(22)),
            FieldSpec::new("ssh_user", FieldKind::String).default_value(json!("root")),
            FieldSpec::new("ssh_key_id", FieldKind::Reference).required(),
            FieldSpec::new("docker_socket", FieldKind::String)
                .default_value(json!("/var/run/docker.sock")),
            FieldSpec::new("capabilities", FieldKind::Json).required(),
            FieldSpec::new("cpu_total", FieldKind::Number).required(),
            FieldSpec::new("memory_total_mb", FieldKind::Integer).required(),
            FieldSpec::new("disk_total_mb", FieldKind::Integer).required(),
            FieldSpec::new("cpu_used", FieldKind::Number).default_value(json!(0.0)),
            FieldSpec::new("memory_used_mb", FieldKind::Integer).default_value(json!(0)),
            FieldSpec::new("disk_used_mb", FieldKind::Integer).default_value(json!(0)),
            FieldSpec::new("location", FieldKind::String),
            FieldSpec::new("base_domain", FieldKind::String),
            FieldSpec::new("local", FieldKind::Boolean).default_value(json!(false)),
            FieldSpec::new("last_health_check", FieldKind::String),
            FieldSpec::new("error_message", FieldKind::String),
            FieldSpec::new("provider", FieldKind::String).default_value(json!("manual")),
            FieldSpec::new("provision_id", FieldKind::Reference),
        ],
        initial_status: "offline",
        transitions: vec![
            Transition::new("offline", "online"),
            Transition::new("online", "offline"),
            Transition::new("online", "maintenance"),
            Transition::new("offline", "maintenance"),
            Transition::new("maintenance", "online"),
            Transition::new("maintenance", "offline"),
            Transition::new("online", "deleted"),
            Transition::new("offline", "deleted"),
            Transition::new("maintenance", "deleted"),
        ],
        actions: vec![
            ActionSpec {
                name: "verify",
                from: &[],
                target: None,
                command: Some("verify-node"),
                noop_in: &[],
            },
            ActionSpec {
                name: "enter-maintenance",
                from: &["online", "offline"],
                target: Some("maintenance"),
                command: None,
                noop_in: &["maintenance"],
            },
            ActionSpec {
                name: "exit-maintenance",
                from: &["maintenance"],
                target: Some("online"),
                command: None,
                noop_in: &["online"],
            },
        ],
        delete: Some(DeleteSpec {
            target: "deleted",
            hard_remove: false,
        }),
        create_transition: None,
        hook: Hook::Node,
        public_read_flag: None,
        terminal_statuses: &["deleted"],
    }
}

fn ssh_keys() -> EntitySchema {
    EntitySchema {
        name: SSH_KEYS,
        owner: OwnerKind::Creator,
        fields: vec![
            FieldSpec::new("name", FieldKind::String).required(),
            FieldSpec::new("fingerprint", FieldKind::String).immutable(),
            // Plaintext accepted on create only; the hook swaps it
            // for ciphertext before the row is written.
            FieldSpec::new("private_key", FieldKind::String).secret(),
            FieldSpec::new("encrypted_key", FieldKind::String).secret(),
        ],
        initial_status: "active",
        transitions: vec![Transition::new("active", "deleted")],
        actions: vec![],
        delete: Some(DeleteSpec {
            target: "deleted",
            hard_remove: true,
        }),
        create_transition: None,
        hook: Hook::SshKey,
        public_read_flag: None,
        terminal_statuses: &["deleted"],
    }
}

fn cloud_provisions() -> EntitySchema {
    EntitySchema {
        name: CLOUD_PROVISIONS,
        owner: OwnerKind::Creator,
        fields: vec![
            FieldSpec::new("provider", FieldKind::String).required(),
            FieldSpec::new("api_token", FieldKind::String).secret(),
            FieldSpec::new("encrypted_token", FieldKind::String).secret(),
            FieldSpec::new("region", FieldKind::String).required(),
            FieldSpec::new("size", FieldKind::String).required(),
            FieldSpec::new("instance_name", FieldKind::String).required(),
            FieldSpec::new("public_ip", FieldKind::String),
            FieldSpec::new("ssh_key_id", FieldKind::Reference).required(),
            FieldSpec::new("current_step", FieldKind::String),
            FieldSpec::new("error_message", FieldKind::String),
            FieldSpec::new("node_id", FieldKind::Reference),
            FieldSpec::new("provider_instance_id", FieldKind::String),
        ],
        initial_status: "pending",
        transitions: vec![
            Transition::new("pending", "creating"),
            Transition::new("creating", "configuring"),
            Transition::new("configuring", "ready"),
            Transition::with_command("pending", "destroying", "destroy-instance"),
            Transition::with_command("creating", "destroying", "destroy-instance"),
            Transition::with_command("configuring", "destroying", "destroy-instance"),
            Transition::with_command("ready", "destroying", "destroy-instance"),
            Transition::with_command("failed", "destroying", "destroy-instance"),
            Transition::new("destroying", "destroyed"),
            Transition::new("pending", "failed"),
            Transition::new("creating", "failed"),
            Transition::new("configuring", "failed"),
            Transition::new("destroying", "failed"),
        ],
        actions: vec![],
        delete: Some(DeleteSpec {
            target: "destroying",
            hard_remove: false,
        }),
        create_transition: None,
        hook: Hook::CloudProvision,
        public_read_flag: None,
        terminal_statuses: &["destroyed"],
    }
}

fn invoices() -> EntitySchema {
    EntitySchema {
        name: INVOICES,
        owner: OwnerKind::Customer,
        fields: vec![
            FieldSpec::new("period_start", FieldKind::String).required(),
            FieldSpec::new("period_end", FieldKind::String).required(),
            FieldSpec::new("line_items", FieldKind::Json).default_value(json!([])),
            FieldSpec::new("total_cents", FieldKind::Integer).default_value(json!(0)),
            FieldSpec::new("checkout_session_id", FieldKind::String),
        ],
        initial_status: "draft",
        transitions: vec![
            Transition::new("draft", "pending"),
            Transition::new("pending", "paid"),
            Transition::new("pending", "failed"),
            Transition::new("failed", "pending"),
        ],
        actions: vec![],
        delete: None,
        create_transition: None,
        hook: Hook::None,
        public_read_flag: None,
        terminal_statuses: &["paid"],
    }
}

// Nested JSON attribute shapes, shared by hooks, command handlers,
// and workers.

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VariableKind {
    String,
    Number,
    Boolean,
    Password,
    Select,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableDef {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: VariableKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DomainKind {
    Auto,
    Custom,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEntry {
    pub hostname: String,
    #[serde(rename = "type")]
    pub kind: DomainKind,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default)]
    pub verified: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub id: String,
    pub service: String,
    pub image: String,
    pub status: String,
    #[serde(default)]
    pub ports: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResourceNeed {
    #[serde(default)]
    pub cpu_cores: f64,
    #[serde(default)]
    pub memory_mb: u64,
    #[serde(default)]
    pub disk_mb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    pub path: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
}

/// Decode a JSON attribute into a typed shape, treating absence as
/// the type's empty value.
pub fn attr_as<T: Default + serde::de::DeserializeOwned>(
    row: &EntityRow,
    name: &str,
) -> HosterResult<T> {
    match row.attributes.get(name) {
        None | Some(serde_json::Value::Null) => Ok(T::default()),
        Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
            HosterError::Internal(format!("attribute {name} has unexpected shape: {e}"))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_names_are_unique() {
        let schemas = registry();
        let mut names: Vec<_> = schemas.iter().map(|s| s.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), schemas.len());
    }

    #[test]
    fn every_stored_status_is_reachable() {
        // Every transition target must either be the initial status,
        // a transition source, or terminal; guards against dangling
        // states in the machines.
        for schema in registry() {
            for t in &schema.transitions {
                let reachable = t.from == schema.initial_status
                    || schema.transitions.iter().any(|p| p.to == t.from);
                assert!(
                    reachable,
                    "{}: state {} is unreachable",
                    schema.name, t.from
                );
            }
        }
    }

    #[test]
    fn deployment_machine_matches_lifecycle() {
        let schema = deployments();

        assert!(schema.permits("pending", "scheduled"));
        assert!(schema.permits("stopped", "starting"));
        assert!(schema.permits("failed", "deleting"));
        assert!(!schema.permits("running", "deleted"));
        assert!(!schema.permits("deleted", "starting"));

        // Failed is reachable from every non-terminal state.
        for from in [
            "pending",
            "scheduled",
            "starting",
            "running",
            "stopping",
            "stopped",
            "deleting",
        ] {
            assert!(
                schema.permits(from, "failed"),
                "failed unreachable from {from}"
            );
        }

        assert_eq!(schema.transition_command("pending", "scheduled"), Some("schedule"));
        assert_eq!(schema.transition_command("scheduled", "starting"), Some("start"));
        assert_eq!(schema.transition_command("stopped", "deleting"), Some("destroy"));
    }

    #[test]
    fn start_action_noops_when_running() {
        let schema = deployments();
        let action = schema.action("start").unwrap();
        assert!(action.noop_in.contains(&"running"));
        assert_eq!(action.target, Some("starting"));
    }

    #[test]
    fn provision_destroying_reachable_from_every_live_state() {
        let schema = cloud_provisions();
        for from in ["pending", "creating", "configuring", "ready", "failed"] {
            assert!(
                schema.permits(from, "destroying"),
                "destroying unreachable from {from}"
            );
            assert_eq!(
                schema.transition_command(from, "destroying"),
                Some("destroy-instance")
            );
        }
    }

    #[test]
    fn variable_defs_decode() {
        let raw = serde_json::json!([{
            "name": "DB_PASSWORD",
            "type": "password",
            "required": true
        }]);
        let defs: Vec<VariableDef> = serde_json::from_value(raw).unwrap();
        assert_eq!(defs[0].kind, VariableKind::Password);
        assert!(defs[0].required);
    }
}
