use serde_json::{Map, Value};

use crate::error::{HosterError, HosterResult};

/// Which external user kind owns rows of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerKind {
    Creator,
    Customer,
}

impl OwnerKind {
    #[must_use]
    pub const fn column(self) -> &'static str {
        match self {
            Self::Creator => "creator_id",
            Self::Customer => "customer_id",
        }
    }
}

/// Attribute value kinds. `Reference` fields name another entity's id
/// and are filterable in list queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Integer,
    Number,
    Boolean,
    Json,
    Reference,
}

#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
    pub immutable: bool,
    /// Redacted on every read path.
    pub secret: bool,
    pub default: Option<Value>,
}

impl FieldSpec {
    pub const fn new(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: false,
            immutable: false,
            secret: false,
            default: None,
        }
    }

    pub const fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub const fn immutable(mut self) -> Self {
        self.immutable = true;
        self
    }

    pub const fn secret(mut self) -> Self {
        self.secret = true;
        self
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

/// One permitted state-machine edge, optionally firing a command when
/// taken.
#[derive(Debug, Clone)]
pub struct Transition {
    pub from: &'static str,
    pub to: &'static str,
    pub command: Option<&'static str>,
}

impl Transition {
    pub const fn new(from: &'static str, to: &'static str) -> Self {
        Self {
            from,
            to,
            command: None,
        }
    }

    pub const fn with_command(from: &'static str, to: &'static str, command: &'static str) -> Self {
        Self {
            from,
            to,
            command: Some(command),
        }
    }
}

/// A schema-declared non-CRUD verb.
#[derive(Debug, Clone)]
pub struct ActionSpec {
    pub name: &'static str,
    /// Source states the action is valid in. Empty means any
    /// non-terminal state.
    pub from: &'static [&'static str],
    /// Target state written before the command runs. Actions without
    /// a target only run their command.
    pub target: Option<&'static str>,
    pub command: Option<&'static str>,
    /// States where the action succeeds without doing anything,
    /// returning the row unchanged.
    pub noop_in: &'static [&'static str],
}

/// How deletes behave for an entity.
#[derive(Debug, Clone)]
pub struct DeleteSpec {
    /// Terminal-transition target (e.g. `deleting`).
    pub target: &'static str,
    /// Remove the row after a clean terminal transition instead of
    /// keeping the soft-deleted row.
    pub hard_remove: bool,
}

/// Entity-specific hook points, interpreted by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    None,
    Template,
    Deployment,
    Node,
    SshKey,
    CloudProvision,
}

/// Everything the engine needs to serve one entity kind. Adding an
/// entity to the platform means writing one of these, not new CRUD
/// code.
#[derive(Debug, Clone)]
pub struct EntitySchema {
    /// Collection name, also the table name (`deployments`).
    pub name: &'static str,
    pub owner: OwnerKind,
    pub fields: Vec<FieldSpec>,
    pub initial_status: &'static str,
    pub transitions: Vec<Transition>,
    pub actions: Vec<ActionSpec>,
    pub delete: Option<DeleteSpec>,
    /// Status to transition to right after create (fires that edge's
    /// command).
    pub create_transition: Option<&'static str>,
    pub hook: Hook,
    /// Boolean attribute that, when true, grants read access to
    /// everyone (published templates).
    pub public_read_flag: Option<&'static str>,
    pub terminal_statuses: &'static [&'static str],
}

impl EntitySchema {
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    #[must_use]
    pub fn action(&self, name: &str) -> Option<&ActionSpec> {
        self.actions.iter().find(|a| a.name == name)
    }

    #[must_use]
    pub fn permits(&self, from: &str, to: &str) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == from && t.to == to)
    }

    #[must_use]
    pub fn transition_command(&self, from: &str, to: &str) -> Option<&'static str> {
        self.transitions
            .iter()
            .find(|t| t.from == from && t.to == to)
            .and_then(|t| t.command)
    }

    #[must_use]
    pub fn is_terminal(&self, status: &str) -> bool {
        self.terminal_statuses.contains(&status)
    }

    /// Check a create payload: unknown fields are rejected, required
    /// fields enforced, defaults applied, kinds checked.
    pub fn validate_create(&self, attributes: &Map<String, Value>) -> HosterResult<Map<String, Value>> {
        for key in attributes.keys() {
            if self.field(key).is_none() {
                return Err(HosterError::BadRequest(format!(
                    "unknown field {key} for {}",
                    self.name
                )));
            }
        }

        let mut out = Map::new();
        for field in &self.fields {
            match attributes.get(field.name) {
                Some(value) if !value.is_null() => {
                    check_kind(self.name, field, value)?;
                    out.insert(field.name.to_string(), value.clone());
                }
                _ => {
                    if let Some(default) = &field.default {
                        out.insert(field.name.to_string(), default.clone());
                    } else if field.required {
                        return Err(HosterError::BadRequest(format!(
                            "missing required field {} for {}",
                            field.name, self.name
                        )));
                    }
                }
            }
        }
        Ok(out)
    }

    /// Check an update payload: unknown fields rejected, immutable
    /// fields are a conflict, kinds checked.
    pub fn validate_update(&self, attributes: &Map<String, Value>) -> HosterResult<()> {
        for (key, value) in attributes {
            let Some(field) = self.field(key) else {
                return Err(HosterError::BadRequest(format!(
                    "unknown field {key} for {}",
                    self.name
                )));
            };
            if field.immutable {
                return Err(HosterError::Conflict(format!(
                    "field {key} is immutable on {}",
                    self.name
                )));
            }
            if !value.is_null() {
                check_kind(self.name, field, value)?;
            }
        }
        Ok(())
    }
}

fn check_kind(entity: &str, field: &FieldSpec, value: &Value) -> HosterResult<()> {
    let ok = match field.kind {
        FieldKind::String | FieldKind::Reference => value.is_string(),
        FieldKind::Integer => value.is_i64() || value.is_u64(),
        FieldKind::Number => value.is_number(),
        FieldKind::Boolean => value.is_boolean(),
        FieldKind::Json => value.is_object() || value.is_array(),
    };
    if ok {
        Ok(())
    } else {
        Err(HosterError::BadRequest(format!(
            "field {} on {entity} has the wrong type",
            field.name
        )))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn sample() -> EntitySchema {
        EntitySchema {
            name: "widgets",
            owner: OwnerKind::Creator,
            fields: vec![
                FieldSpec::new("name", FieldKind::String).required().immutable(),
                FieldSpec::new("count", FieldKind::Integer)
                    .default_value(json!(0)),
                FieldSpec::new("meta", FieldKind::Json),
            ],
            initial_status: "pending",
            transitions: vec![
                Transition::with_command("pending", "active", "activate"),
                Transition::new("active", "deleted"),
            ],
            actions: vec![],
            delete: Some(DeleteSpec {
                target: "deleted",
                hard_remove: false,
            }),
            create_transition: None,
            hook: Hook::None,
            public_read_flag: None,
            terminal_statuses: &["deleted"],
        }
    }

    #[test]
    fn create_applies_defaults_and_requires() {
        let schema = sample();

        let ok = schema
            .validate_create(&json!({"name": "w"}).as_object().unwrap().clone())
            .unwrap();
        assert_eq!(ok["count"], json!(0));

        let missing = schema.validate_create(&Map::new()).unwrap_err();
        assert_eq!(missing.kind(), "bad-request");
    }

    #[test]
    fn unknown_field_rejected() {
        let schema = sample();
        let err = schema
            .validate_create(&json!({"name": "w", "nope": 1}).as_object().unwrap().clone())
            .unwrap_err();
        assert_eq!(err.kind(), "bad-request");
    }

    #[test]
    fn immutable_update_is_conflict() {
        let schema = sample();
        let err = schema
            .validate_update(json!({"name": "other"}).as_object().unwrap())
            .unwrap_err();
        assert_eq!(err.kind(), "conflict");
    }

    #[test]
    fn wrong_kind_rejected() {
        let schema = sample();
        let err = schema
            .validate_create(&json!({"name": 5}).as_object().unwrap().clone())
            .unwrap_err();
        assert_eq!(err.kind(), "bad-request");
    }

    #[test]
    fn edge_membership() {
        let schema = sample();
        assert!(schema.permits("pending", "active"));
        assert!(!schema.permits("active", "pending"));
        assert_eq!(
            schema.transition_command("pending", "active"),
            Some("activate")
        );
        assert!(schema.is_terminal("deleted"));
    }
}
