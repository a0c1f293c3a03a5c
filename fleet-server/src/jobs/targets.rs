//! Job target resolution.
//!
//! Three modes: an explicit machine list, a group (static membership or an
//! embedded query re-evaluated at dispatch time), or a free-form dynamic
//! query over the live machine set. Queries are conjunctions or
//! disjunctions of field conditions; matching is case-insensitive.

use serde::{Deserialize, Serialize};

use crate::cache::StateCache;
use crate::store::Machine;
use fleet_protocol::{MachineStatus, TargetType};

/// How a submitted job names its targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "targetType", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum TargetSpec {
    Adhoc { machine_ids: Vec<String> },
    Group { group: GroupDef },
    Dynamic { query: DynamicQuery },
}

impl TargetSpec {
    pub fn target_type(&self) -> TargetType {
        match self {
            Self::Adhoc { .. } => TargetType::Adhoc,
            Self::Group { .. } => TargetType::Group,
            Self::Dynamic { .. } => TargetType::Dynamic,
        }
    }
}

/// A named group: static when it carries a materialized member list,
/// dynamic when it embeds a query evaluated at dispatch time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupDef {
    pub name: String,
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default)]
    pub query: Option<DynamicQuery>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Combine {
    #[default]
    All,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    Eq,
    Contains,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub op: Operator,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicQuery {
    #[serde(default)]
    pub combine: Combine,
    pub conditions: Vec<Condition>,
}

impl DynamicQuery {
    pub fn matches(&self, machine: &Machine) -> bool {
        let mut checks = self.conditions.iter().map(|c| c.matches(machine));
        match self.combine {
            Combine::All => checks.all(|m| m),
            Combine::Any => checks.any(|m| m),
        }
    }
}

impl Condition {
    fn matches(&self, machine: &Machine) -> bool {
        let field = self.field.to_lowercase();
        let actual = if let Some(key) = field.strip_prefix("tag:") {
            machine
                .tags
                .iter()
                .find(|(k, _)| k.to_lowercase() == key)
                .map(|(_, v)| v.clone())
        } else {
            match field.as_str() {
                "os" => Some(machine.os_info.clone()),
                "status" => Some(match machine.status {
                    MachineStatus::Online => "online".to_string(),
                    MachineStatus::Offline => "offline".to_string(),
                }),
                "hostname" => Some(machine.hostname.clone()),
                "ip" => Some(machine.ip.clone()),
                "role" => machine.role.clone(),
                _ => None,
            }
        };
        let Some(actual) = actual else {
            return false;
        };

        let actual = actual.to_lowercase();
        let wanted = self.value.to_lowercase();
        match self.op {
            Operator::Eq => actual == wanted,
            Operator::Contains => actual.contains(&wanted),
        }
    }
}

/// Resolves a target spec against the live machine set. Order follows the
/// caller's list for adhoc/static targets and cache iteration for queries;
/// duplicates are removed, unknown ids are kept (they fail at dispatch
/// with a deterministic outcome).
pub fn resolve_targets(spec: &TargetSpec, cache: &StateCache) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut push = |id: String| {
        if !out.contains(&id) {
            out.push(id);
        }
    };

    match spec {
        TargetSpec::Adhoc { machine_ids } => {
            for id in machine_ids {
                push(id.clone());
            }
        }
        TargetSpec::Group { group } => {
            if let Some(query) = &group.query {
                for machine in cache.machines() {
                    if query.matches(&machine) {
                        push(machine.id);
                    }
                }
            } else {
                for id in &group.members {
                    push(id.clone());
                }
            }
        }
        TargetSpec::Dynamic { query } => {
            for machine in cache.machines() {
                if query.matches(&machine) {
                    push(machine.id);
                }
            }
        }
    }
    out
}
