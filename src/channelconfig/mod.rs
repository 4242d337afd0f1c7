//! Channel configuration bundles and the checks applied when a proposed
//! configuration replaces the current one: section presence, MSP identity
//! immutability, and the consensus-type migration state machine.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{ChainError, ChainResult};

pub const ORDERER_GROUP_KEY: &str = "Orderer";
pub const APPLICATION_GROUP_KEY: &str = "Application";
pub const CONSORTIUMS_GROUP_KEY: &str = "Consortiums";
pub const CAPABILITIES_KEY: &str = "Capabilities";

/// Orderer capability that permits consensus-type migration.
pub const CAPABILITY_ORDERER_V2_0: &str = "V2_0";

pub const TYPE_KAFKA: &str = "kafka";
pub const TYPE_ETCDRAFT: &str = "etcdraft";

/// Raw configuration as carried on the wire, before it is assembled into a
/// [`Bundle`]. Only the group/value structure matters for pre-validation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub channel_group: Option<ConfigGroup>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigGroup {
    pub groups: BTreeMap<String, ConfigGroup>,
    pub values: BTreeMap<String, ConfigValue>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigValue {
    pub value: Vec<u8>,
}

/// Structural checks performed before a bundle is assembled. Capabilities may
/// not be enabled anywhere unless the orderer group carries them as well.
pub fn pre_validate(config: Option<&Config>) -> ChainResult<()> {
    let config =
        config.ok_or_else(|| ChainError::Validation("config cannot be nil".to_string()))?;
    let channel_group = config.channel_group.as_ref().ok_or_else(|| {
        ChainError::Validation("config must contain a channel group".to_string())
    })?;

    let orderer_supported = channel_group
        .groups
        .get(ORDERER_GROUP_KEY)
        .map_or(false, |orderer| orderer.values.contains_key(CAPABILITIES_KEY));
    if !orderer_supported {
        if channel_group.values.contains_key(CAPABILITIES_KEY) {
            return Err(ChainError::Validation(
                "cannot enable channel capabilities without orderer support first".to_string(),
            ));
        }
        if let Some(application) = channel_group.groups.get(APPLICATION_GROUP_KEY) {
            if application.values.contains_key(CAPABILITIES_KEY) {
                return Err(ChainError::Validation(
                    "cannot enable application capabilities without orderer support first"
                        .to_string(),
                ));
            }
        }
    }
    Ok(())
}

/// Stage of the kafka-to-raft migration recorded in the consensus type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationState {
    #[default]
    None,
    Start,
    Commit,
    Context,
    Abort,
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MigrationState::None => "MIG_STATE_NONE",
            MigrationState::Start => "MIG_STATE_START",
            MigrationState::Commit => "MIG_STATE_COMMIT",
            MigrationState::Context => "MIG_STATE_CONTEXT",
            MigrationState::Abort => "MIG_STATE_ABORT",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub msp_id: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrdererConfig {
    pub consensus_type: String,
    pub migration_state: MigrationState,
    pub migration_context: u64,
    pub capabilities: BTreeSet<String>,
    pub orgs: BTreeMap<String, Organization>,
}

impl OrdererConfig {
    fn migration_enabled(&self) -> bool {
        self.capabilities.contains(CAPABILITY_ORDERER_V2_0)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    pub orgs: BTreeMap<String, Organization>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsortiumConfig {
    pub orgs: BTreeMap<String, Organization>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsortiumsConfig {
    pub consortiums: BTreeMap<String, ConsortiumConfig>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub orderer: Option<OrdererConfig>,
    pub application: Option<ApplicationConfig>,
    pub consortiums: Option<ConsortiumsConfig>,
}

/// An assembled channel configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    pub channel: ChannelConfig,
}

impl Bundle {
    /// Checks whether `new` may replace this configuration. Sections may not
    /// disappear, organizations may not change their MSP id, and the
    /// consensus type may only evolve along the migration state machine.
    pub fn validate_new(&self, new: &Bundle) -> ChainResult<()> {
        if let Some(orderer) = &self.channel.orderer {
            let new_orderer = new.channel.orderer.as_ref().ok_or_else(|| {
                ChainError::Validation(
                    "Current config has orderer section, but new config does not".to_string(),
                )
            })?;

            if !orderer.migration_enabled() {
                if orderer.consensus_type != new_orderer.consensus_type {
                    return Err(ChainError::Validation(format!(
                        "Attempted to change consensus type from {} to {}",
                        orderer.consensus_type, new_orderer.consensus_type
                    )));
                }
                if new_orderer.migration_state != MigrationState::None
                    || new_orderer.migration_context != 0
                {
                    return Err(ChainError::Validation(format!(
                        "Attempted to change consensus migration state to {}, migration context to {}",
                        new_orderer.migration_state, new_orderer.migration_context
                    )));
                }
            } else {
                validate_migration_step(orderer, new_orderer)?;
            }

            for (name, org) in &orderer.orgs {
                if let Some(new_org) = new_orderer.orgs.get(name) {
                    if org.msp_id != new_org.msp_id {
                        return Err(ChainError::Validation(format!(
                            "Orderer org {} attempted to change MSP ID from {} to {}",
                            name, org.msp_id, new_org.msp_id
                        )));
                    }
                }
            }
        }

        if let Some(application) = &self.channel.application {
            let new_application = new.channel.application.as_ref().ok_or_else(|| {
                ChainError::Validation(
                    "Current config has application section, but new config does not".to_string(),
                )
            })?;

            for (name, org) in &application.orgs {
                if let Some(new_org) = new_application.orgs.get(name) {
                    if org.msp_id != new_org.msp_id {
                        return Err(ChainError::Validation(format!(
                            "Application org {} attempted to change MSP ID from {} to {}",
                            name, org.msp_id, new_org.msp_id
                        )));
                    }
                }
            }
        }

        if let Some(consortiums) = &self.channel.consortiums {
            let new_consortiums = new.channel.consortiums.as_ref().ok_or_else(|| {
                ChainError::Validation(
                    "Current config has consortiums section, but new config does not".to_string(),
                )
            })?;

            for (consortium_name, consortium) in &consortiums.consortiums {
                let Some(new_consortium) = new_consortiums.consortiums.get(consortium_name)
                else {
                    continue;
                };
                for (name, org) in &consortium.orgs {
                    if let Some(new_org) = new_consortium.orgs.get(name) {
                        if org.msp_id != new_org.msp_id {
                            return Err(ChainError::Validation(format!(
                                "Consortium {} org {} attempted to change MSP ID from {} to {}",
                                consortium_name, name, org.msp_id, new_org.msp_id
                            )));
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

/// The migration state machine. The consensus type may only change from
/// kafka to etcdraft, on START to COMMIT (system channel) or NONE to CONTEXT
/// (standard channel), both of which require a non-zero migration context.
/// With the type unchanged, the permitted state transitions carry a zero
/// context.
fn validate_migration_step(orderer: &OrdererConfig, new: &OrdererConfig) -> ChainResult<()> {
    let old_state = orderer.migration_state;
    let new_state = new.migration_state;

    if orderer.consensus_type != new.consensus_type {
        // entering COMMIT or CONTEXT requires a migration context, checked
        // ahead of the transition table
        if matches!(new_state, MigrationState::Commit | MigrationState::Context)
            && new.migration_context == 0
        {
            return Err(ChainError::Validation(format!(
                "Consensus migration state {}, unexpected migration context: {} (expected >0)",
                new_state, new.migration_context
            )));
        }
        let permitted = orderer.consensus_type == TYPE_KAFKA
            && new.consensus_type == TYPE_ETCDRAFT
            && ((old_state == MigrationState::Start && new_state == MigrationState::Commit)
                || (old_state == MigrationState::None && new_state == MigrationState::Context));
        if !permitted {
            return Err(ChainError::Validation(format!(
                "Attempted to change consensus type from {} to {}, unexpected migration state transition: {} to {}",
                orderer.consensus_type, new.consensus_type, old_state, new_state
            )));
        }
        return Ok(());
    }

    let permitted = new.migration_context == 0
        && match (old_state, new_state) {
            (MigrationState::None, MigrationState::None) => true,
            (MigrationState::None, MigrationState::Start) => orderer.consensus_type == TYPE_KAFKA,
            (MigrationState::Start, MigrationState::Start) => true,
            (MigrationState::Start, MigrationState::Abort) => orderer.consensus_type == TYPE_KAFKA,
            (MigrationState::Commit, MigrationState::None) => {
                orderer.consensus_type == TYPE_ETCDRAFT
            }
            (MigrationState::Abort, MigrationState::None) => orderer.consensus_type == TYPE_KAFKA,
            (MigrationState::Abort, MigrationState::Start) => orderer.consensus_type == TYPE_KAFKA,
            (MigrationState::Context, MigrationState::None) => {
                orderer.consensus_type == TYPE_ETCDRAFT
            }
            _ => false,
        };
    if !permitted {
        return Err(ChainError::Validation(format!(
            "Consensus type {}, unexpected migration state transition: {} to {}",
            orderer.consensus_type, old_state, new_state
        )));
    }
    Ok(())
}
