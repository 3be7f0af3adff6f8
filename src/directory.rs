//! Service directory
//!
//! In-memory registry of what connected agents offer (services, filed per data
//! model) and who they are (one identity description per agent). Both
//! namespaces are searched with the same [`QueryModel::check`] matching.
//!
//! The directory is single-writer: only the scheduler worker mutates it.
//! Results come back in agent-id order, so identical directory state always
//! yields identical result order.

use crate::schema::{Instance, QueryModel};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Registry of agent services and identity descriptions
#[derive(Debug, Default)]
pub struct ServiceDirectory {
    /// agent id -> data model name -> service instance
    services: BTreeMap<String, BTreeMap<String, Instance>>,
    /// agent id -> identity description
    identities: BTreeMap<String, Instance>,
}

impl ServiceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// File a service under (agent, model name), replacing any previous entry
    pub fn register(&mut self, agent_id: &str, instance: Instance) {
        let model = instance.model().name().to_string();
        let replaced = self
            .services
            .entry(agent_id.to_string())
            .or_default()
            .insert(model.clone(), instance)
            .is_some();

        if replaced {
            debug!(agent_id = %agent_id, model = %model, "Replaced service registration");
        } else {
            info!(agent_id = %agent_id, model = %model, "Registered service");
        }
    }

    /// Remove the service filed under (agent, model name). Absent entries are ignored.
    pub fn unregister(&mut self, agent_id: &str, instance: &Instance) -> bool {
        let model = instance.model().name();
        let Some(by_model) = self.services.get_mut(agent_id) else {
            return false;
        };
        let removed = by_model.remove(model).is_some();
        if by_model.is_empty() {
            self.services.remove(agent_id);
        }
        if removed {
            info!(agent_id = %agent_id, model = %model, "Unregistered service");
        }
        removed
    }

    /// Agents with at least one service satisfying the query
    pub fn query(&self, query: &QueryModel) -> Vec<String> {
        self.services
            .iter()
            .filter(|(_, by_model)| by_model.values().any(|instance| query.check(instance)))
            .map(|(agent_id, _)| agent_id.clone())
            .collect()
    }

    /// Set the identity description of an agent, replacing any previous one
    pub fn register_identity(&mut self, agent_id: &str, instance: Instance) {
        debug!(agent_id = %agent_id, model = %instance.model().name(), "Registered identity");
        self.identities.insert(agent_id.to_string(), instance);
    }

    pub fn unregister_identity(&mut self, agent_id: &str) -> bool {
        self.identities.remove(agent_id).is_some()
    }

    pub fn identity(&self, agent_id: &str) -> Option<&Instance> {
        self.identities.get(agent_id)
    }

    /// Agents whose identity description satisfies the query
    pub fn query_identities(&self, query: &QueryModel) -> Vec<String> {
        self.identities
            .iter()
            .filter(|(_, instance)| query.check(instance))
            .map(|(agent_id, _)| agent_id.clone())
            .collect()
    }

    /// Services registered by an agent, in model-name order
    pub fn services_of(&self, agent_id: &str) -> Vec<&Instance> {
        self.services
            .get(agent_id)
            .map(|by_model| by_model.values().collect())
            .unwrap_or_default()
    }

    /// Drop every entry referencing the agent, in both namespaces
    pub fn remove_agent(&mut self, agent_id: &str) {
        let services = self.services.remove(agent_id).map_or(0, |m| m.len());
        let identity = self.identities.remove(agent_id).is_some();
        if services > 0 || identity {
            debug!(
                agent_id = %agent_id,
                services,
                identity,
                "Removed agent from directory"
            );
        }
    }

    /// Total number of service registrations
    pub fn service_count(&self) -> usize {
        self.services.values().map(BTreeMap::len).sum()
    }

    pub fn identity_count(&self) -> usize {
        self.identities.len()
    }
}
