//! Fleet topology discovery

use crate::operations::GetFleetNodes;
use crate::{Error, Result};
use serde::Serialize;
use session_executor::{NodeIdentity, RemoteExecutionSession};
use tracing::{debug, info};

/// Primary node plus every member, in discovery order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FleetTopology {
    /// Node holding the farm's primary role
    pub primary: NodeIdentity,
    /// All members including the primary
    pub nodes: Vec<NodeIdentity>,
}

impl FleetTopology {
    /// Topology of a supplied node list; the first node is the primary
    pub fn from_nodes(nodes: Vec<NodeIdentity>) -> Result<Self> {
        let primary = nodes.first().cloned().ok_or(Error::EmptyFleet)?;
        Ok(Self { primary, nodes })
    }

    /// Number of members
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the fleet has no members
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Enumerates fleet members through a session to the primary
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeTopologyDiscovery;

impl NodeTopologyDiscovery {
    /// Ask the node behind `session` for the fleet membership
    ///
    /// Discovered names that address a machine in `known` keep the known
    /// identity, so local markers and transport hints survive discovery.
    pub async fn discover(
        &self,
        session: &mut RemoteExecutionSession,
        known: &[NodeIdentity],
    ) -> Result<FleetTopology> {
        let members = session.call(&GetFleetNodes).await?;
        debug!(node = %session.node(), count = members.len(), "fleet members reported");

        let mut primary = None;
        let mut nodes: Vec<NodeIdentity> = Vec::with_capacity(members.len());
        for member in members {
            let discovered = NodeIdentity::parse(&member.name)?;
            let node = known
                .iter()
                .find(|k| k.same_machine(&discovered))
                .cloned()
                .unwrap_or(discovered);
            if nodes.iter().any(|n| n.same_machine(&node)) {
                continue;
            }
            if member.is_primary && primary.is_none() {
                primary = Some(node.clone());
            }
            nodes.push(node);
        }

        let primary = match primary {
            Some(p) => p,
            None => nodes.first().cloned().ok_or(Error::EmptyFleet)?,
        };
        info!(primary = %primary, nodes = nodes.len(), "discovered fleet");
        Ok(FleetTopology { primary, nodes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use session_executor::OperationResult;
    use session_executor::testing::Script;
    use std::sync::Arc;

    async fn discover_with(records: Vec<Value>, known: &[NodeIdentity]) -> Result<FleetTopology> {
        let script = Script::new().on("Get-FleetNodes", move |_| {
            Ok(OperationResult::from_records(records.clone()))
        });
        let mut session = RemoteExecutionSession::new(
            NodeIdentity::new("adfs01"),
            Box::new(script.transport("adfs01")),
            Arc::new(crate::operations::bundled_library().unwrap()),
        );
        session.initialize().await.unwrap();
        let topology = NodeTopologyDiscovery.discover(&mut session, known).await;
        session.terminate().await;
        topology
    }

    #[smol_potat::test]
    async fn test_flagged_member_is_primary() {
        let topology = discover_with(
            vec![
                json!({"name": "adfs01.corp.local", "is_primary": false}),
                json!({"name": "adfs02.corp.local", "is_primary": true}),
            ],
            &[],
        )
        .await
        .unwrap();
        assert_eq!(topology.primary.name(), "adfs02.corp.local");
        assert_eq!(topology.len(), 2);
    }

    #[smol_potat::test]
    async fn test_first_member_is_primary_when_none_flagged() {
        let topology = discover_with(
            vec![json!({"name": "adfs03"}), json!({"name": "adfs04"})],
            &[],
        )
        .await
        .unwrap();
        assert_eq!(topology.primary.name(), "adfs03");
    }

    #[smol_potat::test]
    async fn test_empty_fleet_is_fatal() {
        let err = discover_with(vec![], &[]).await.unwrap_err();
        assert!(matches!(err, Error::EmptyFleet));
    }

    #[smol_potat::test]
    async fn test_known_identities_survive_discovery() {
        let known = vec![NodeIdentity::parse("adfs01|localmachine").unwrap()];
        let topology = discover_with(
            vec![
                json!({"name": "ADFS01.corp.local", "is_primary": true}),
                json!({"name": "adfs02.corp.local"}),
                json!({"name": "adfs02.corp.local"}),
            ],
            &known,
        )
        .await
        .unwrap();
        assert!(topology.primary.is_local());
        assert_eq!(topology.len(), 2);
    }

    #[test]
    fn test_supplied_list_topology() {
        let nodes = vec![NodeIdentity::new("a"), NodeIdentity::new("b")];
        let topology = FleetTopology::from_nodes(nodes).unwrap();
        assert_eq!(topology.primary.name(), "a");
        assert!(matches!(FleetTopology::from_nodes(vec![]), Err(Error::EmptyFleet)));
    }
}
