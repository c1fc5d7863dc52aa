//! Decides which nodes need their own remote session.
//!
//! A node that shares its parent's host runs inside the parent's session. The nearest ancestor
//! (or the node itself) that does not is the node's *session owner*; every command aimed at the
//! node actually runs on the owner's host.

use crate::core::topology::{Address, Node, NodeId, Tier, Topology};

/// Whether two addresses name the same host. Ports are not compared.
pub fn same_host(a: &Address, b: &Address) -> bool {
    a.host.eq_ignore_ascii_case(&b.host)
}

/// Whether `id` is network-local to its parent. The coordinator never is, since the operator's
/// machine is not assumed to be co-located with it.
pub fn resolve(topology: &Topology, id: NodeId) -> bool {
    let node = topology.node(id);
    match topology.parent(node) {
        Some(parent) => same_host(&node.address, &parent.address),
        None => false,
    }
}

/// The node whose session commands for `id` run in. Sensors are owned by their edge's owner.
pub fn session_owner(topology: &Topology, id: NodeId) -> &Node {
    let mut node = executing_node(topology, id);
    while node.is_local_to_parent() {
        // Only the root has no parent, and the root is never local.
        match topology.parent(node) {
            Some(parent) => node = parent,
            None => break,
        }
    }
    node
}

/// The session owners an artifact passes through on its way to `id`, starting at the
/// coordinator. Each entry is one copy hop.
pub fn copy_chain(topology: &Topology, id: NodeId) -> Vec<NodeId> {
    let node = executing_node(topology, id);
    let mut chain: Vec<NodeId> = std::iter::once(node)
        .chain(topology.ancestors(node))
        .filter(|n| !n.is_local_to_parent())
        .map(|n| n.id)
        .collect();
    chain.reverse();
    chain
}

/// Sensors never execute anything, so anything aimed at one is handled by its edge.
fn executing_node(topology: &Topology, id: NodeId) -> &Node {
    let node = topology.node(id);
    match (node.tier, topology.parent(node)) {
        (Tier::Sensor, Some(edge)) => edge,
        _ => node,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // hq(X) -> north(X) -> gate-a(Y) -> cam(Z)
    //       -> south(Y) -> gate-b(Y)
    fn topology() -> Topology {
        Topology::from_yaml(
            r#"
coordinator:
  name: hq
  host: 10.0.0.1
  regionals:
    - name: north
      host: 10.0.0.1
      edges:
        - name: gate-a
          host: 10.0.0.2
          sensors:
            - {device: cam, host: 10.0.0.3}
    - name: south
      host: 10.0.0.2
      edges:
        - {name: gate-b, host: 10.0.0.2}
"#,
        )
        .unwrap()
    }

    fn id(t: &Topology, path: &[&str]) -> NodeId {
        t.find(path).unwrap().id
    }

    mod resolve {
        use super::*;

        #[test]
        fn root_is_remote() {
            let t = topology();
            assert!(!resolve(&t, t.root().id));
        }

        #[test]
        fn matches_cached_flag() {
            let t = topology();
            for node in t.iter() {
                assert_eq!(node.is_local_to_parent(), resolve(&t, node.id), "{}", node.name);
            }
        }

        #[test]
        fn host_comparison_ignores_case() {
            assert!(same_host(&Address::ssh("Gate.Local"), &Address::new("gate.local", 2222)));
        }
    }

    mod session_owner {
        use super::*;

        #[test]
        fn local_nodes_defer_to_ancestor() {
            let t = topology();
            assert_eq!("hq", session_owner(&t, id(&t, &["north"])).name);
            assert_eq!("south", session_owner(&t, id(&t, &["south", "gate-b"])).name);
        }

        #[test]
        fn remote_nodes_own_themselves() {
            let t = topology();
            assert_eq!("gate-a", session_owner(&t, id(&t, &["north", "gate-a"])).name);
        }

        #[test]
        fn sensors_defer_to_edge() {
            let t = topology();
            let cam = id(&t, &["north", "gate-a", "cam"]);
            assert_eq!("gate-a", session_owner(&t, cam).name);
        }
    }

    mod copy_chain {
        use super::*;

        fn names(t: &Topology, chain: Vec<NodeId>) -> Vec<&str> {
            chain.into_iter().map(|id| t.node(id).name.as_str()).collect()
        }

        #[test]
        fn skips_local_hops() {
            let t = topology();
            let chain = copy_chain(&t, id(&t, &["north", "gate-a"]));
            assert_eq!(vec!["hq", "gate-a"], names(&t, chain));

            let chain = copy_chain(&t, id(&t, &["south", "gate-b"]));
            assert_eq!(vec!["hq", "south"], names(&t, chain));
        }

        #[test]
        fn root_takes_one_hop() {
            let t = topology();
            assert_eq!(vec![t.root().id], copy_chain(&t, t.root().id));
        }
    }
}
